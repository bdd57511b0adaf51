// ==============================================================================
// annotator/output.rs - Resumable Annotated TSV Output
// ==============================================================================
// Description: Part-file writer with a chunk checkpoint and atomic finalization
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Files for a final path `out.tsv`:
//   out.tsv.part              header + rows of every flushed chunk
//   out.tsv.part.checkpoint   JSON, rewritten (tmp + rename) after each flush
// A resumed run truncates the part file to the checkpointed length, which drops
// any rows written after the last checkpoint, then skips the flushed chunks.
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::AnnotateError;
use crate::schema::{header_line, AnnotatedRow, SchemaError, SCHEMA_VERSION};

/// Progress of a partially written output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub chunk_size: usize,
    pub chunks_flushed: usize,
    pub rows_written: u64,
    /// Part file length after the last flushed chunk
    pub part_bytes: u64,
}

/// Append `suffix` to the full file name (`a.tsv` -> `a.tsv.part`)
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn part_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, ".part")
}

pub fn checkpoint_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, ".part.checkpoint")
}

/// Writer for `<final>.part`
pub struct PartWriter {
    final_path: PathBuf,
    part_path: PathBuf,
    checkpoint_path: PathBuf,
    file: File,
    checkpoint: Checkpoint,
}

impl PartWriter {
    /// Open the part file, starting fresh or continuing a checkpointed run
    pub fn open(final_path: &Path, chunk_size: usize, resume: bool) -> Result<Self, AnnotateError> {
        let part_path = part_path(final_path);
        let checkpoint_path = checkpoint_path(final_path);

        if let Some(parent) = final_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut checkpoint = if resume {
            Self::load_checkpoint(&checkpoint_path, &part_path, chunk_size)?
        } else {
            None
        };

        if checkpoint.is_none() {
            remove_if_exists(&part_path)?;
            remove_if_exists(&checkpoint_path)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&part_path)?;

        match checkpoint.as_mut() {
            Some(cp) => {
                file.set_len(cp.part_bytes)?;
                verify_header(&part_path)?;
                info!(
                    "Resuming {:?}: {} chunks ({} rows) already flushed",
                    part_path, cp.chunks_flushed, cp.rows_written
                );
            }
            None => {
                // Header goes in exactly once, only into an empty part file
                let header = format!("{}\n", header_line());
                file.write_all(header.as_bytes())?;
                file.sync_data()?;
                checkpoint = Some(Checkpoint {
                    schema_version: SCHEMA_VERSION,
                    chunk_size,
                    chunks_flushed: 0,
                    rows_written: 0,
                    part_bytes: header.len() as u64,
                });
            }
        }

        let checkpoint = checkpoint.ok_or_else(|| AnnotateError::Checkpoint("checkpoint not initialised".to_string()))?;
        let writer = Self {
            final_path: final_path.to_path_buf(),
            part_path,
            checkpoint_path,
            file,
            checkpoint,
        };
        writer.save_checkpoint()?;
        Ok(writer)
    }

    fn load_checkpoint(
        checkpoint_path: &Path,
        part_path: &Path,
        chunk_size: usize,
    ) -> Result<Option<Checkpoint>, AnnotateError> {
        if !part_path.exists() {
            return Ok(None);
        }
        if !checkpoint_path.exists() {
            warn!("{:?} has no checkpoint; starting over", part_path);
            return Ok(None);
        }

        let raw = fs::read_to_string(checkpoint_path)?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&raw).map_err(|e| AnnotateError::Checkpoint(e.to_string()))?;

        if checkpoint.schema_version != SCHEMA_VERSION {
            return Err(AnnotateError::Checkpoint(format!(
                "schema version {} in checkpoint, current is {}",
                checkpoint.schema_version, SCHEMA_VERSION
            )));
        }
        if checkpoint.chunk_size != chunk_size {
            return Err(AnnotateError::ChunkSizeMismatch {
                checkpoint: checkpoint.chunk_size,
                configured: chunk_size,
            });
        }

        let actual = fs::metadata(part_path)?.len();
        if actual < checkpoint.part_bytes {
            return Err(AnnotateError::Checkpoint(format!(
                "part file is {} bytes, checkpoint expects at least {}",
                actual, checkpoint.part_bytes
            )));
        }

        Ok(Some(checkpoint))
    }

    pub fn chunks_flushed(&self) -> usize {
        self.checkpoint.chunks_flushed
    }

    /// Append all rows of one successful chunk, then advance the checkpoint
    pub fn write_chunk(&mut self, rows: &[AnnotatedRow]) -> Result<(), AnnotateError> {
        let mut tsv = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Never)
            .has_headers(false)
            .from_writer(Vec::new());
        for row in rows {
            tsv.write_record(row.fields())?;
        }
        let buffer = tsv
            .into_inner()
            .map_err(|e| AnnotateError::Io(e.into_error()))?;

        // Position at the checkpointed end so a failed earlier write cannot leave a gap
        self.file.set_len(self.checkpoint.part_bytes)?;
        let mut append = OpenOptions::new().append(true).open(&self.part_path)?;
        append.write_all(&buffer)?;
        append.sync_data()?;

        self.checkpoint.chunks_flushed += 1;
        self.checkpoint.rows_written += rows.len() as u64;
        self.checkpoint.part_bytes += buffer.len() as u64;
        self.save_checkpoint()
    }

    fn save_checkpoint(&self) -> Result<(), AnnotateError> {
        let tmp = with_suffix(&self.checkpoint_path, ".tmp");
        let json = serde_json::to_vec_pretty(&self.checkpoint).map_err(|e| AnnotateError::Checkpoint(e.to_string()))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.checkpoint_path)?;
        Ok(())
    }

    /// Atomically move the part file to the final path and drop the checkpoint
    pub fn finish(self) -> Result<(PathBuf, Checkpoint), AnnotateError> {
        self.file.sync_all()?;
        drop(self.file);
        fs::rename(&self.part_path, &self.final_path)?;
        remove_if_exists(&self.checkpoint_path)?;
        Ok((self.final_path, self.checkpoint))
    }
}

fn verify_header(part_path: &Path) -> Result<(), AnnotateError> {
    let mut first = String::new();
    BufReader::new(File::open(part_path)?).read_line(&mut first)?;
    if first.trim_end_matches(['\r', '\n']) != header_line() {
        return Err(SchemaError::HeaderMismatch.into());
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), AnnotateError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
