// ==============================================================================
// processor.rs - Job Processing Pipeline
// ==============================================================================
// Description: Resolves a claimed job's payload, normalizes it into call
//              records, stages them and optionally annotates VCF payloads
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Storage locators:
//   uploads/abc.txt         relative to the data directory
//   /abs/path/abc.txt       used as is
//   db://uploads/<sha256>   blob loaded from the store into a temp file
// Archive jobs point at an already extracted directory; every regular file in
// it (sorted, hidden files skipped) is detected and normalized on its own.
// ==============================================================================

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::annotator::tool::{AnnotationTool, VepCommand};
use crate::annotator::{AnnotationSummary, ChunkedAnnotator, SinkTarget};
use crate::config::{WorkerAnnotation, WorkerConfig};
use crate::models::{CallRecord, FileKind, Job, JobId};
use crate::parsers::detect::{self, Layout};
use crate::parsers::{ArrayNormalizer, NormalizeSummary, VcfNormalizer};
use crate::store::{blob_key, JobStore, StagingSink};

/// Result of processing one job
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    /// Call records staged for the job
    pub inserted: u64,
    pub summary: NormalizeSummary,
    /// Payload files normalized (1 for plain jobs)
    pub files: usize,
    pub annotations: Vec<AnnotationSummary>,
}

/// One normalized payload file
struct NormalizedFile {
    records: Vec<CallRecord>,
    summary: NormalizeSummary,
    is_vcf: bool,
}

/// Payload location, keeping any temp file alive while in use
enum Source {
    Path(PathBuf),
    Blob(NamedTempFile),
}

impl Source {
    fn path(&self) -> &Path {
        match self {
            Source::Path(path) => path,
            Source::Blob(file) => file.path(),
        }
    }
}

pub struct JobProcessor {
    data_dir: PathBuf,
    verify_digest: bool,
    annotation: Option<(PathBuf, ChunkedAnnotator<Box<dyn AnnotationTool>>)>,
}

impl JobProcessor {
    pub fn new(data_dir: PathBuf, verify_digest: bool) -> Self {
        Self {
            data_dir,
            verify_digest,
            annotation: None,
        }
    }

    /// Processor for the worker, with VEP annotation when configured
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        let processor = Self::new(config.data_dir.clone(), config.verify_digest);
        match &config.annotation {
            Some(WorkerAnnotation { output_dir, annotator }) => {
                let tool: Box<dyn AnnotationTool> = Box::new(VepCommand::new(annotator.tool.clone()));
                let annotator = ChunkedAnnotator::new(annotator.clone(), tool)
                    .context("Invalid annotator configuration")?;
                Ok(processor.with_annotator(output_dir.clone(), annotator))
            }
            None => Ok(processor),
        }
    }

    /// Annotate VCF payloads into `output_dir` after staging
    pub fn with_annotator(mut self, output_dir: PathBuf, annotator: ChunkedAnnotator<Box<dyn AnnotationTool>>) -> Self {
        self.annotation = Some((output_dir, annotator));
        self
    }

    /// Process a claimed job end to end
    pub async fn process<S>(&self, store: &S, job: &Job) -> Result<JobOutcome>
    where
        S: JobStore + StagingSink,
    {
        info!("Processing job {} ({}, {})", job.id, job.original_name, job.file_kind.as_str());

        let source = self.resolve(store, job).await?;
        let files = self.payload_files(job, source.path())?;
        let label = job.effective_sample_label();

        let mut outcome = JobOutcome::default();
        let mut records = Vec::new();
        let mut vcf_files = Vec::new();

        for path in &files {
            let file_path = path.clone();
            let file_label = label.clone();
            let job_id = job.id;
            let normalized = tokio::task::spawn_blocking(move || normalize_file(job_id, &file_label, &file_path))
                .await
                .context("Normalization task panicked")?;

            match normalized {
                Ok(file) => {
                    info!(
                        "Job {}: {:?} -> {} records ({} lines skipped)",
                        job.id,
                        path,
                        file.summary.accepted,
                        file.summary.skipped_total()
                    );
                    if file.is_vcf {
                        vcf_files.push(path.clone());
                    }
                    outcome.files += 1;
                    outcome.summary.merge(file.summary);
                    records.extend(file.records);
                }
                // A stray unreadable file inside an archive does not sink the job
                Err(e) if job.file_kind == FileKind::Archive => {
                    warn!("Job {}: skipping {:?}: {:#}", job.id, path, e);
                }
                Err(e) => return Err(e.context(format!("Failed to normalize {:?}", path))),
            }
        }

        if outcome.files == 0 {
            bail!("No readable payload files for job {}", job.id);
        }

        outcome.inserted = store
            .replace_call_records(job.id, &records)
            .await
            .context("Failed to stage call records")?;

        if let Some((output_dir, annotator)) = &self.annotation {
            let mut chunk_offset = 0;
            for (n, vcf) in vcf_files.iter().enumerate() {
                let output = annotation_output(output_dir, job.id, n);
                let summary = annotator
                    .run_with_sink(
                        vcf,
                        &output,
                        Some(SinkTarget {
                            sink: store,
                            job_id: job.id,
                            chunk_offset,
                        }),
                    )
                    .await
                    .with_context(|| format!("Annotation of {:?} failed", vcf))?;
                chunk_offset += summary.chunks_resumed + summary.chunks;
                outcome.annotations.push(summary);
            }
        }

        Ok(outcome)
    }

    /// Turn the job's locator into a readable local path
    async fn resolve<S: JobStore>(&self, store: &S, job: &Job) -> Result<Source> {
        if let Some(sha) = blob_key(&job.stored_path) {
            let bytes = store
                .fetch_blob(sha)
                .await
                .context("Failed to load upload blob")?
                .ok_or_else(|| anyhow!("No blob stored for {}", job.stored_path))?;

            if self.verify_digest {
                verify(sha, &sha256_bytes(&bytes))?;
            }

            let mut file = NamedTempFile::new().context("Failed to create blob temp file")?;
            file.write_all(&bytes)?;
            file.flush()?;
            return Ok(Source::Blob(file));
        }

        let path = PathBuf::from(&job.stored_path);
        let path = if path.is_absolute() { path } else { self.data_dir.join(path) };
        if !path.exists() {
            bail!("Stored payload not found: {:?}", path);
        }

        if self.verify_digest && job.file_kind == FileKind::Plain {
            if let Some(expected) = job.sha256.as_deref().filter(|s| !s.is_empty()) {
                let digest_path = path.clone();
                let actual = tokio::task::spawn_blocking(move || sha256_file(&digest_path))
                    .await
                    .context("Digest task panicked")?
                    .context("Failed to hash payload")?;
                verify(expected, &actual)?;
            }
        }

        Ok(Source::Path(path))
    }

    /// Files to normalize for a job
    fn payload_files(&self, job: &Job, path: &Path) -> Result<Vec<PathBuf>> {
        match job.file_kind {
            FileKind::Plain => {
                if !path.is_file() {
                    bail!("Expected a file for plain job {}: {:?}", job.id, path);
                }
                Ok(vec![path.to_path_buf()])
            }
            FileKind::Archive => {
                if !path.is_dir() {
                    bail!("Expected an extracted directory for archive job {}: {:?}", job.id, path);
                }
                let mut files = Vec::new();
                for entry in WalkDir::new(path)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name().to_str()))
                {
                    let entry = entry.context("Failed to walk archive directory")?;
                    if entry.file_type().is_file() {
                        files.push(entry.into_path());
                    }
                }
                if files.is_empty() {
                    bail!("Archive directory for job {} is empty", job.id);
                }
                Ok(files)
            }
        }
    }
}

fn is_hidden(name: Option<&str>) -> bool {
    name.map_or(false, |n| n.starts_with('.') || n == "__MACOSX")
}

/// Detect and normalize one payload file (blocking)
fn normalize_file(job_id: JobId, label: &str, path: &Path) -> Result<NormalizedFile> {
    let detection = detect::detect(path).with_context(|| format!("Format detection failed for {:?}", path))?;
    let reader = detect::open_text(path, &detection)?;

    match detection.layout {
        Layout::Vcf => {
            let (normalizer, mut vcf_reader) = VcfNormalizer::from_reader(job_id, label, reader)?;
            let (records, summary) = normalizer.normalize(vcf_reader.get_mut())?;
            Ok(NormalizedFile {
                records,
                summary,
                is_vcf: true,
            })
        }
        layout => {
            let normalizer = ArrayNormalizer::new(job_id, label, &layout)?;
            let (records, summary) = normalizer.normalize(reader)?;
            Ok(NormalizedFile {
                records,
                summary,
                is_vcf: false,
            })
        }
    }
}

fn annotation_output(dir: &Path, job_id: JobId, n: usize) -> PathBuf {
    match n {
        0 => dir.join(format!("job_{}.annotated.tsv", job_id)),
        n => dir.join(format!("job_{}_{}.annotated.tsv", job_id, n)),
    }
}

fn verify(expected: &str, actual: &str) -> Result<()> {
    if !expected.eq_ignore_ascii_case(actual) {
        bail!("SHA-256 mismatch: expected {}, got {}", expected, actual);
    }
    Ok(())
}

fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Streaming SHA-256 of a file, lowercase hex
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewJob};
    use tempfile::TempDir;
    use uuid::Uuid;

    const EXPORT: &str = "# rsid\tchromosome\tposition\tgenotype\nrs1\t1\t100\tAG\nrs2\t23\t200\t--\nbad line\n";

    async fn claimed(store: &MemoryStore, new: NewJob) -> Job {
        store.submit(new).await.unwrap();
        store.claim_next(Uuid::new_v4()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_relative_plain_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/kit.txt"), EXPORT).unwrap();

        let store = MemoryStore::new();
        let mut new = NewJob::plain("kit.txt", "uploads/kit.txt");
        new.sha256 = Some(sha256_bytes(EXPORT.as_bytes()).to_uppercase());
        let job = claimed(&store, new).await;

        let outcome = JobProcessor::new(dir.path().to_path_buf(), true)
            .process(&store, &job)
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.summary.skipped_total(), 1);
        let records = store.call_records(job.id);
        assert_eq!(records[0].sample_label, format!("Sample_{}", job.id));
        assert_eq!(records[1].chromosome.as_deref(), Some("X"));
        assert!(records[1].is_no_call());
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kit.txt"), EXPORT).unwrap();

        let store = MemoryStore::new();
        let mut new = NewJob::plain("kit.txt", "kit.txt");
        new.sha256 = Some("00".repeat(32));
        let job = claimed(&store, new).await;

        let err = JobProcessor::new(dir.path().to_path_buf(), true)
            .process(&store, &job)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("SHA-256 mismatch"));

        // Verification can be switched off
        assert!(JobProcessor::new(dir.path().to_path_buf(), false)
            .process(&store, &job)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_blob_locator() {
        let store = MemoryStore::new();
        let sha = sha256_bytes(EXPORT.as_bytes());
        store.insert_blob(sha.clone(), EXPORT.as_bytes().to_vec());
        let job = claimed(&store, NewJob::plain("kit.txt", format!("db://uploads/{}", sha))).await;

        let outcome = JobProcessor::new(PathBuf::from("/nonexistent"), true)
            .process(&store, &job)
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 2);
    }

    #[tokio::test]
    async fn test_submitted_sqlite_blob_resolves_once_claimed() {
        use crate::store::SqliteStore;

        let dir = TempDir::new().unwrap();
        let db = dir.path().join("jobs.db");
        let submitter = SqliteStore::open(&db).unwrap();
        let worker_store = SqliteStore::open(&db).unwrap();

        let sha = sha256_bytes(EXPORT.as_bytes());
        let mut new = NewJob::plain("kit.txt", format!("db://uploads/{}", sha));
        new.sha256 = Some(sha);
        let id = submitter.submit_with_blob(new, EXPORT.as_bytes().to_vec()).await.unwrap();

        let job = worker_store.claim_next(Uuid::new_v4()).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        let outcome = JobProcessor::new(PathBuf::from("/nonexistent"), true)
            .process(&worker_store, &job)
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(worker_store.call_record_count(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_payload_is_error() {
        let store = MemoryStore::new();
        let job = claimed(&store, NewJob::plain("gone.txt", "/nonexistent/gone.txt")).await;
        let err = JobProcessor::new(PathBuf::from("/data"), true)
            .process(&store, &job)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_archive_directory_skips_unreadable_members() {
        let dir = TempDir::new().unwrap();
        let extracted = dir.path().join("kit");
        std::fs::create_dir_all(extracted.join("nested")).unwrap();
        std::fs::write(extracted.join("a.txt"), "rsid\tgenotype\nrs1\tAA\n").unwrap();
        std::fs::write(extracted.join("nested/b.txt"), "rs2\t2\t20\tCT\n").unwrap();
        std::fs::write(extracted.join("README.txt"), "rsid\tnotes\nrs1\tsee docs\n").unwrap();
        std::fs::write(extracted.join(".DS_Store"), [0u8, 1, 2]).unwrap();

        let store = MemoryStore::new();
        let mut new = NewJob::plain("kit.zip", "kit");
        new.file_kind = FileKind::Archive;
        new.sample_label = Some("father".to_string());
        let job = claimed(&store, new).await;

        let outcome = JobProcessor::new(dir.path().to_path_buf(), true)
            .process(&store, &job)
            .await
            .unwrap();
        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.inserted, 2);

        let rsids: Vec<String> = store.call_records(job.id).into_iter().map(|r| r.rsid).collect();
        assert_eq!(rsids, vec!["rs1", "rs2"]);
        assert!(store.call_records(job.id).iter().all(|r| r.sample_label == "father"));
    }

    #[tokio::test]
    async fn test_reprocessing_replaces_records() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kit.txt"), EXPORT).unwrap();
        let store = MemoryStore::new();
        let job = claimed(&store, NewJob::plain("kit.txt", "kit.txt")).await;
        let processor = JobProcessor::new(dir.path().to_path_buf(), false);

        processor.process(&store, &job).await.unwrap();
        let first = store.call_records(job.id);
        processor.process(&store, &job).await.unwrap();
        assert_eq!(store.call_records(job.id), first);
    }

    #[test]
    fn test_annotation_output_names() {
        let dir = Path::new("/out");
        assert_eq!(annotation_output(dir, 7, 0), PathBuf::from("/out/job_7.annotated.tsv"));
        assert_eq!(annotation_output(dir, 7, 2), PathBuf::from("/out/job_7_2.annotated.tsv"));
    }
}
