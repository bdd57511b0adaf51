// ==============================================================================
// annotator/mod.rs - Resilient Chunked Annotator
// ==============================================================================
// Description: Runs an external annotation tool over VCF sites in fixed-size
//              chunks with exponential backoff and resumable output
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Pipeline per chunk:
//   1. Write sites-only VCF payload into an isolated temp dir
//   2. Invoke tool; on failure sleep base * 2^(k-1) and retry
//   3. Map report lines onto the 33-column contract (arity errors are fatal)
//   4. Append rows to the part file, advance checkpoint, notify the sink
// ==============================================================================

pub mod chunk;
pub mod mapping;
pub mod output;
pub mod retry;
pub mod tool;

use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use validator::Validate;

use crate::config::AnnotatorConfig;
use crate::models::JobId;
use crate::parsers::detect::{self, DetectError, Layout};
use crate::parsers::vcf::{site_lines, sites_only, SITES_ONLY_HEADER};
use crate::schema::{self, AnnotatedRow, SchemaError};
use crate::store::{StagingSink, StoreError};

use chunk::{Chunk, Chunker};
use output::PartWriter;
use tool::{AnnotationTool, ToolError};

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open input: {0}")]
    Input(#[from] DetectError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("TSV write error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid annotator configuration: {0}")]
    Config(#[from] validator::ValidationErrors),

    #[error("{0:?} is not a VCF; only VCF sites can be annotated")]
    NotVcf(PathBuf),

    #[error("Chunk {chunk} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        chunk: usize,
        attempts: u32,
        #[source]
        source: ToolError,
    },

    #[error("Checkpoint chunk size {checkpoint} does not match configured {configured}")]
    ChunkSizeMismatch { checkpoint: usize, configured: usize },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Staging sink error: {0}")]
    Sink(#[from] StoreError),
}

/// Outcome of a completed annotation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationSummary {
    pub output: PathBuf,
    /// Chunks annotated in this run
    pub chunks: usize,
    /// Chunks skipped because a previous run flushed them
    pub chunks_resumed: usize,
    /// Rows in the final output, including resumed chunks
    pub rows: u64,
    /// Failed attempts that were retried
    pub retries: u32,
}

/// Where annotated rows are mirrored besides the output file
pub struct SinkTarget<'a> {
    pub sink: &'a dyn StagingSink,
    pub job_id: JobId,
    /// Added to chunk indexes when one job annotates several files
    pub chunk_offset: usize,
}

pub struct ChunkedAnnotator<T> {
    config: AnnotatorConfig,
    tool: T,
}

impl<T: AnnotationTool> ChunkedAnnotator<T> {
    pub fn new(config: AnnotatorConfig, tool: T) -> Result<Self, AnnotateError> {
        config.validate()?;
        Ok(Self { config, tool })
    }

    /// Annotate every site of `input` into `output`
    pub async fn run(&self, input: &Path, output: &Path) -> Result<AnnotationSummary, AnnotateError> {
        self.run_with_sink(input, output, None).await
    }

    /// Annotate and mirror each flushed chunk into a staging sink
    pub async fn run_with_sink(
        &self,
        input: &Path,
        output: &Path,
        sink: Option<SinkTarget<'_>>,
    ) -> Result<AnnotationSummary, AnnotateError> {
        if let Some(columns) = &self.config.columns_file {
            schema::verify_column_file(columns)?;
        }

        let detection = detect::detect(input)?;
        if !matches!(detection.layout, Layout::Vcf) {
            return Err(AnnotateError::NotVcf(input.to_path_buf()));
        }
        let reader = detect::open_text(input, &detection)?;

        let mut writer = PartWriter::open(output, self.config.chunk_size, self.config.resume)?;
        let chunks_resumed = writer.chunks_flushed();

        info!(
            "Annotating {:?} -> {:?} (chunk size {}, {} chunks already flushed)",
            input, output, self.config.chunk_size, chunks_resumed
        );

        let mut chunks = 0;
        let mut retries = 0;

        for chunk in Chunker::new(site_lines(reader), self.config.chunk_size) {
            let chunk = chunk?;
            if chunk.index < chunks_resumed {
                continue;
            }

            let (rows, chunk_retries) = self.annotate_chunk(&chunk).await?;
            retries += chunk_retries;

            if let Some(target) = &sink {
                target
                    .sink
                    .append_annotated_rows(target.job_id, target.chunk_offset + chunk.index, &rows)
                    .await?;
            }
            writer.write_chunk(&rows)?;
            chunks += 1;

            info!(
                "Chunk {} flushed: {} input lines, {} rows",
                chunk.index,
                chunk.lines.len(),
                rows.len()
            );
        }

        let (output, checkpoint) = writer.finish()?;
        info!("Wrote {} records to {:?}", checkpoint.rows_written, output);

        Ok(AnnotationSummary {
            output,
            chunks,
            chunks_resumed,
            rows: checkpoint.rows_written,
            retries,
        })
    }

    /// Annotate one chunk, retrying tool failures with backoff
    async fn annotate_chunk(&self, chunk: &Chunk) -> Result<(Vec<AnnotatedRow>, u32), AnnotateError> {
        let policy = self.config.retry_policy();
        let mut failures = 0u32;

        loop {
            let report = match self.invoke(chunk).await {
                Ok(report) => report,
                Err(e) => {
                    failures += 1;
                    match policy.delay_after(failures) {
                        Some(delay) => {
                            warn!(
                                "Chunk {} attempt {} failed: {}; retrying in {:?}",
                                chunk.index, failures, e, delay
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        None => {
                            return Err(AnnotateError::RetriesExhausted {
                                chunk: chunk.index,
                                attempts: failures,
                                source: e,
                            })
                        }
                    }
                }
            };

            // Contract violations are not transient
            let rows = mapping::parse_report(&report)?;
            return Ok((rows, failures));
        }
    }

    /// One tool invocation against a fresh payload directory
    async fn invoke(&self, chunk: &Chunk) -> Result<String, ToolError> {
        let dir = tempfile::tempdir().map_err(ToolError::Payload)?;
        let payload = dir.path().join("chunk.vcf");
        write_payload(&payload, &chunk.lines).map_err(ToolError::Payload)?;
        self.tool.annotate(&payload).await
    }
}

/// Minimal valid VCF: fileformat line, 8-column header, sites-only records
fn write_payload(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    out.write_all(SITES_ONLY_HEADER.as_bytes())?;
    for line in lines {
        out.write_all(sites_only(line).as_bytes())?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::header_line;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Emits one report row per payload site; fails on demand
    struct FakeTool {
        calls: AtomicU32,
        fail_first: u32,
        /// Positions whose chunk always fails
        poison: Option<String>,
        payloads: Mutex<Vec<String>>,
    }

    impl FakeTool {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                poison: None,
                payloads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnnotationTool for FakeTool {
        async fn annotate(&self, input_vcf: &Path) -> Result<String, ToolError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let payload = std::fs::read_to_string(input_vcf).map_err(ToolError::Payload)?;
            self.payloads.lock().unwrap().push(payload.clone());

            if call <= self.fail_first {
                return Err(ToolError::NonZeroExit {
                    code: Some(2),
                    stderr: "cache busy".to_string(),
                });
            }
            if let Some(poison) = &self.poison {
                if payload.contains(poison.as_str()) {
                    return Err(ToolError::NonZeroExit {
                        code: Some(1),
                        stderr: "poisoned".to_string(),
                    });
                }
            }

            let mut report = String::from("## fake\n#Location\tAllele\tREF_ALLELE\tExisting_variation\n");
            for line in payload.lines().filter(|l| !l.starts_with('#')) {
                let f: Vec<&str> = line.split('\t').collect();
                report.push_str(&format!("{}:{}\t{}\t{}\t{}\n", f[0], f[1], f[4], f[3], f[2]));
            }
            Ok(report)
        }
    }

    fn write_vcf(dir: &TempDir, sites: usize) -> PathBuf {
        let mut vcf = String::from(
            "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\n",
        );
        for i in 0..sites {
            vcf.push_str(&format!("1\t{}\trs{}\tA\tG\t.\tPASS\t.\tGT\t0/1\n", 1000 + i, i));
        }
        let path = dir.path().join("input.vcf");
        std::fs::write(&path, vcf).unwrap();
        path
    }

    fn config(chunk_size: usize, max_retries: u32) -> AnnotatorConfig {
        AnnotatorConfig {
            chunk_size,
            max_retries,
            backoff_base: Duration::from_secs(5),
            ..AnnotatorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_success() {
        let dir = TempDir::new().unwrap();
        let input = write_vcf(&dir, 3);
        let output = dir.path().join("out.tsv");

        let annotator = ChunkedAnnotator::new(config(100, 4), FakeTool::new(3)).unwrap();
        let start = tokio::time::Instant::now();
        let summary = annotator.run(&input, &output).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(35), "slept {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(36), "slept {:?}", elapsed);
        assert_eq!(annotator.tool.calls.load(Ordering::SeqCst), 4);
        assert_eq!(summary.retries, 3);
        assert_eq!(summary.rows, 3);

        let contents = std::fs::read_to_string(&output).unwrap();
        assert_eq!(contents.lines().count(), 4);
        assert_eq!(contents.matches("rs1\t").count(), 2); // rsid + existing_variation
    }

    #[tokio::test]
    async fn test_genotype_array_input_is_rejected_before_the_tool_runs() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("kit.txt");
        std::fs::write(&input, "# rsid\tchromosome\tposition\tgenotype\nrs1\t1\t100\tAG\n").unwrap();
        let out = dir.path().join("out.tsv");

        let annotator = ChunkedAnnotator::new(config(100, 4), FakeTool::new(0)).unwrap();
        assert!(matches!(
            annotator.run(&input, &out).await,
            Err(AnnotateError::NotVcf(path)) if path == input
        ));
        assert_eq!(annotator.tool.calls.load(Ordering::SeqCst), 0);
        assert!(!output::part_path(&out).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_leave_part_file() {
        let dir = TempDir::new().unwrap();
        let input = write_vcf(&dir, 3);
        let output = dir.path().join("out.tsv");

        let annotator = ChunkedAnnotator::new(config(10, 2), FakeTool::new(u32::MAX)).unwrap();
        let err = annotator.run(&input, &output).await.unwrap_err();

        assert!(matches!(err, AnnotateError::RetriesExhausted { chunk: 0, attempts: 3, .. }));
        assert!(!output.exists());
        assert_eq!(
            std::fs::read_to_string(output::part_path(&output)).unwrap(),
            format!("{}\n", header_line())
        );
    }

    #[tokio::test]
    async fn test_payload_is_sites_only_and_chunked() {
        let dir = TempDir::new().unwrap();
        let input = write_vcf(&dir, 5);
        let output = dir.path().join("out.tsv");

        let annotator = ChunkedAnnotator::new(config(2, 0), FakeTool::new(0)).unwrap();
        let summary = annotator.run(&input, &output).await.unwrap();
        assert_eq!(summary.chunks, 3);

        let payloads = annotator.tool.payloads.lock().unwrap().clone();
        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].starts_with("##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n"));
        assert!(payloads[0].contains("1\t1000\trs0\tA\tG\t.\tPASS\t.\n"));
        assert!(!payloads[0].contains("GT"));
        assert_eq!(payloads[2].lines().filter(|l| !l.starts_with('#')).count(), 1);
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let dir = TempDir::new().unwrap();
        let input = write_vcf(&dir, 5);

        let clean = dir.path().join("clean.tsv");
        ChunkedAnnotator::new(config(2, 0), FakeTool::new(0))
            .unwrap()
            .run(&input, &clean)
            .await
            .unwrap();

        let output = dir.path().join("out.tsv");
        let mut failing = FakeTool::new(0);
        failing.poison = Some("\t1002\t".to_string());
        let err = ChunkedAnnotator::new(config(2, 0), failing)
            .unwrap()
            .run(&input, &output)
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotateError::RetriesExhausted { chunk: 1, .. }));

        let mut resumed_config = config(2, 0);
        resumed_config.resume = true;
        let resumed = ChunkedAnnotator::new(resumed_config, FakeTool::new(0)).unwrap();
        let summary = resumed.run(&input, &output).await.unwrap();

        assert_eq!(summary.chunks_resumed, 1);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.rows, 5);
        assert_eq!(resumed.tool.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            std::fs::read_to_string(&clean).unwrap()
        );
    }

    #[tokio::test]
    async fn test_schema_errors_are_not_retried() {
        struct Headless;

        #[async_trait]
        impl AnnotationTool for Headless {
            async fn annotate(&self, _input_vcf: &Path) -> Result<String, ToolError> {
                Ok("1:100\tA\n".to_string())
            }
        }

        let dir = TempDir::new().unwrap();
        let input = write_vcf(&dir, 1);
        let err = ChunkedAnnotator::new(config(10, 4), Headless)
            .unwrap()
            .run(&input, &dir.path().join("out.tsv"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotateError::Schema(SchemaError::MissingHeader(_))));
    }

    #[tokio::test]
    async fn test_rows_mirrored_into_sink() {
        let dir = TempDir::new().unwrap();
        let input = write_vcf(&dir, 3);
        let store = MemoryStore::new();

        let annotator = ChunkedAnnotator::new(config(2, 0), FakeTool::new(0)).unwrap();
        annotator
            .run_with_sink(
                &input,
                &dir.path().join("out.tsv"),
                Some(SinkTarget {
                    sink: &store,
                    job_id: 11,
                    chunk_offset: 0,
                }),
            )
            .await
            .unwrap();

        let rows = store.annotated_rows(11);
        assert_eq!(rows.len(), 3);
        let positions: HashSet<&str> = rows.iter().filter_map(|r| r.get("pos")).collect();
        assert_eq!(positions.len(), 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            ChunkedAnnotator::new(config(0, 1), FakeTool::new(0)),
            Err(AnnotateError::Config(_))
        ));
    }
}
