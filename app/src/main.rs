// ==============================================================================
// main.rs - Genomics Ingest Command Line
// ==============================================================================
// Description: Standalone chunked VEP annotation, dry-run normalization and a
//              single-node SQLite queue (submit / drain)
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genomics_ingest::annotator::retry::{DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES};
use genomics_ingest::annotator::tool::VepCommand;
use genomics_ingest::annotator::chunk::DEFAULT_CHUNK_SIZE;
use genomics_ingest::annotator::ChunkedAnnotator;
use genomics_ingest::config::{AnnotatorConfig, Assembly, ToolSettings, DEFAULT_CACHE_DIR, DEFAULT_REF_DIR};
use genomics_ingest::dispatcher::{Dispatcher, DispatcherConfig};
use genomics_ingest::models::FileKind;
use genomics_ingest::parsers::{detect, open_text, ArrayNormalizer, Layout, VcfNormalizer};
use genomics_ingest::processor::{sha256_file, JobProcessor};
use genomics_ingest::store::{JobStore, NewJob, SqliteStore, BLOB_LOCATOR_PREFIX};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Annotate a VCF with VEP in resumable chunks
    Annotate(AnnotateArgs),

    /// Detect and normalize a raw file without touching a store
    Normalize {
        /// Raw genotype or VCF file
        path: PathBuf,

        /// Sample label for the records
        #[arg(long, default_value = "Sample")]
        label: String,

        /// Print every record as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Register a file as a job in a SQLite queue
    Submit {
        /// SQLite queue database
        #[arg(long, env = "INGEST_SQLITE")]
        db: PathBuf,

        /// File (or extracted archive directory) to ingest
        path: PathBuf,

        #[arg(long)]
        label: Option<String>,

        /// Store the payload in the database instead of referencing the path
        #[arg(long)]
        blob: bool,
    },

    /// Process every claimable job in a SQLite queue, then exit
    Drain {
        #[arg(long, env = "INGEST_SQLITE")]
        db: PathBuf,

        /// Base directory for relative locators
        #[arg(long, env = "DATA_DIR", default_value = "/data")]
        data_dir: PathBuf,

        /// Skip SHA-256 verification of plain payloads
        #[arg(long)]
        no_verify: bool,
    },
}

#[derive(Args, Debug)]
struct AnnotateArgs {
    /// Input VCF (.vcf or .vcf.gz)
    #[arg(long, env = "VCF")]
    vcf: PathBuf,

    /// Final annotated TSV
    #[arg(long, env = "OUT_TSV")]
    out_tsv: PathBuf,

    #[arg(long, value_enum, env = "VEP_ASSEMBLY", default_value = "GRCh38")]
    assembly: Assembly,

    #[arg(long, env = "VEP_FORKS", default_value_t = 4)]
    forks: u32,

    #[arg(long, env = "VEP_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Retries per chunk after the first attempt
    #[arg(long, env = "VEP_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    #[arg(long, env = "VEP_CACHE_DIR", default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    #[arg(long, env = "VEP_REF_DIR", default_value = DEFAULT_REF_DIR)]
    ref_dir: PathBuf,

    /// Continue from an existing .part file and checkpoint
    #[arg(long)]
    resume: bool,

    #[arg(long, env = "VEP_PATH", default_value = "vep")]
    vep_path: PathBuf,

    /// Column file that must match the output contract
    #[arg(long, env = "VEP_COLUMNS_FILE")]
    columns_file: Option<PathBuf>,

    #[arg(long, env = "VEP_BACKOFF_BASE_SEC", default_value_t = DEFAULT_BACKOFF_BASE.as_secs())]
    backoff_base_sec: u64,
}

impl AnnotateArgs {
    fn config(&self) -> AnnotatorConfig {
        AnnotatorConfig {
            chunk_size: self.chunk_size,
            max_retries: self.max_retries,
            backoff_base: Duration::from_secs(self.backoff_base_sec),
            resume: self.resume,
            columns_file: self.columns_file.clone(),
            tool: ToolSettings {
                vep_path: self.vep_path.clone(),
                assembly: self.assembly,
                cache_dir: self.cache_dir.clone(),
                ref_dir: self.ref_dir.clone(),
                forks: self.forks,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genomics_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Annotate(args) => annotate(args).await,
        Command::Normalize { path, label, json } => normalize(path, label, json).await,
        Command::Submit { db, path, label, blob } => submit(db, path, label, blob).await,
        Command::Drain { db, data_dir, no_verify } => drain(db, data_dir, !no_verify).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn annotate(args: AnnotateArgs) -> Result<()> {
    let config = args.config();
    let tool = VepCommand::new(config.tool.clone());
    let annotator = ChunkedAnnotator::new(config, tool).context("Invalid annotation settings")?;

    let summary = annotator
        .run(&args.vcf, &args.out_tsv)
        .await
        .with_context(|| format!("Annotation of {:?} failed", args.vcf))?;

    info!(
        "Annotated {:?}: {} rows in {} chunks ({} resumed, {} retries)",
        summary.output, summary.rows, summary.chunks, summary.chunks_resumed, summary.retries
    );
    Ok(())
}

async fn normalize(path: PathBuf, label: String, json: bool) -> Result<()> {
    let (records, summary) = tokio::task::spawn_blocking(move || -> Result<_> {
        let detection = detect(&path).with_context(|| format!("Format detection failed for {:?}", path))?;
        info!(
            "{:?}: {:?} layout, {} encoding, gzip {}",
            path,
            detection.layout,
            detection.encoding.name(),
            detection.gzipped
        );
        let reader = open_text(&path, &detection)?;

        let result = match &detection.layout {
            Layout::Vcf => {
                let (normalizer, mut vcf_reader) = VcfNormalizer::from_reader(0, &label, reader)?;
                normalizer.normalize(vcf_reader.get_mut())?
            }
            layout => ArrayNormalizer::new(0, label, layout)?.normalize(reader)?,
        };
        Ok(result)
    })
    .await
    .context("Normalization task panicked")??;

    if json {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for record in &records {
            serde_json::to_writer(&mut out, record)?;
            out.write_all(b"\n")?;
        }
    }

    info!(
        "Accepted {} records, skipped {} lines {:?}",
        summary.accepted,
        summary.skipped_total(),
        summary.skipped
    );
    Ok(())
}

async fn submit(db: PathBuf, path: PathBuf, label: Option<String>, blob: bool) -> Result<()> {
    let store = SqliteStore::open(&db).with_context(|| format!("Failed to open queue {:?}", db))?;
    // Absolute so the locator does not depend on the worker's data directory
    let path = std::fs::canonicalize(&path).with_context(|| format!("Cannot read {:?}", path))?;
    let original_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut job = NewJob::plain(original_name, path.display().to_string());
    job.sample_label = label;

    if path.is_dir() {
        if blob {
            anyhow::bail!("--blob takes a single file, not a directory: {:?}", path);
        }
        job.file_kind = FileKind::Archive;
    } else {
        let digest_path = path.clone();
        let sha = tokio::task::spawn_blocking(move || sha256_file(&digest_path))
            .await
            .context("Digest task panicked")?
            .with_context(|| format!("Failed to hash {:?}", path))?;
        job.size_bytes = Some(std::fs::metadata(&path)?.len() as i64);
        if blob {
            job.stored_path = format!("{}{}", BLOB_LOCATOR_PREFIX, sha);
        }
        job.sha256 = Some(sha);
    }

    let stored_path = job.stored_path.clone();
    let job_id = if blob {
        let content = tokio::fs::read(&path).await?;
        store.submit_with_blob(job, content).await?
    } else {
        store.submit(job).await?
    };

    info!("Submitted job {} -> {}", job_id, stored_path);
    println!("{}", job_id);
    Ok(())
}

async fn drain(db: PathBuf, data_dir: PathBuf, verify_digest: bool) -> Result<()> {
    let store = Arc::new(SqliteStore::open(&db).with_context(|| format!("Failed to open queue {:?}", db))?);
    let config = DispatcherConfig {
        poll_interval: Duration::from_secs(3),
        error_backoff: Duration::from_secs(5),
        poll_jitter: Duration::ZERO,
        lease_timeout: Duration::from_secs(600),
        heartbeat_interval: Duration::from_secs(30),
    };
    let dispatcher = Dispatcher::new(store, JobProcessor::new(data_dir, verify_digest), config);

    dispatcher.reap().await?;
    let mut processed = 0;
    while dispatcher.run_once().await? {
        processed += 1;
    }

    info!("Queue drained: {} jobs processed", processed);
    Ok(())
}
