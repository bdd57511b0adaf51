// ==============================================================================
// config.rs - Worker and Annotator Configuration
// ==============================================================================
// Description: Explicit configuration values passed into each component
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Components never read the process environment. Binaries build these values
// (from env via `WorkerConfig::from_lookup`, or from CLI flags) and pass them in.
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

use crate::annotator::chunk::DEFAULT_CHUNK_SIZE;
use crate::annotator::retry::{RetryPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES};

pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_CACHE_DIR: &str = "/mnt/nas_storage/vep/cache";
pub const DEFAULT_REF_DIR: &str = "/mnt/nas_storage/vep/reference";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Reference genome build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Assembly {
    #[value(name = "GRCh37")]
    GRCh37,
    #[value(name = "GRCh38")]
    GRCh38,
}

impl Assembly {
    pub fn as_str(&self) -> &'static str {
        match self {
            Assembly::GRCh37 => "GRCh37",
            Assembly::GRCh38 => "GRCh38",
        }
    }
}

impl fmt::Display for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Assembly {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GRCh37" => Ok(Assembly::GRCh37),
            "GRCh38" => Ok(Assembly::GRCh38),
            other => Err(format!("unknown assembly '{}'", other)),
        }
    }
}

/// External annotation tool invocation settings
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct ToolSettings {
    pub vep_path: PathBuf,
    pub assembly: Assembly,
    pub cache_dir: PathBuf,
    /// Directory holding `<assembly>.fa`
    pub ref_dir: PathBuf,
    #[validate(range(min = 1))]
    pub forks: u32,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            vep_path: PathBuf::from("vep"),
            assembly: Assembly::GRCh38,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            ref_dir: PathBuf::from(DEFAULT_REF_DIR),
            forks: 4,
        }
    }
}

impl ToolSettings {
    pub fn fasta_path(&self) -> PathBuf {
        self.ref_dir.join(format!("{}.fa", self.assembly))
    }
}

/// Chunked annotator settings
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct AnnotatorConfig {
    #[validate(range(min = 1))]
    pub chunk_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Keep an existing `.part` file and continue from its checkpoint
    pub resume: bool,
    /// Optional column file that must match the output contract
    pub columns_file: Option<PathBuf>,
    #[validate(nested)]
    pub tool: ToolSettings,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            resume: false,
            columns_file: None,
            tool: ToolSettings::default(),
        }
    }
}

impl AnnotatorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base)
    }
}

/// Annotation of VCF jobs inside the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAnnotation {
    /// Annotated TSVs are written here as `job_<id>.annotated.tsv`
    pub output_dir: PathBuf,
    pub annotator: AnnotatorConfig,
}

/// Poll worker settings
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Base directory for relative storage locators
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    /// Sleep after a store or infrastructure error
    pub error_backoff: Duration,
    /// Upper bound of random jitter added to each idle poll
    pub poll_jitter: Duration,
    pub lease_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub verify_digest: bool,
    #[validate(range(min = 1))]
    pub db_max_connections: u32,
    pub annotation: Option<WorkerAnnotation>,
}

impl WorkerConfig {
    /// Build from a key lookup (the binary passes the process environment)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let annotation = if parse_flag("ANNOTATE_VCF", get("ANNOTATE_VCF"), false)? {
            let output_dir = get("ANNOTATION_OUTPUT_DIR")
                .map(PathBuf::from)
                .ok_or(ConfigError::Missing("ANNOTATION_OUTPUT_DIR"))?;
            let defaults = AnnotatorConfig::default();
            let tool_defaults = ToolSettings::default();

            let annotator = AnnotatorConfig {
                chunk_size: parse_or("VEP_CHUNK_SIZE", get("VEP_CHUNK_SIZE"), defaults.chunk_size)?,
                max_retries: parse_or("VEP_MAX_RETRIES", get("VEP_MAX_RETRIES"), defaults.max_retries)?,
                backoff_base: Duration::from_secs(parse_or(
                    "VEP_BACKOFF_BASE_SEC",
                    get("VEP_BACKOFF_BASE_SEC"),
                    defaults.backoff_base.as_secs(),
                )?),
                resume: parse_flag("VEP_RESUME", get("VEP_RESUME"), true)?,
                columns_file: get("VEP_COLUMNS_FILE").map(PathBuf::from),
                tool: ToolSettings {
                    vep_path: get("VEP_PATH").map(PathBuf::from).unwrap_or(tool_defaults.vep_path),
                    assembly: parse_or("VEP_ASSEMBLY", get("VEP_ASSEMBLY"), tool_defaults.assembly)?,
                    cache_dir: get("VEP_CACHE_DIR").map(PathBuf::from).unwrap_or(tool_defaults.cache_dir),
                    ref_dir: get("VEP_REF_DIR").map(PathBuf::from).unwrap_or(tool_defaults.ref_dir),
                    forks: parse_or("VEP_FORKS", get("VEP_FORKS"), tool_defaults.forks)?,
                },
            };
            annotator.validate()?;
            Some(WorkerAnnotation { output_dir, annotator })
        } else {
            None
        };

        let config = Self {
            database_url,
            data_dir: get("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            poll_interval: Duration::from_secs(parse_or("POLL_SEC", get("POLL_SEC"), 3)?),
            error_backoff: Duration::from_secs(parse_or("ERROR_BACKOFF_SEC", get("ERROR_BACKOFF_SEC"), 5)?),
            poll_jitter: Duration::from_millis(parse_or("POLL_JITTER_MS", get("POLL_JITTER_MS"), 250)?),
            lease_timeout: Duration::from_secs(parse_or("LEASE_TIMEOUT_SEC", get("LEASE_TIMEOUT_SEC"), 600)?),
            heartbeat_interval: Duration::from_secs(parse_or("HEARTBEAT_SEC", get("HEARTBEAT_SEC"), 30)?),
            verify_digest: parse_flag("VERIFY_DIGEST", get("VERIFY_DIGEST"), true)?,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", get("DB_MAX_CONNECTIONS"), 5)?,
            annotation,
        };

        config.validate()?;
        if config.heartbeat_interval >= config.lease_timeout {
            return Err(ConfigError::Invalid {
                key: "HEARTBEAT_SEC",
                value: config.heartbeat_interval.as_secs().to_string(),
                reason: "must be shorter than LEASE_TIMEOUT_SEC".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_flag(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
