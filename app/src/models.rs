// ==============================================================================
// models.rs - Ingest Data Models
// ==============================================================================
// Description: Job records, status state machine and canonical call records
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job identifier (bigserial in the job store)
pub type JobId = i64;

/// Marker stored in both allele slots for a no-call genotype
pub const NO_CALL: &str = "N";

/// Ingestion status of a job
///
/// `Received` and `Unzipped` are entry states set on submission.
/// `Processing` is the only in-flight state. `Parsed`, `NoRows` and `Error`
/// are terminal for an attempt; only an external reset moves a job back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Received,
    Unzipped,
    Processing,
    Parsed,
    NoRows,
    Error,
}

impl JobStatus {
    pub const CLAIMABLE: [JobStatus; 2] = [JobStatus::Received, JobStatus::Unzipped];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "received",
            JobStatus::Unzipped => "unzipped",
            JobStatus::Processing => "processing",
            JobStatus::Parsed => "parsed",
            JobStatus::NoRows => "no_rows",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Parsed | JobStatus::NoRows | JobStatus::Error)
    }

    /// Forward-only transitions the core is allowed to perform
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (from, JobStatus::Processing) => Self::CLAIMABLE.contains(from),
            (JobStatus::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown job status: '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(JobStatus::Received),
            "unzipped" => Ok(JobStatus::Unzipped),
            "processing" => Ok(JobStatus::Processing),
            "parsed" => Ok(JobStatus::Parsed),
            "no_rows" => Ok(JobStatus::NoRows),
            "error" => Ok(JobStatus::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Shape of a submitted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Single text (or gzip) file
    Plain,
    /// Archive already expanded into a directory of text payloads
    Archive,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Plain => "plain",
            FileKind::Archive => "archive",
        }
    }
}

impl FromStr for FileKind {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(FileKind::Plain),
            "archive" | "zip" => Ok(FileKind::Archive),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Snapshot of a job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub original_name: String,
    /// Opaque storage locator (path or `db://uploads/<sha256>`)
    pub stored_path: String,
    pub size_bytes: Option<i64>,
    pub sha256: Option<String>,
    pub file_kind: FileKind,
    pub status: JobStatus,
    pub notes: Option<String>,
    pub sample_label: Option<String>,
    pub owner_id: Option<String>,
    /// Worker currently holding the lease, if any
    pub claimed_by: Option<Uuid>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Sample label used for call records when the upload did not name one
    pub fn effective_sample_label(&self) -> String {
        match self.sample_label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => format!("Sample_{}", self.id),
        }
    }
}

/// Canonical genotype call for one marker of one sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub job_id: JobId,
    pub sample_label: String,
    pub rsid: String,
    /// Normalized chromosome token ("1".."22", "X", "Y", "MT", ...), None if absent
    pub chromosome: Option<String>,
    /// Base pair position, None if absent or non-numeric
    pub position: Option<i64>,
    pub allele1: Option<String>,
    pub allele2: Option<String>,
    /// Genotype as found in (or derived from) the source
    pub genotype: Option<String>,
    /// Original line, kept for audit
    pub raw_line: String,
}

impl CallRecord {
    pub fn is_no_call(&self) -> bool {
        self.allele1.as_deref() == Some(NO_CALL) && self.allele2.as_deref() == Some(NO_CALL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            JobStatus::Received,
            JobStatus::Unzipped,
            JobStatus::Processing,
            JobStatus::Parsed,
            JobStatus::NoRows,
            JobStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_transitions_are_forward_only() {
        assert!(JobStatus::Received.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Unzipped.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Parsed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::NoRows));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Error));

        assert!(!JobStatus::Parsed.can_transition_to(JobStatus::Received));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Received.can_transition_to(JobStatus::Parsed));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Received));
    }

    #[test]
    fn test_effective_sample_label() {
        let now = Utc::now();
        let mut job = Job {
            id: 42,
            original_name: "genome.txt".to_string(),
            stored_path: "genome.txt".to_string(),
            size_bytes: None,
            sha256: None,
            file_kind: FileKind::Plain,
            status: JobStatus::Received,
            notes: None,
            sample_label: None,
            owner_id: None,
            claimed_by: None,
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(job.effective_sample_label(), "Sample_42");

        job.sample_label = Some("  ".to_string());
        assert_eq!(job.effective_sample_label(), "Sample_42");

        job.sample_label = Some("mother".to_string());
        assert_eq!(job.effective_sample_label(), "mother");
    }
}
