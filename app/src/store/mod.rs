// ==============================================================================
// store/mod.rs - Job Store and Staging Sink Contracts
// ==============================================================================
// Description: Durable job queue and staging table interfaces plus adapters
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Adapters:
//   postgres  - production; claim via SELECT ... FOR UPDATE SKIP LOCKED
//   sqlite    - single node; claim via guarded conditional update
//   memory    - in-process, for tests and dry runs
// ==============================================================================

pub mod memory;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CallRecord, FileKind, Job, JobId, JobStatus, UnknownStatus};
use crate::schema::AnnotatedRow;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use sqlite::SqliteStore;

/// Locator prefix for payloads stored in the database
pub const BLOB_LOCATOR_PREFIX: &str = "db://uploads/";

/// Upper bound on a job's accumulated notes; older text is dropped first
pub const MAX_NOTE_CHARS: usize = 1000;

/// Note recorded on jobs whose lease expired
pub const LEASE_EXPIRED_NOTE: &str = "lease expired: worker stopped heartbeating; requeue manually";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {job_id} is not held by worker {worker} in processing")]
    LeaseLost { job_id: JobId, worker: Uuid },

    #[error("Refusing transition of job {job_id} to {to}")]
    InvalidTransition { job_id: JobId, to: JobStatus },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<UnknownStatus> for StoreError {
    fn from(e: UnknownStatus) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Fields supplied when a job is submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub original_name: String,
    pub stored_path: String,
    pub size_bytes: Option<i64>,
    pub sha256: Option<String>,
    pub file_kind: FileKind,
    pub sample_label: Option<String>,
    pub owner_id: Option<String>,
}

impl NewJob {
    pub fn plain(original_name: impl Into<String>, stored_path: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            stored_path: stored_path.into(),
            size_bytes: None,
            sha256: None,
            file_kind: FileKind::Plain,
            sample_label: None,
            owner_id: None,
        }
    }

    /// Archives are expanded before submission and enter as `unzipped`
    pub fn initial_status(&self) -> JobStatus {
        match self.file_kind {
            FileKind::Plain => JobStatus::Received,
            FileKind::Archive => JobStatus::Unzipped,
        }
    }
}

/// Durable job registry with an atomic claim
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Register a job in its entry state
    async fn submit(&self, job: NewJob) -> Result<JobId, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Move the lowest-id claimable job to `processing` for `worker`
    ///
    /// Never blocks behind another claimant; None when nothing is eligible.
    async fn claim_next(&self, worker: Uuid) -> Result<Option<Job>, StoreError>;

    /// Terminal transition of a job held by `worker`, appending `note`
    async fn finish(&self, job_id: JobId, worker: Uuid, status: JobStatus, note: &str) -> Result<(), StoreError>;

    /// Renew the lease; false when the job is no longer held by `worker`
    async fn heartbeat(&self, job_id: JobId, worker: Uuid) -> Result<bool, StoreError>;

    /// Fail `processing` jobs whose heartbeat is older than `lease`
    async fn reap_expired(&self, lease: Duration) -> Result<Vec<JobId>, StoreError>;

    /// Payload bytes for a `db://uploads/<sha256>` locator
    async fn fetch_blob(&self, sha256: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Staging tables written by the dispatcher and annotator
#[async_trait]
pub trait StagingSink: Send + Sync {
    /// Delete every call record of `job_id`, then insert `records`
    async fn replace_call_records(&self, job_id: JobId, records: &[CallRecord]) -> Result<u64, StoreError>;

    /// Append the rows of one annotation chunk
    ///
    /// Rows previously stored for the same (job, chunk) are replaced, so a
    /// chunk re-run after a crash is not duplicated.
    async fn append_annotated_rows(
        &self,
        job_id: JobId,
        chunk_index: usize,
        rows: &[AnnotatedRow],
    ) -> Result<u64, StoreError>;
}

/// Join an existing note and a new one, keeping the newest `MAX_NOTE_CHARS`
pub(crate) fn append_note(existing: Option<&str>, note: &str) -> String {
    let joined = match existing.map(str::trim).filter(|n| !n.is_empty()) {
        Some(prev) => format!("{}; {}", prev, note),
        None => note.to_string(),
    };

    let count = joined.chars().count();
    if count <= MAX_NOTE_CHARS {
        joined
    } else {
        joined.chars().skip(count - MAX_NOTE_CHARS).collect()
    }
}

/// Claimable statuses as a quoted SQL list: `'received', 'unzipped'`
pub(crate) fn claimable_sql() -> String {
    JobStatus::CLAIMABLE
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The sha256 of a `db://uploads/<sha256>` locator
pub fn blob_key(locator: &str) -> Option<&str> {
    locator
        .strip_prefix(BLOB_LOCATOR_PREFIX)
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_key() {
        assert_eq!(blob_key("db://uploads/abc123"), Some("abc123"));
        assert_eq!(blob_key("db://uploads/"), None);
        assert_eq!(blob_key("uploads/genome.txt"), None);
    }

    #[test]
    fn test_append_note() {
        assert_eq!(append_note(None, "parsed 5 rows"), "parsed 5 rows");
        assert_eq!(append_note(Some(" "), "parsed 5 rows"), "parsed 5 rows");
        assert_eq!(append_note(Some("uploaded"), "parsed 5 rows"), "uploaded; parsed 5 rows");
    }

    #[test]
    fn test_append_note_keeps_newest_text_within_bound() {
        let prev = "é".repeat(MAX_NOTE_CHARS);
        let note = append_note(Some(&prev), "lease expired");
        assert_eq!(note.chars().count(), MAX_NOTE_CHARS);
        assert!(note.ends_with("é; lease expired"));

        let long = "x".repeat(MAX_NOTE_CHARS + 50);
        assert_eq!(append_note(None, &long).chars().count(), MAX_NOTE_CHARS);
    }

    #[test]
    fn test_claimable_sql() {
        assert_eq!(claimable_sql(), "'received', 'unzipped'");
    }

    #[test]
    fn test_initial_status() {
        let mut job = NewJob::plain("a.txt", "a.txt");
        assert_eq!(job.initial_status(), JobStatus::Received);
        job.file_kind = FileKind::Archive;
        assert_eq!(job.initial_status(), JobStatus::Unzipped);
    }
}
