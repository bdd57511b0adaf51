// ==============================================================================
// store/memory.rs - In-Process Job Store
// ==============================================================================
// Description: Mutex-guarded store for tests and local dry runs
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{append_note, JobStore, NewJob, StagingSink, StoreError, LEASE_EXPIRED_NOTE};
use crate::models::{CallRecord, Job, JobId, JobStatus};
use crate::schema::AnnotatedRow;

#[derive(Default)]
struct Inner {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    calls: HashMap<JobId, Vec<CallRecord>>,
    annotated: BTreeMap<(JobId, usize), Vec<AnnotatedRow>>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking holder cannot leave a half-applied update behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_blob(&self, sha256: impl Into<String>, bytes: Vec<u8>) {
        self.lock().blobs.insert(sha256.into(), bytes);
    }

    pub fn call_records(&self, job_id: JobId) -> Vec<CallRecord> {
        self.lock().calls.get(&job_id).cloned().unwrap_or_default()
    }

    /// Annotated rows of a job in chunk order
    pub fn annotated_rows(&self, job_id: JobId) -> Vec<AnnotatedRow> {
        self.lock()
            .annotated
            .range((job_id, 0)..=(job_id, usize::MAX))
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect()
    }

    /// Overwrite the notes of a job, as an operator edit would
    pub fn set_notes(&self, job_id: JobId, notes: &str) {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.notes = Some(notes.to_string());
        }
    }

    /// Backdate a heartbeat (lease tests)
    pub fn set_heartbeat(&self, job_id: JobId, at: chrono::DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.heartbeat_at = Some(at);
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn submit(&self, new: NewJob) -> Result<JobId, StoreError> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        let status = new.initial_status();
        inner.jobs.insert(
            id,
            Job {
                id,
                original_name: new.original_name,
                stored_path: new.stored_path,
                size_bytes: new.size_bytes,
                sha256: new.sha256,
                file_kind: new.file_kind,
                status,
                notes: None,
                sample_label: new.sample_label,
                owner_id: new.owner_id,
                claimed_by: None,
                heartbeat_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn claim_next(&self, worker: Uuid) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .values_mut()
            .find(|job| job.status.can_transition_to(JobStatus::Processing));

        Ok(job.map(|job| {
            let now = Utc::now();
            job.status = JobStatus::Processing;
            job.claimed_by = Some(worker);
            job.heartbeat_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn finish(&self, job_id: JobId, worker: Uuid, status: JobStatus, note: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Processing || job.claimed_by != Some(worker) {
            return Err(StoreError::LeaseLost { job_id, worker });
        }
        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition { job_id, to: status });
        }

        job.status = status;
        job.notes = Some(append_note(job.notes.as_deref(), note));
        job.claimed_by = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn heartbeat(&self, job_id: JobId, worker: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing && job.claimed_by == Some(worker) => {
                job.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_expired(&self, lease: Duration) -> Result<Vec<JobId>, StoreError> {
        let lease = chrono::Duration::from_std(lease).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let now = Utc::now();
        let cutoff = now - lease;
        let mut reaped = Vec::new();

        for job in self.lock().jobs.values_mut() {
            let stale = job.heartbeat_at.map_or(true, |at| at < cutoff);
            if job.status == JobStatus::Processing && stale {
                job.status = JobStatus::Error;
                job.notes = Some(append_note(job.notes.as_deref(), LEASE_EXPIRED_NOTE));
                job.claimed_by = None;
                job.updated_at = now;
                reaped.push(job.id);
            }
        }
        Ok(reaped)
    }

    async fn fetch_blob(&self, sha256: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().blobs.get(sha256).cloned())
    }
}

#[async_trait]
impl StagingSink for MemoryStore {
    async fn replace_call_records(&self, job_id: JobId, records: &[CallRecord]) -> Result<u64, StoreError> {
        self.lock().calls.insert(job_id, records.to_vec());
        Ok(records.len() as u64)
    }

    async fn append_annotated_rows(
        &self,
        job_id: JobId,
        chunk_index: usize,
        rows: &[AnnotatedRow],
    ) -> Result<u64, StoreError> {
        self.lock().annotated.insert((job_id, chunk_index), rows.to_vec());
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_claims_lowest_id_first() {
        let store = MemoryStore::new();
        let first = store.submit(NewJob::plain("a.txt", "a.txt")).await.unwrap();
        let second = store.submit(NewJob::plain("b.txt", "b.txt")).await.unwrap();

        let worker = Uuid::new_v4();
        let claimed = store.claim_next(worker).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.claimed_by, Some(worker));

        assert_eq!(store.claim_next(worker).await.unwrap().unwrap().id, second);
        assert!(store.claim_next(worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..50 {
            store.submit(NewJob::plain(format!("{}.txt", i), format!("{}.txt", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let worker = Uuid::new_v4();
                let mut mine = Vec::new();
                while let Some(job) = store.claim_next(worker).await.unwrap() {
                    mine.push(job.id);
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<JobId> = all.iter().copied().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn test_finish_requires_lease() {
        let store = MemoryStore::new();
        let id = store.submit(NewJob::plain("a.txt", "a.txt")).await.unwrap();
        let worker = Uuid::new_v4();
        store.claim_next(worker).await.unwrap();

        let other = Uuid::new_v4();
        assert!(matches!(
            store.finish(id, other, JobStatus::Parsed, "x").await,
            Err(StoreError::LeaseLost { .. })
        ));
        assert!(matches!(
            store.finish(id, worker, JobStatus::Received, "x").await,
            Err(StoreError::InvalidTransition { .. })
        ));

        store.finish(id, worker, JobStatus::Parsed, "parsed 3 rows").await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Parsed);
        assert_eq!(job.notes.as_deref(), Some("parsed 3 rows"));

        // Terminal jobs stay terminal
        assert!(store.finish(id, worker, JobStatus::Error, "late").await.is_err());
        assert!(store.claim_next(worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reaper_fails_stale_leases_only() {
        let store = MemoryStore::new();
        let stale = store.submit(NewJob::plain("a.txt", "a.txt")).await.unwrap();
        let fresh = store.submit(NewJob::plain("b.txt", "b.txt")).await.unwrap();
        let worker = Uuid::new_v4();
        store.claim_next(worker).await.unwrap();
        store.claim_next(worker).await.unwrap();

        store.set_heartbeat(stale, Utc::now() - chrono::Duration::minutes(30));
        let reaped = store.reap_expired(Duration::from_secs(600)).await.unwrap();
        assert_eq!(reaped, vec![stale]);

        let job = store.get(stale).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.notes.unwrap().contains("lease expired"));
        assert!(!store.heartbeat(stale, worker).await.unwrap());
        assert!(store.heartbeat(fresh, worker).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let store = MemoryStore::new();
        let record = CallRecord {
            job_id: 1,
            sample_label: "S".to_string(),
            rsid: "rs1".to_string(),
            chromosome: Some("1".to_string()),
            position: Some(1),
            allele1: Some("A".to_string()),
            allele2: Some("G".to_string()),
            genotype: Some("AG".to_string()),
            raw_line: "rs1\t1\t1\tAG".to_string(),
        };
        store.replace_call_records(1, &[record.clone(), record.clone()]).await.unwrap();
        store.replace_call_records(1, &[record.clone()]).await.unwrap();
        assert_eq!(store.call_records(1), vec![record]);
    }
}
