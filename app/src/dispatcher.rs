// ==============================================================================
// dispatcher.rs - Job Dispatcher and Poll Loop
// ==============================================================================
// Description: Claims jobs, runs the processor, records terminal status and
//              keeps leases alive while a job runs
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Job lifecycle:
//   received | unzipped  --claim-->  processing  --complete-->  parsed | no_rows
//                                                --fail------>  error
// A job whose worker stops heartbeating is moved to error by the reaper.
// ==============================================================================

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::annotator::tool::truncate_chars;
use crate::config::WorkerConfig;
use crate::models::{Job, JobId, JobStatus};
use crate::processor::JobProcessor;
use crate::store::{JobStore, StagingSink, StoreError, MAX_NOTE_CHARS};

/// Longest error summary stored on a failed job
///
/// The store keeps the combined notes within the same bound, dropping the
/// oldest text first.
pub const MAX_ERROR_SUMMARY: usize = MAX_NOTE_CHARS;

/// Timing of the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub poll_jitter: Duration,
    pub lease_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&WorkerConfig> for DispatcherConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            error_backoff: config.error_backoff,
            poll_jitter: config.poll_jitter,
            lease_timeout: config.lease_timeout,
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

pub struct Dispatcher<S> {
    store: Arc<S>,
    processor: JobProcessor,
    worker_id: Uuid,
    config: DispatcherConfig,
}

impl<S> Dispatcher<S>
where
    S: JobStore + StagingSink + 'static,
{
    pub fn new(store: Arc<S>, processor: JobProcessor, config: DispatcherConfig) -> Self {
        Self {
            store,
            processor,
            worker_id: Uuid::new_v4(),
            config,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Claim the lowest-id eligible job for this worker
    pub async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let job = self.store.claim_next(self.worker_id).await?;
        if let Some(job) = &job {
            info!("Worker {} claimed job {} ({})", self.worker_id, job.id, job.original_name);
        }
        Ok(job)
    }

    /// Record a successful run: `parsed` with a row count, or `no_rows`
    pub async fn complete(&self, job_id: JobId, inserted: u64) -> Result<JobStatus, StoreError> {
        let (status, note) = if inserted > 0 {
            (JobStatus::Parsed, format!("parsed {} rows", inserted))
        } else {
            (JobStatus::NoRows, "no rows parsed".to_string())
        };

        self.finish(job_id, status, &note).await?;
        info!("Job {} -> {} ({})", job_id, status, note);
        Ok(status)
    }

    /// Record a failed run with a bounded summary
    pub async fn fail(&self, job_id: JobId, summary: &str) -> Result<(), StoreError> {
        let summary = truncate_chars(summary, MAX_ERROR_SUMMARY);
        self.finish(job_id, JobStatus::Error, &summary).await?;
        error!("Job {} -> error: {}", job_id, summary);
        Ok(())
    }

    /// Terminal update; a job reaped from under us is logged, not raised
    async fn finish(&self, job_id: JobId, status: JobStatus, note: &str) -> Result<(), StoreError> {
        match self.store.finish(job_id, self.worker_id, status, note).await {
            Err(StoreError::LeaseLost { .. }) => {
                warn!("Job {} is no longer held by worker {}; dropping {} result", job_id, self.worker_id, status);
                Ok(())
            }
            other => other,
        }
    }

    /// Claim and process at most one job; false when the queue was empty
    pub async fn run_once(&self) -> Result<bool> {
        match self.claim_next().await? {
            Some(job) => {
                self.process_claimed(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process a claimed job under a heartbeat; job errors become `fail`
    async fn process_claimed(&self, job: Job) -> Result<(), StoreError> {
        let heartbeat = self.spawn_heartbeat(job.id);
        let outcome = self.processor.process(self.store.as_ref(), &job).await;
        heartbeat.abort();

        match outcome {
            Ok(outcome) => {
                info!(
                    "Job {}: {} files, {} records, {} lines skipped, {} annotation runs",
                    job.id,
                    outcome.files,
                    outcome.inserted,
                    outcome.summary.skipped_total(),
                    outcome.annotations.len()
                );
                self.complete(job.id, outcome.inserted).await?;
            }
            Err(e) => {
                self.fail(job.id, &format!("{:#}", e)).await?;
            }
        }
        Ok(())
    }

    fn spawn_heartbeat(&self, job_id: JobId) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let worker = self.worker_id;
        let period = self.config.heartbeat_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately; the claim already set the heartbeat
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat(job_id, worker).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("Lease on job {} lost; stopping heartbeat", job_id);
                        return;
                    }
                    Err(e) => warn!("Heartbeat for job {} failed: {}", job_id, e),
                }
            }
        })
    }

    /// Fail jobs whose lease expired
    pub async fn reap(&self) -> Result<Vec<JobId>, StoreError> {
        let reaped = self.store.reap_expired(self.config.lease_timeout).await?;
        if !reaped.is_empty() {
            warn!("Moved {} jobs with expired leases to error: {:?}", reaped.len(), reaped);
        }
        Ok(reaped)
    }

    /// Poll until `shutdown` flips to true; stops between jobs
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Worker {} polling for jobs", self.worker_id);

        if let Err(e) = self.reap().await {
            error!("Failed to reap expired leases: {}", e);
        }
        let mut last_reap = tokio::time::Instant::now();

        while !*shutdown.borrow() {
            if last_reap.elapsed() >= self.config.lease_timeout {
                if let Err(e) = self.reap().await {
                    error!("Failed to reap expired leases: {}", e);
                }
                last_reap = tokio::time::Instant::now();
            }

            let pause = match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => self.config.poll_interval + jitter(self.config.poll_jitter),
                Err(e) => {
                    error!("Poll failed: {:#}", e);
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    // Sender dropped: keep the normal pause
                    if changed.is_err() {
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        }

        info!("Worker {} stopped", self.worker_id);
        Ok(())
    }
}

/// Random extra delay in `[0, max]` so idle workers do not poll in lockstep
fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
