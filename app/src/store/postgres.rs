// ==============================================================================
// store/postgres.rs - PostgreSQL Job Store
// ==============================================================================
// Description: Production store; SKIP LOCKED claims and COPY-based staging
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// Tables (created if missing by ensure_schema):
//   uploads               job rows, status state machine, lease columns
//   upload_blobs          payloads addressed as db://uploads/<sha256>
//   staging_array_calls   canonical call records, replaced per upload
//   annotated_variants    33 contract columns + (upload_id, chunk_index, row_index)
// ==============================================================================

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{claimable_sql, JobStore, NewJob, StagingSink, StoreError, LEASE_EXPIRED_NOTE, MAX_NOTE_CHARS};
use crate::models::{CallRecord, FileKind, Job, JobId, JobStatus};
use crate::schema::{AnnotatedRow, ANNOTATED_COLUMNS};

const UPLOADS_DDL: &str = "
CREATE TABLE IF NOT EXISTS uploads (
    id            bigserial PRIMARY KEY,
    original_name text NOT NULL DEFAULT '',
    stored_path   text NOT NULL,
    size_bytes    bigint,
    sha256        text,
    file_kind     text NOT NULL DEFAULT 'plain',
    status        text NOT NULL DEFAULT 'received',
    notes         text,
    sample_label  text,
    owner_id      text,
    created_at    timestamptz NOT NULL DEFAULT now(),
    updated_at    timestamptz NOT NULL DEFAULT now()
);
ALTER TABLE uploads ADD COLUMN IF NOT EXISTS claimed_by uuid;
ALTER TABLE uploads ADD COLUMN IF NOT EXISTS heartbeat_at timestamptz;
CREATE INDEX IF NOT EXISTS uploads_claimable ON uploads(id) WHERE status IN ('received', 'unzipped');

CREATE TABLE IF NOT EXISTS upload_blobs (
    upload_id bigint PRIMARY KEY REFERENCES uploads(id) ON DELETE CASCADE,
    sha256    text NOT NULL,
    content   bytea NOT NULL
);
CREATE INDEX IF NOT EXISTS upload_blobs_sha256 ON upload_blobs(sha256);

CREATE TABLE IF NOT EXISTS staging_array_calls (
    id           bigserial PRIMARY KEY,
    upload_id    bigint REFERENCES uploads(id) ON DELETE CASCADE,
    sample_label text,
    rsid         text,
    chrom        text,
    pos          bigint,
    allele1      text,
    allele2      text,
    genotype     text,
    raw_line     text,
    created_at   timestamptz DEFAULT now()
);
CREATE INDEX IF NOT EXISTS staging_array_calls_upload_id ON staging_array_calls(upload_id);
CREATE INDEX IF NOT EXISTS staging_array_calls_rsid ON staging_array_calls(rsid);
";

const JOB_COLUMNS: &str = "id, original_name, stored_path, size_bytes, sha256, file_kind, status, notes, \
                           sample_label, owner_id, claimed_by, heartbeat_at, created_at, updated_at";

const CALL_COPY: &str = "COPY staging_array_calls \
                         (upload_id, sample_label, rsid, chrom, pos, allele1, allele2, genotype, raw_line) \
                         FROM STDIN WITH (FORMAT csv)";

/// Append `$1` to the notes, keeping the newest MAX_NOTE_CHARS characters
fn note_append() -> String {
    format!(
        "right(CASE WHEN notes IS NULL OR btrim(notes) = '' THEN $1 ELSE notes || '; ' || $1 END, {})",
        MAX_NOTE_CHARS
    )
}

fn annotated_ddl() -> String {
    let columns: Vec<String> = ANNOTATED_COLUMNS.iter().map(|c| format!("    {} text", c)).collect();
    format!(
        "CREATE TABLE IF NOT EXISTS annotated_variants (
    id          bigserial PRIMARY KEY,
    upload_id   bigint REFERENCES uploads(id) ON DELETE CASCADE,
    chunk_index integer NOT NULL,
    row_index   integer NOT NULL,
{}
);
CREATE INDEX IF NOT EXISTS annotated_variants_chunk ON annotated_variants(upload_id, chunk_index);",
        columns.join(",\n")
    )
}

fn annotated_copy() -> String {
    format!(
        "COPY annotated_variants (upload_id, chunk_index, row_index, {}) FROM STDIN WITH (FORMAT csv)",
        ANNOTATED_COLUMNS.join(", ")
    )
}

fn row_to_job(row: &PgRow) -> Result<Job, StoreError> {
    let file_kind: String = row.try_get("file_kind")?;
    let status: String = row.try_get("status")?;

    Ok(Job {
        id: row.try_get("id")?,
        original_name: row.try_get("original_name")?,
        stored_path: row.try_get("stored_path")?,
        size_bytes: row.try_get("size_bytes")?,
        sha256: row.try_get("sha256")?,
        file_kind: file_kind.parse::<FileKind>()?,
        status: status.parse::<JobStatus>()?,
        notes: row.try_get("notes")?,
        sample_label: row.try_get("sample_label")?,
        owner_id: row.try_get("owner_id")?,
        claimed_by: row.try_get("claimed_by")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// CSV payload for COPY into staging_array_calls
fn call_copy_payload(job_id: JobId, records: &[CallRecord]) -> Result<Vec<u8>, StoreError> {
    let mut csv = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    for r in records {
        csv.serialize((
            job_id,
            &r.sample_label,
            &r.rsid,
            &r.chromosome,
            r.position,
            &r.allele1,
            &r.allele2,
            &r.genotype,
            &r.raw_line,
        ))
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    }
    csv.into_inner().map_err(|e| StoreError::Io(e.into_error()))
}

/// CSV payload for COPY into annotated_variants
fn annotated_copy_payload(job_id: JobId, chunk_index: usize, rows: &[AnnotatedRow]) -> Result<Vec<u8>, StoreError> {
    let mut csv = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    for (idx, row) in rows.iter().enumerate() {
        let mut record = vec![job_id.to_string(), chunk_index.to_string(), idx.to_string()];
        record.extend(row.fields().iter().cloned());
        csv.write_record(&record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    }
    csv.into_inner().map_err(|e| StoreError::Io(e.into_error()))
}

/// PostgreSQL store over a shared pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and lease columns when missing
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(UPLOADS_DDL).execute(&self.pool).await?;
        sqlx::raw_sql(&annotated_ddl()).execute(&self.pool).await?;
        info!("Job store schema ready");
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn submit(&self, new: NewJob) -> Result<JobId, StoreError> {
        let status = new.initial_status();
        let id: JobId = sqlx::query_scalar(
            "INSERT INTO uploads (original_name, stored_path, size_bytes, sha256, file_kind, status, sample_label, owner_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(&new.original_name)
        .bind(&new.stored_path)
        .bind(new.size_bytes)
        .bind(&new.sha256)
        .bind(new.file_kind.as_str())
        .bind(status.as_str())
        .bind(&new.sample_label)
        .bind(&new.owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {} FROM uploads WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql).bind(job_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn claim_next(&self, worker: Uuid) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "UPDATE uploads
             SET status = 'processing', claimed_by = $1, heartbeat_at = now(), updated_at = now()
             WHERE id = (
                 SELECT id FROM uploads
                 WHERE status IN ({})
                 ORDER BY id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            claimable_sql(),
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql).bind(worker).fetch_optional(&self.pool).await?;
        let job = row.as_ref().map(row_to_job).transpose()?;
        if let Some(job) = &job {
            debug!("Worker {} claimed job {}", worker, job.id);
        }
        Ok(job)
    }

    async fn finish(&self, job_id: JobId, worker: Uuid, status: JobStatus, note: &str) -> Result<(), StoreError> {
        if !JobStatus::Processing.can_transition_to(status) {
            return Err(StoreError::InvalidTransition { job_id, to: status });
        }

        let sql = format!(
            "UPDATE uploads
             SET status = $2, notes = {}, claimed_by = NULL, updated_at = now()
             WHERE id = $3 AND status = 'processing' AND claimed_by = $4",
            note_append()
        );
        let result = sqlx::query(&sql)
            .bind(note)
            .bind(status.as_str())
            .bind(job_id)
            .bind(worker)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let exists: Option<JobId> = sqlx::query_scalar("SELECT id FROM uploads WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match exists {
                None => StoreError::NotFound(job_id),
                Some(_) => StoreError::LeaseLost { job_id, worker },
            });
        }
        Ok(())
    }

    async fn heartbeat(&self, job_id: JobId, worker: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE uploads SET heartbeat_at = now()
             WHERE id = $1 AND status = 'processing' AND claimed_by = $2",
        )
        .bind(job_id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reap_expired(&self, lease: Duration) -> Result<Vec<JobId>, StoreError> {
        let sql = format!(
            "UPDATE uploads
             SET status = 'error', notes = {}, claimed_by = NULL, updated_at = now()
             WHERE status = 'processing'
               AND (heartbeat_at IS NULL OR heartbeat_at < now() - make_interval(secs => $2))
             RETURNING id",
            note_append()
        );
        let ids: Vec<JobId> = sqlx::query_scalar(&sql)
            .bind(LEASE_EXPIRED_NOTE)
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn fetch_blob(&self, sha256: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let content: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT content FROM upload_blobs WHERE sha256 = $1 LIMIT 1")
                .bind(sha256)
                .fetch_optional(&self.pool)
                .await?;
        Ok(content)
    }
}

#[async_trait]
impl StagingSink for PgStore {
    async fn replace_call_records(&self, job_id: JobId, records: &[CallRecord]) -> Result<u64, StoreError> {
        let payload = call_copy_payload(job_id, records)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM staging_array_calls WHERE upload_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        let mut copy = tx.copy_in_raw(CALL_COPY).await?;
        copy.send(payload).await?;
        let copied = copy.finish().await?;
        tx.commit().await?;

        debug!("Staged {} call records for job {}", copied, job_id);
        Ok(copied)
    }

    async fn append_annotated_rows(
        &self,
        job_id: JobId,
        chunk_index: usize,
        rows: &[AnnotatedRow],
    ) -> Result<u64, StoreError> {
        let payload = annotated_copy_payload(job_id, chunk_index, rows)?;
        let copy_sql = annotated_copy();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM annotated_variants WHERE upload_id = $1 AND chunk_index = $2")
            .bind(job_id)
            .bind(chunk_index as i32)
            .execute(&mut *tx)
            .await?;

        let mut copy = tx.copy_in_raw(&copy_sql).await?;
        copy.send(payload).await?;
        let copied = copy.finish().await?;
        tx.commit().await?;
        Ok(copied)
    }
}
