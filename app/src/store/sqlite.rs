// ==============================================================================
// store/sqlite.rs - SQLite Job Store
// ==============================================================================
// Description: Single-node store; claims through a guarded conditional update
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================
// SQLite has no SKIP LOCKED. A claim reads the lowest eligible id, then runs
//   UPDATE uploads SET status = 'processing' ... WHERE id = ? AND status = ?
// and retries with the next candidate when another connection won the row,
// until no eligible row is left.
// Timestamps are fixed-width RFC 3339 UTC text so they compare as strings.
// ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{claimable_sql, JobStore, NewJob, StagingSink, StoreError, LEASE_EXPIRED_NOTE, MAX_NOTE_CHARS};
use crate::models::{CallRecord, FileKind, Job, JobId, JobStatus};
use crate::schema::AnnotatedRow;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS uploads (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    original_name TEXT NOT NULL,
    stored_path   TEXT NOT NULL,
    size_bytes    INTEGER,
    sha256        TEXT,
    file_kind     TEXT NOT NULL DEFAULT 'plain',
    status        TEXT NOT NULL DEFAULT 'received',
    notes         TEXT,
    sample_label  TEXT,
    owner_id      TEXT,
    claimed_by    TEXT,
    heartbeat_at  TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS uploads_status_id ON uploads(status, id);

CREATE TABLE IF NOT EXISTS upload_blobs (
    upload_id INTEGER PRIMARY KEY REFERENCES uploads(id) ON DELETE CASCADE,
    sha256    TEXT NOT NULL,
    content   BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS upload_blobs_sha256 ON upload_blobs(sha256);

CREATE TABLE IF NOT EXISTS staging_array_calls (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_id    INTEGER REFERENCES uploads(id) ON DELETE CASCADE,
    sample_label TEXT,
    rsid         TEXT,
    chrom        TEXT,
    pos          INTEGER,
    allele1      TEXT,
    allele2      TEXT,
    genotype     TEXT,
    raw_line     TEXT,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS staging_array_calls_upload_id ON staging_array_calls(upload_id);
CREATE INDEX IF NOT EXISTS staging_array_calls_rsid ON staging_array_calls(rsid);

CREATE TABLE IF NOT EXISTS annotated_variants (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_id   INTEGER REFERENCES uploads(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    row_index   INTEGER NOT NULL,
    fields      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS annotated_variants_chunk ON annotated_variants(upload_id, chunk_index);
";

const JOB_COLUMNS: &str = "id, original_name, stored_path, size_bytes, sha256, file_kind, status, notes, \
                           sample_label, owner_id, claimed_by, heartbeat_at, created_at, updated_at";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let file_kind: String = row.get(5)?;
    let status: String = row.get(6)?;
    let claimed_by: Option<String> = row.get(10)?;
    let heartbeat_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(Job {
        id: row.get(0)?,
        original_name: row.get(1)?,
        stored_path: row.get(2)?,
        size_bytes: row.get(3)?,
        sha256: row.get(4)?,
        file_kind: file_kind.parse::<FileKind>().map_err(|e| conversion(5, e))?,
        status: status.parse::<JobStatus>().map_err(|e| conversion(6, e))?,
        notes: row.get(7)?,
        sample_label: row.get(8)?,
        owner_id: row.get(9)?,
        claimed_by: claimed_by
            .map(|w| Uuid::parse_str(&w))
            .transpose()
            .map_err(|e| conversion(10, e))?,
        heartbeat_at: heartbeat_at.map(|t| parse_time(11, &t)).transpose()?,
        created_at: parse_time(12, &created_at)?,
        updated_at: parse_time(13, &updated_at)?,
    })
}

/// SQLite-backed store; each instance owns one connection
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode: {}", mode);
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(DDL)?;

        info!("Opened SQLite job store at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking SQLite work on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await?
    }

    /// Register a job together with its payload bytes
    ///
    /// The job row and the blob commit in one transaction, so the job is
    /// never claimable without its payload. The blob is keyed by the job's
    /// sha256.
    pub async fn submit_with_blob(&self, new: NewJob, content: Vec<u8>) -> Result<JobId, StoreError> {
        let sha256 = new
            .sha256
            .clone()
            .ok_or_else(|| StoreError::Corrupt(format!("Blob job {:?} has no sha256", new.original_name)))?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let job_id = insert_job(&tx, &new)?;
            tx.execute(
                "INSERT INTO upload_blobs (upload_id, sha256, content) VALUES (?1, ?2, ?3)",
                params![job_id, sha256, content],
            )?;
            tx.commit()?;
            Ok(job_id)
        })
        .await
    }

    pub async fn call_record_count(&self, job_id: JobId) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM staging_array_calls WHERE upload_id = ?1",
                params![job_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }
}

fn insert_job(conn: &Connection, new: &NewJob) -> Result<JobId, StoreError> {
    let now = timestamp(Utc::now());
    conn.execute(
        "INSERT INTO uploads (original_name, stored_path, size_bytes, sha256, file_kind, status,
                              sample_label, owner_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            new.original_name,
            new.stored_path,
            new.size_bytes,
            new.sha256,
            new.file_kind.as_str(),
            new.initial_status().as_str(),
            new.sample_label,
            new.owner_id,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Append `?1` to the notes, keeping the newest MAX_NOTE_CHARS characters
fn note_append() -> String {
    format!(
        "substr(CASE WHEN notes IS NULL OR trim(notes) = '' THEN ?1 ELSE notes || '; ' || ?1 END, -{})",
        MAX_NOTE_CHARS
    )
}

fn fetch_job(conn: &Connection, job_id: JobId) -> Result<Option<Job>, StoreError> {
    let sql = format!("SELECT {} FROM uploads WHERE id = ?1", JOB_COLUMNS);
    Ok(conn.query_row(&sql, params![job_id], row_to_job).optional()?)
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn submit(&self, new: NewJob) -> Result<JobId, StoreError> {
        self.with_conn(move |conn| insert_job(conn, &new)).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.with_conn(move |conn| fetch_job(conn, job_id)).await
    }

    async fn claim_next(&self, worker: Uuid) -> Result<Option<Job>, StoreError> {
        let select = format!(
            "SELECT id, status FROM uploads WHERE status IN ({}) ORDER BY id LIMIT 1",
            claimable_sql()
        );

        self.with_conn(move |conn| {
            // Every lost race means another claimant took a row, so this ends
            loop {
                let candidate: Option<(JobId, String)> = conn
                    .query_row(&select, [], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?;

                let (id, status) = match candidate {
                    Some(c) => c,
                    None => return Ok(None),
                };

                let now = timestamp(Utc::now());
                let changed = conn.execute(
                    "UPDATE uploads
                     SET status = 'processing', claimed_by = ?1, heartbeat_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![worker.to_string(), now, id, status],
                )?;

                if changed == 1 {
                    return fetch_job(conn, id);
                }
                debug!("Lost claim race for job {}, retrying", id);
            }
        })
        .await
    }

    async fn finish(&self, job_id: JobId, worker: Uuid, status: JobStatus, note: &str) -> Result<(), StoreError> {
        if !JobStatus::Processing.can_transition_to(status) {
            return Err(StoreError::InvalidTransition { job_id, to: status });
        }
        let note = note.to_string();
        let sql = format!(
            "UPDATE uploads
             SET status = ?2, notes = {}, claimed_by = NULL, updated_at = ?3
             WHERE id = ?4 AND status = 'processing' AND claimed_by = ?5",
            note_append()
        );

        self.with_conn(move |conn| {
            let changed = conn.execute(
                &sql,
                params![note, status.as_str(), timestamp(Utc::now()), job_id, worker.to_string()],
            )?;

            if changed == 0 {
                return match fetch_job(conn, job_id)? {
                    None => Err(StoreError::NotFound(job_id)),
                    Some(_) => Err(StoreError::LeaseLost { job_id, worker }),
                };
            }
            Ok(())
        })
        .await
    }

    async fn heartbeat(&self, job_id: JobId, worker: Uuid) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE uploads SET heartbeat_at = ?1
                 WHERE id = ?2 AND status = 'processing' AND claimed_by = ?3",
                params![timestamp(Utc::now()), job_id, worker.to_string()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn reap_expired(&self, lease: Duration) -> Result<Vec<JobId>, StoreError> {
        let lease = chrono::Duration::from_std(lease).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let sql = format!(
            "UPDATE uploads
             SET status = 'error', notes = {}, claimed_by = NULL, updated_at = ?2
             WHERE status = 'processing' AND (heartbeat_at IS NULL OR heartbeat_at < ?3)
             RETURNING id",
            note_append()
        );

        self.with_conn(move |conn| {
            let now = Utc::now();
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(
                    params![LEASE_EXPIRED_NOTE, timestamp(now), timestamp(now - lease)],
                    |row| row.get::<_, JobId>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn fetch_blob(&self, sha256: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let sha256 = sha256.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT content FROM upload_blobs WHERE sha256 = ?1 LIMIT 1",
                    params![sha256],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?)
        })
        .await
    }
}

#[async_trait]
impl StagingSink for SqliteStore {
    async fn replace_call_records(&self, job_id: JobId, records: &[CallRecord]) -> Result<u64, StoreError> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM staging_array_calls WHERE upload_id = ?1", params![job_id])?;
            {
                let now = timestamp(Utc::now());
                let mut insert = tx.prepare(
                    "INSERT INTO staging_array_calls
                     (upload_id, sample_label, rsid, chrom, pos, allele1, allele2, genotype, raw_line, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?;
                for r in &records {
                    insert.execute(params![
                        job_id,
                        r.sample_label,
                        r.rsid,
                        r.chromosome,
                        r.position,
                        r.allele1,
                        r.allele2,
                        r.genotype,
                        r.raw_line,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len() as u64)
        })
        .await
    }

    async fn append_annotated_rows(
        &self,
        job_id: JobId,
        chunk_index: usize,
        rows: &[AnnotatedRow],
    ) -> Result<u64, StoreError> {
        let encoded = rows
            .iter()
            .map(|row| serde_json::to_string(row.fields()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let chunk = chunk_index as i64;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM annotated_variants WHERE upload_id = ?1 AND chunk_index = ?2",
                params![job_id, chunk],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO annotated_variants (upload_id, chunk_index, row_index, fields)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (idx, fields) in encoded.iter().enumerate() {
                    insert.execute(params![job_id, chunk, idx as i64, fields])?;
                }
            }
            tx.commit()?;
            Ok(encoded.len() as u64)
        })
        .await
    }
}
