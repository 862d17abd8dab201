// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    error::ErrorKind,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::app::types::{
    CorrelationId, ExternalJobHandle, JobKind, JobStatus, NewRemoteJob, RemoteJob, StatusUpdate,
    StoredTelemetryEvent, TelemetryEvent,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("correlation id already recorded: {0}")]
    DuplicateCorrelationId(String),
    #[error("scheduler job already recorded: {0}")]
    DuplicateSchedulerId(i64),
    #[error("job not found: {0}")]
    JobNotFound(i64),
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Async SQLite store for RemoteJobs and their telemetry.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        self.ensure_jobs_table().await?;
        self.ensure_telemetry_table().await?;
        Ok(())
    }

    async fn ensure_jobs_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS remote_jobs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              kind TEXT NOT NULL,
              scheduler_id INTEGER NOT NULL,
              scheduler_name TEXT NOT NULL,
              correlation_id TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'waiting',
              start_time TEXT,
              end_time TEXT,
              error_message TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_remote_jobs_correlation_id
              ON remote_jobs(correlation_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_remote_jobs_scheduler_id
              ON remote_jobs(scheduler_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_remote_jobs_status ON remote_jobs(status);",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_telemetry_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              job_id INTEGER NOT NULL REFERENCES remote_jobs(id) ON DELETE CASCADE,
              sequence_number INTEGER NOT NULL,
              event_time TEXT NOT NULL,
              payload TEXT NOT NULL,
              received_at TEXT NOT NULL,
              UNIQUE (job_id, sequence_number)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_job(&self, job: &NewRemoteJob) -> Result<i64> {
        let now = now_rfc3339();
        let rec = sqlx::query(
            r#"
            insert into remote_jobs(
                kind, scheduler_id, scheduler_name, correlation_id, status, created_at, updated_at
            )
            values (?1, ?2, ?3, ?4, 'waiting', ?5, ?5)
            returning id;
            "#,
        )
        .bind(job.kind.as_str())
        .bind(job.handle.job_id)
        .bind(job.handle.job_name.as_str())
        .bind(job.correlation_id.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match db_error_kind(&err) {
            Some(ErrorKind::UniqueViolation) if violates_column(&err, "scheduler_id") => {
                StoreError::DuplicateSchedulerId(job.handle.job_id)
            }
            Some(ErrorKind::UniqueViolation) => {
                StoreError::DuplicateCorrelationId(job.correlation_id.to_string())
            }
            _ => StoreError::Sqlx(err),
        })?;
        Ok(rec.try_get::<i64, _>("id")?)
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<RemoteJob>> {
        let row = sqlx::query("select * from remote_jobs where id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    pub async fn list_non_terminal_jobs(&self) -> Result<Vec<RemoteJob>> {
        let rows = sqlx::query(
            r#"
            select * from remote_jobs
            where status not in ('completed', 'failed')
            order by id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// Writes a status transition. Terminal rows are never touched and
    /// already-known timestamps are kept. Returns whether a row changed.
    pub async fn update_job_status(&self, id: i64, update: &StatusUpdate) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update remote_jobs
            set status = ?1,
                start_time = coalesce(start_time, ?2),
                end_time = coalesce(end_time, ?3),
                error_message = coalesce(?4, error_message),
                updated_at = ?5
            where id = ?6
              and status not in ('completed', 'failed')
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.start_time.as_deref())
        .bind(update.end_time.as_deref())
        .bind(update.error_message.as_deref())
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn lookup_job_id_by_correlation_id(&self, correlation_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query("select id from remote_jobs where correlation_id = ?1")
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>("id")?)),
            None => Ok(None),
        }
    }

    pub async fn delete_job(&self, id: i64) -> Result<bool> {
        let res = sqlx::query("delete from remote_jobs where id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Returns false when `(job_id, sequence_number)` was already stored.
    pub async fn insert_telemetry_event(&self, job_id: i64, event: &TelemetryEvent) -> Result<bool> {
        let payload = serde_json::to_string(&event.payload)?;
        let res = sqlx::query(
            r#"
            insert into telemetry_events(job_id, sequence_number, event_time, payload, received_at)
            values (?1, ?2, ?3, ?4, ?5)
            on conflict(job_id, sequence_number) do nothing
            "#,
        )
        .bind(job_id)
        .bind(event.sequence_number)
        .bind(event.time.as_str())
        .bind(payload)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| match db_error_kind(&err) {
            Some(ErrorKind::ForeignKeyViolation) => StoreError::JobNotFound(job_id),
            _ => StoreError::Sqlx(err),
        })?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn list_telemetry_events(&self, job_id: i64) -> Result<Vec<StoredTelemetryEvent>> {
        let rows = sqlx::query(
            r#"
            select job_id, sequence_number, event_time, payload, received_at
            from telemetry_events
            where job_id = ?1
            order by sequence_number asc
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_event).collect()
    }
}

// -- helpers

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<RemoteJob> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(RemoteJob {
        id: row.try_get("id")?,
        kind: JobKind::from_str(&kind).map_err(|detail| corrupt("remote_jobs", detail))?,
        handle: ExternalJobHandle {
            job_id: row.try_get("scheduler_id")?,
            job_name: row.try_get("scheduler_name")?,
        },
        correlation_id: CorrelationId::from_raw(row.try_get("correlation_id")?),
        status: JobStatus::from_str(&status).map_err(|detail| corrupt("remote_jobs", detail))?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Result<StoredTelemetryEvent> {
    let payload: String = row.try_get("payload")?;
    Ok(StoredTelemetryEvent {
        job_id: row.try_get("job_id")?,
        sequence_number: row.try_get("sequence_number")?,
        time: row.try_get("event_time")?,
        payload: serde_json::from_str(&payload)?,
        received_at: row.try_get("received_at")?,
    })
}

fn db_error_kind(err: &sqlx::Error) -> Option<ErrorKind> {
    match err {
        sqlx::Error::Database(db) => Some(db.kind()),
        _ => None,
    }
}

/// SQLite names the offending column in the message:
/// `UNIQUE constraint failed: remote_jobs.scheduler_id`.
fn violates_column(err: &sqlx::Error, column: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains(column),
        _ => false,
    }
}

fn corrupt(table: &'static str, detail: String) -> StoreError {
    StoreError::CorruptRow { table, detail }
}
