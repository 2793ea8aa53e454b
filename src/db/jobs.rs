//! Document pipeline jobs and the per-document sync status cache.

use super::model::{job_from_row, sync_status_from_row};
use super::repo::Pool;
use super::runs::insert_run_tx;
use crate::model::{DocSyncStatus, NewRun, ProcessingJob, RunStatus};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{debug, instrument};

const JOB_SELECT: &str = "SELECT j.*, r.status AS status FROM processing_jobs j JOIN runs r ON r.id = j.run_id";

#[derive(Debug, Clone)]
pub struct NewJob {
    pub idempotency_key: String,
    pub document_id: String,
    pub document_version: i64,
    pub pipeline: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobInsert {
    Created(ProcessingJob),
    /// The idempotency key already exists; carries the job that owns it.
    Duplicate(ProcessingJob),
}

/// Insert the job's run and the job row atomically. The unique constraint on
/// `idempotency_key` decides which of two concurrent callers wins.
#[instrument(skip_all, fields(key = %job.idempotency_key))]
pub async fn insert_job_with_run(pool: &Pool, run: &NewRun, job: &NewJob) -> Result<JobInsert> {
    let mut tx = pool.begin().await?;
    let run_id = insert_run_tx(&mut tx, run).await?;
    let inserted = sqlx::query(
        "INSERT INTO processing_jobs (run_id, idempotency_key, document_id, document_version, pipeline, dry_run, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(&job.idempotency_key)
    .bind(&job.document_id)
    .bind(job.document_version)
    .bind(&job.pipeline)
    .bind(job.dry_run)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(_) => {
            tx.commit().await?;
            let created = fetch_job_by_key(pool, &job.idempotency_key)
                .await?
                .ok_or_else(|| anyhow!("job {} vanished after insert", job.idempotency_key))?;
            Ok(JobInsert::Created(created))
        }
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            tx.rollback().await?;
            debug!("idempotency key already taken");
            let existing = fetch_job_by_key(pool, &job.idempotency_key)
                .await?
                .ok_or_else(|| anyhow!("duplicate key {} has no job", job.idempotency_key))?;
            Ok(JobInsert::Duplicate(existing))
        }
        Err(err) => Err(err).context("failed to insert processing job"),
    }
}

pub async fn fetch_job(pool: &Pool, id: i64) -> Result<Option<ProcessingJob>> {
    let sql = format!("{JOB_SELECT} WHERE j.id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn fetch_job_by_key(pool: &Pool, key: &str) -> Result<Option<ProcessingJob>> {
    let sql = format!("{JOB_SELECT} WHERE j.idempotency_key = ?");
    let row = sqlx::query(&sql).bind(key).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn fetch_job_by_run(pool: &Pool, run_id: i64) -> Result<Option<ProcessingJob>> {
    let sql = format!("{JOB_SELECT} WHERE j.run_id = ?");
    let row = sqlx::query(&sql).bind(run_id).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

#[derive(Debug, Clone)]
pub struct SyncAttempt<'a> {
    pub document_id: &'a str,
    pub event_id: &'a str,
    pub run_id: i64,
    pub version: Option<i64>,
    pub status: RunStatus,
    pub external_run_id: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// Overwrite the document's sync row with the latest attempt. Success history
/// (`last_synced_version`, `last_success_at`) is carried over.
#[instrument(skip_all, fields(document_id = %attempt.document_id, run_id = attempt.run_id))]
pub async fn record_sync_attempt(pool: &Pool, attempt: &SyncAttempt<'_>) -> Result<()> {
    sqlx::query(
        "INSERT INTO doc_sync_status \
            (document_id, last_event_id, last_attempt_version, last_status, last_error, last_external_run_id, last_run_id, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(document_id) DO UPDATE SET \
            last_event_id = excluded.last_event_id, last_attempt_version = excluded.last_attempt_version, \
            last_status = excluded.last_status, last_error = excluded.last_error, \
            last_external_run_id = excluded.last_external_run_id, last_run_id = excluded.last_run_id, \
            updated_at = excluded.updated_at",
    )
    .bind(attempt.document_id)
    .bind(attempt.event_id)
    .bind(attempt.version)
    .bind(attempt.status.as_str())
    .bind(attempt.error)
    .bind(attempt.external_run_id)
    .bind(attempt.run_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to record sync attempt")?;
    Ok(())
}

/// The attempt's run was accepted by the engine: store its reference and move
/// a still-pending attempt to `running`.
#[instrument(skip_all, fields(document_id = %document_id, run_id = run_id))]
pub async fn mark_sync_submitted(
    pool: &Pool,
    document_id: &str,
    run_id: i64,
    external_run_id: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE doc_sync_status SET last_external_run_id = ?, updated_at = ?, \
            last_status = CASE WHEN last_status = 'pending' THEN 'running' ELSE last_status END \
         WHERE document_id = ? AND last_run_id = ?",
    )
    .bind(external_run_id)
    .bind(Utc::now())
    .bind(document_id)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Record the terminal outcome of `run_id`, unless a newer attempt has
/// already replaced it or the outcome was already recorded.
#[instrument(skip_all, fields(document_id = %document_id, run_id = run_id, status = status.as_str()))]
pub async fn record_sync_outcome(
    pool: &Pool,
    document_id: &str,
    run_id: i64,
    status: RunStatus,
    error: Option<&str>,
) -> Result<bool> {
    let now = Utc::now();
    let success = status == RunStatus::Success;
    let res = sqlx::query(
        "UPDATE doc_sync_status SET \
            last_status = ?, last_error = ?, updated_at = ?, \
            last_synced_version = CASE WHEN ? THEN last_attempt_version ELSE last_synced_version END, \
            last_success_at = CASE WHEN ? THEN ? ELSE last_success_at END \
         WHERE document_id = ? AND last_run_id = ? AND last_status IN ('pending', 'running')",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .bind(success)
    .bind(success)
    .bind(now)
    .bind(document_id)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn fetch_sync_status(pool: &Pool, document_id: &str) -> Result<Option<DocSyncStatus>> {
    let row = sqlx::query("SELECT * FROM doc_sync_status WHERE document_id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(sync_status_from_row).transpose()
}
