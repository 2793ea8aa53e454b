//! Batch record store: aggregate counters plus the ordered detail list.

use super::model::{batch_from_row, item_from_row};
use super::repo::Pool;
use crate::model::{Batch, BatchItem, BatchKind, BatchStatus, ItemOutcome};
use crate::planner::PlanItem;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_id: String,
    pub kind: BatchKind,
    pub workflow_key: Option<String>,
    pub root_node_id: String,
    pub concurrency: i64,
    pub created_by: Option<String>,
}

#[instrument(skip_all, fields(batch_id = %new.batch_id))]
pub async fn create_batch(pool: &Pool, new: &NewBatch) -> Result<Batch> {
    let pk: i64 = sqlx::query(
        "INSERT INTO batches (batch_id, kind, workflow_key, root_node_id, status, concurrency, created_by, created_at, heartbeat_at) \
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?7) RETURNING id",
    )
    .bind(&new.batch_id)
    .bind(new.kind.as_str())
    .bind(&new.workflow_key)
    .bind(&new.root_node_id)
    .bind(new.concurrency)
    .bind(&new.created_by)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert batch")?
    .get("id");
    fetch_batch_by_pk(pool, pk)
        .await?
        .ok_or_else(|| anyhow!("batch {pk} vanished after insert"))
}

/// Store the planned detail list: eligible targets as `pending`, the rest as
/// `skipped` with their reason. Sets `total` and `skipped_count`.
#[instrument(skip_all, fields(batch_pk = pk, planned = items.len()))]
pub async fn record_plan(pool: &Pool, pk: i64, items: &[PlanItem]) -> Result<()> {
    let mut tx = pool.begin().await?;
    let mut skipped = 0_i64;
    for (seq, item) in items.iter().enumerate() {
        let (outcome, reason) = if item.can_execute {
            (ItemOutcome::Pending, None)
        } else {
            skipped += 1;
            (ItemOutcome::Skipped, item.skip_reason.map(|r| r.as_str()))
        };
        sqlx::query(
            "INSERT INTO batch_items (batch_pk, seq, target_kind, target_id, name, path, outcome, reason) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(pk)
        .bind(seq as i64)
        .bind(item.target.kind_str())
        .bind(item.target.id())
        .bind(&item.name)
        .bind(&item.path)
        .bind(outcome.as_str())
        .bind(reason)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("UPDATE batches SET total = ?, skipped_count = ? WHERE id = ? AND status = 'pending'")
        .bind(items.len() as i64)
        .bind(skipped)
        .bind(pk)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn fetch_batch(pool: &Pool, batch_id: &str) -> Result<Option<Batch>> {
    let row = sqlx::query("SELECT * FROM batches WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut batch = batch_from_row(&row)?;
    batch.items = list_items(pool, batch.pk).await?;
    Ok(Some(batch))
}

pub async fn fetch_batch_by_pk(pool: &Pool, pk: i64) -> Result<Option<Batch>> {
    let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
        .bind(pk)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(batch_from_row).transpose()
}

/// Newest first, without detail lists.
pub async fn list_batches(pool: &Pool, limit: i64, offset: i64) -> Result<Vec<Batch>> {
    let rows = sqlx::query("SELECT * FROM batches ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(batch_from_row).collect()
}

pub async fn count_batches(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batches")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn list_items(pool: &Pool, pk: i64) -> Result<Vec<BatchItem>> {
    let rows = sqlx::query("SELECT * FROM batch_items WHERE batch_pk = ? ORDER BY seq ASC")
        .bind(pk)
        .fetch_all(pool)
        .await?;
    rows.iter().map(item_from_row).collect()
}

/// Eligible items that have not been submitted yet, in plan order.
pub async fn pending_items(pool: &Pool, pk: i64) -> Result<Vec<BatchItem>> {
    let rows = sqlx::query(
        "SELECT * FROM batch_items WHERE batch_pk = ? AND outcome = 'pending' ORDER BY seq ASC",
    )
    .bind(pk)
    .fetch_all(pool)
    .await?;
    rows.iter().map(item_from_row).collect()
}

/// Link a freshly created run to its item before the run is submitted.
#[instrument(skip_all, fields(batch_pk = pk, seq = seq, run_id = run_id))]
pub async fn attach_run(pool: &Pool, pk: i64, seq: i64, run_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE batch_items SET outcome = 'submitted', run_id = ? \
         WHERE batch_pk = ? AND seq = ? AND outcome = 'pending'",
    )
    .bind(run_id)
    .bind(pk)
    .bind(seq)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Resolve the item owning `run_id` to its terminal outcome and bump the
/// matching counter in one transaction. Returns the batch pk when this call
/// performed the resolution, `None` if the run has no item or was already
/// resolved.
#[instrument(skip_all, fields(run_id = run_id, outcome = outcome.as_str()))]
pub async fn resolve_item_for_run(
    pool: &Pool,
    run_id: i64,
    outcome: ItemOutcome,
    reason: Option<&str>,
) -> Result<Option<i64>> {
    let counter = match outcome {
        ItemOutcome::Success => "success_count",
        ItemOutcome::Failed | ItemOutcome::Cancelled => "failed_count",
        ItemOutcome::Skipped => "skipped_count",
        ItemOutcome::Pending | ItemOutcome::Submitted => {
            return Err(anyhow!("cannot resolve a batch item to {}", outcome.as_str()))
        }
    };

    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        "UPDATE batch_items SET outcome = ?, reason = COALESCE(?, reason) \
         WHERE run_id = ? AND outcome = 'submitted' RETURNING batch_pk",
    )
    .bind(outcome.as_str())
    .bind(reason)
    .bind(run_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };
    let pk: i64 = row.get("batch_pk");
    let sql = format!("UPDATE batches SET {counter} = {counter} + 1 WHERE id = ?");
    sqlx::query(&sql).bind(pk).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(Some(pk))
}

/// Skip one still-`pending` item, e.g. when its target vanished after planning.
#[instrument(skip_all, fields(batch_pk = pk, seq = seq, reason = %reason))]
pub async fn skip_item(pool: &Pool, pk: i64, seq: i64, reason: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE batch_items SET outcome = 'skipped', reason = ? \
         WHERE batch_pk = ? AND seq = ? AND outcome = 'pending'",
    )
    .bind(reason)
    .bind(pk)
    .bind(seq)
    .execute(&mut *tx)
    .await?;
    let skipped = res.rows_affected() == 1;
    if skipped {
        sqlx::query("UPDATE batches SET skipped_count = skipped_count + 1 WHERE id = ?")
            .bind(pk)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(skipped)
}

/// Mark every still-`pending` item as skipped with `reason`.
#[instrument(skip_all, fields(batch_pk = pk, reason = %reason))]
pub async fn skip_remaining(pool: &Pool, pk: i64, reason: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE batch_items SET outcome = 'skipped', reason = ? WHERE batch_pk = ? AND outcome = 'pending'",
    )
    .bind(reason)
    .bind(pk)
    .execute(&mut *tx)
    .await?;
    let skipped = res.rows_affected();
    if skipped > 0 {
        sqlx::query("UPDATE batches SET skipped_count = skipped_count + ? WHERE id = ?")
            .bind(skipped as i64)
            .bind(pk)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(skipped)
}

pub async fn is_cancel_requested(pool: &Pool, pk: i64) -> Result<bool> {
    let flag: Option<bool> = sqlx::query_scalar("SELECT cancel_requested FROM batches WHERE id = ?")
        .bind(pk)
        .fetch_optional(pool)
        .await?;
    Ok(flag.unwrap_or(true))
}

/// Flag a non-terminal batch as cancelled by an operator.
#[instrument(skip_all, fields(batch_pk = pk))]
pub async fn request_cancel(pool: &Pool, pk: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE batches SET cancel_requested = 1 WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(pk)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Attach an error to the batch; a batch carrying an error finalizes as `failed`.
#[instrument(skip_all, fields(batch_pk = pk))]
pub async fn record_error(pool: &Pool, pk: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE batches SET error = COALESCE(error, ?) WHERE id = ?")
        .bind(error)
        .bind(pk)
        .execute(pool)
        .await?;
    Ok(())
}

/// Planning failed: the batch ends as `failed` with no items.
#[instrument(skip_all, fields(batch_pk = pk))]
pub async fn mark_planning_failed(pool: &Pool, pk: i64, error: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE batches SET status = 'failed', error = ?, finished_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(pk)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `pending -> running` once the submission loop has issued every submission.
pub async fn mark_submissions_issued(pool: &Pool, pk: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE batches SET status = 'running' WHERE id = ? AND status = 'pending'")
        .bind(pk)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Move a `running` batch to its terminal status once every visited target
/// is accounted for. Returns the terminal status if this call applied it.
#[instrument(skip_all, fields(batch_pk = pk))]
pub async fn try_finalize(pool: &Pool, pk: i64) -> Result<Option<BatchStatus>> {
    let row = sqlx::query(
        "UPDATE batches SET \
            status = CASE WHEN error IS NOT NULL THEN 'failed' \
                          WHEN cancel_requested = 1 THEN 'cancelled' \
                          ELSE 'completed' END, \
            finished_at = ? \
         WHERE id = ? AND status = 'running' \
           AND success_count + failed_count + skipped_count = total \
         RETURNING status",
    )
    .bind(Utc::now())
    .bind(pk)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let status: String = row.get("status");
    Ok(BatchStatus::parse_state(&status))
}

/// The batch a run was created for, if any.
pub async fn batch_pk_for_run(pool: &Pool, run_id: i64) -> Result<Option<i64>> {
    let pk = sqlx::query_scalar("SELECT batch_pk FROM batch_items WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(pk)
}

/// Record that the submission loop of batch `pk` is still making progress.
pub async fn touch_heartbeat(pool: &Pool, pk: i64) -> Result<()> {
    sqlx::query("UPDATE batches SET heartbeat_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(pk)
        .execute(pool)
        .await?;
    Ok(())
}

/// Batches still in `pending` whose submission loop has shown no progress
/// since `active_before`.
pub async fn list_stale_pending(pool: &Pool, active_before: DateTime<Utc>) -> Result<Vec<Batch>> {
    let rows = sqlx::query(
        "SELECT * FROM batches WHERE status = 'pending' \
         AND julianday(COALESCE(heartbeat_at, created_at)) < julianday(?) ORDER BY id ASC",
    )
    .bind(active_before)
    .fetch_all(pool)
    .await?;
    rows.iter().map(batch_from_row).collect()
}
