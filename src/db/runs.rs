//! Run record store. Every status change is a compare-and-swap on the prior
//! status; a `false` return means another writer got there first.

use super::model::{run_from_row, CleanupFilter, CleanupReport};
use super::repo::Pool;
use crate::model::{NewRun, Run, RunStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

#[instrument(skip_all, fields(workflow_key = %new.workflow_key))]
pub async fn insert_run(pool: &Pool, new: &NewRun) -> Result<Run> {
    let mut tx = pool.begin().await?;
    let id = insert_run_tx(&mut tx, new).await?;
    tx.commit().await?;
    fetch_run(pool, id)
        .await?
        .with_context(|| format!("run {id} vanished after insert"))
}

pub(crate) async fn insert_run_tx(tx: &mut Transaction<'_, Sqlite>, new: &NewRun) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO runs (workflow_key, node_id, document_id, parameters, status, created_by, created_at, retry_of) \
         VALUES (?, ?, ?, ?, 'pending', ?, ?, ?) RETURNING id",
    )
    .bind(&new.workflow_key)
    .bind(new.target.node_id())
    .bind(new.target.document_id())
    .bind(new.parameters.to_string())
    .bind(&new.created_by)
    .bind(Utc::now())
    .bind(new.retry_of)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert run")?;
    Ok(rec.get("id"))
}

pub async fn fetch_run(pool: &Pool, id: i64) -> Result<Option<Run>> {
    let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

/// `pending -> running` once the engine accepted the submission.
#[instrument(skip_all, fields(run_id = id))]
pub async fn mark_running(
    pool: &Pool,
    id: i64,
    external_run_id: &str,
    started_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE runs SET status = 'running', external_run_id = ?, started_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(external_run_id)
    .bind(started_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `pending -> failed` when the submission itself failed.
#[instrument(skip_all, fields(run_id = id))]
pub async fn mark_submission_failed(pool: &Pool, id: i64, error: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE runs SET status = 'failed', error = ?, finished_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `running -> success | failed | cancelled` from a remote report or a confirmed cancel.
#[instrument(skip_all, fields(run_id = id, status = status.as_str()))]
pub async fn complete_run(
    pool: &Pool,
    id: i64,
    status: RunStatus,
    result: Option<&Value>,
    error: Option<&str>,
) -> Result<bool> {
    debug_assert!(status.is_terminal());
    let res = sqlx::query(
        "UPDATE runs SET status = ?, result = ?, error = ?, finished_at = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(result.map(Value::to_string))
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `running -> failed` without remote confirmation, only if the run started
/// before `started_before`.
#[instrument(skip_all, fields(run_id = id))]
pub async fn force_terminate(
    pool: &Pool,
    id: i64,
    started_before: DateTime<Utc>,
    reason: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE runs SET status = 'failed', error = ?, forced_termination = 1, finished_at = ? \
         WHERE id = ? AND status = 'running' AND julianday(started_at) < julianday(?)",
    )
    .bind(reason)
    .bind(Utc::now())
    .bind(id)
    .bind(started_before)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Running runs whose `started_at` is older than `started_before`, oldest first.
pub async fn list_stale_running(pool: &Pool, started_before: DateTime<Utc>) -> Result<Vec<Run>> {
    let rows = sqlx::query(
        "SELECT * FROM runs WHERE status = 'running' AND julianday(started_at) < julianday(?) \
         ORDER BY started_at ASC, id ASC",
    )
    .bind(started_before)
    .fetch_all(pool)
    .await?;
    rows.iter().map(run_from_row).collect()
}

/// Pending runs created before `created_before`: their submission never
/// completed. Runs of a batch whose loop is still beating are left alone.
pub async fn list_stale_pending(pool: &Pool, created_before: DateTime<Utc>) -> Result<Vec<Run>> {
    let rows = sqlx::query(
        "SELECT * FROM runs r WHERE r.status = 'pending' AND julianday(r.created_at) < julianday(?1) \
         AND NOT EXISTS ( \
            SELECT 1 FROM batch_items i JOIN batches b ON b.id = i.batch_pk \
            WHERE i.run_id = r.id AND b.status = 'pending' \
              AND julianday(COALESCE(b.heartbeat_at, b.created_at)) >= julianday(?1)) \
         ORDER BY r.id ASC",
    )
    .bind(created_before)
    .fetch_all(pool)
    .await?;
    rows.iter().map(run_from_row).collect()
}

/// Direct retries of `id`, oldest first.
pub async fn list_retries_of(pool: &Pool, id: i64) -> Result<Vec<Run>> {
    let rows = sqlx::query("SELECT * FROM runs WHERE retry_of = ? ORDER BY id ASC")
        .bind(id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(run_from_row).collect()
}

const CLEANUP_WHERE: &str = "status IN ('success', 'failed', 'cancelled') \
     AND (?1 IS NULL OR julianday(created_at) < julianday(?1)) \
     AND (?2 IS NULL OR status = ?2) \
     AND (?3 IS NULL OR workflow_key = ?3) \
     AND (?4 IS NULL OR node_id = ?4) \
     AND (?5 IS NULL OR document_id = ?5) \
     AND (?6 = 1 OR forced_termination = 0)";

/// Retention cleanup. In dry-run mode only counts what would be deleted.
#[instrument(skip_all, fields(dry_run = filter.dry_run))]
pub async fn cleanup_runs(pool: &Pool, filter: &CleanupFilter) -> Result<CleanupReport> {
    let status = filter.status.map(|s| s.as_str());
    let node_id = filter.target.as_ref().and_then(|t| t.node_id());
    let document_id = filter.target.as_ref().and_then(|t| t.document_id());

    let mut tx = pool.begin().await?;
    let count_sql = format!(
        "SELECT COUNT(*) AS total, COALESCE(SUM(forced_termination), 0) AS zombies FROM runs WHERE {CLEANUP_WHERE}"
    );
    let row = sqlx::query(&count_sql)
        .bind(filter.before_date)
        .bind(status)
        .bind(filter.workflow_key.as_deref())
        .bind(node_id)
        .bind(document_id)
        .bind(filter.include_zombie)
        .fetch_one(&mut *tx)
        .await?;
    let mut report = CleanupReport {
        deleted_count: row.get("total"),
        zombie_count: row.get("zombies"),
        dry_run: filter.dry_run,
    };

    if !filter.dry_run && report.deleted_count > 0 {
        let delete_sql = format!("DELETE FROM runs WHERE {CLEANUP_WHERE}");
        let res = sqlx::query(&delete_sql)
            .bind(filter.before_date)
            .bind(status)
            .bind(filter.workflow_key.as_deref())
            .bind(node_id)
            .bind(document_id)
            .bind(filter.include_zombie)
            .execute(&mut *tx)
            .await?;
        report.deleted_count = res.rows_affected() as i64;
    }
    tx.commit().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::{init_pool, run_migrations};
    use crate::model::Target;
    use chrono::Duration;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn new_run(target: Target) -> NewRun {
        NewRun {
            workflow_key: "summarize".into(),
            target,
            parameters: json!({"language": "en"}),
            created_by: Some("alice".into()),
            retry_of: None,
        }
    }

    #[tokio::test]
    async fn transitions_are_compare_and_swap() {
        let pool = setup_pool().await;
        let run = insert_run(&pool, &new_run(Target::Node("n1".into()))).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.finished_at.is_none());

        assert!(mark_running(&pool, run.id, "ext-1", Utc::now()).await.unwrap());
        assert!(!mark_running(&pool, run.id, "ext-2", Utc::now()).await.unwrap());

        let payload = json!({"summary": "ok"});
        assert!(complete_run(&pool, run.id, RunStatus::Success, Some(&payload), None)
            .await
            .unwrap());
        assert!(!complete_run(&pool, run.id, RunStatus::Failed, None, Some("late"))
            .await
            .unwrap());

        let stored = fetch_run(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.external_run_id.as_deref(), Some("ext-1"));
        assert_eq!(stored.result, Some(payload));
        assert!(stored.error.is_none());
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn force_terminate_respects_started_at() {
        let pool = setup_pool().await;
        let run = insert_run(&pool, &new_run(Target::Document("d1".into()))).await.unwrap();
        let started = Utc::now() - Duration::minutes(10);
        mark_running(&pool, run.id, "ext", started).await.unwrap();

        let too_early = started - Duration::minutes(1);
        assert!(!force_terminate(&pool, run.id, too_early, "forced").await.unwrap());
        assert_eq!(list_stale_running(&pool, too_early).await.unwrap().len(), 0);

        let cutoff = Utc::now() - Duration::minutes(5);
        assert_eq!(list_stale_running(&pool, cutoff).await.unwrap().len(), 1);
        assert!(force_terminate(&pool, run.id, cutoff, "forced").await.unwrap());

        let stored = fetch_run(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.forced_termination);
        assert_eq!(stored.error.as_deref(), Some("forced"));
    }

    #[tokio::test]
    async fn cleanup_counts_then_deletes_terminal_runs_only() {
        let pool = setup_pool().await;
        let live = insert_run(&pool, &new_run(Target::Node("n1".into()))).await.unwrap();
        let failed = insert_run(&pool, &new_run(Target::Node("n2".into()))).await.unwrap();
        mark_submission_failed(&pool, failed.id, "boom").await.unwrap();
        let zombie = insert_run(&pool, &new_run(Target::Node("n3".into()))).await.unwrap();
        mark_running(&pool, zombie.id, "ext", Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        force_terminate(&pool, zombie.id, Utc::now(), "forced").await.unwrap();

        let mut filter = CleanupFilter {
            dry_run: true,
            ..Default::default()
        };
        let report = cleanup_runs(&pool, &filter).await.unwrap();
        assert_eq!(report, CleanupReport { deleted_count: 1, zombie_count: 0, dry_run: true });

        filter.include_zombie = true;
        let report = cleanup_runs(&pool, &filter).await.unwrap();
        assert_eq!(report.deleted_count, 2);
        assert_eq!(report.zombie_count, 1);
        assert!(fetch_run(&pool, failed.id).await.unwrap().is_some());

        filter.dry_run = false;
        filter.target = Some(Target::Node("n3".into()));
        let report = cleanup_runs(&pool, &filter).await.unwrap();
        assert_eq!(report.deleted_count, 1);
        assert!(fetch_run(&pool, zombie.id).await.unwrap().is_none());
        assert!(fetch_run(&pool, live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn target_must_be_exclusive() {
        let pool = setup_pool().await;
        let res = sqlx::query(
            "INSERT INTO runs (workflow_key, node_id, document_id, status, created_at) VALUES ('k', 'n', 'd', 'pending', ?)",
        )
        .bind(Utc::now())
        .execute(&pool)
        .await;
        assert!(res.is_err());
    }
}
