use super::model::definition_from_row;
use crate::model::{DefinitionSyncStatus, WorkflowDefinition};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        // WAL and stricter durability for file-backed stores.
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    // One connection keeps an in-memory database shared by every caller.
    let max_connections = if in_memory { 1 } else { 8 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all, fields(workflow_key = %def.workflow_key))]
pub async fn upsert_definition(pool: &Pool, def: &WorkflowDefinition) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO workflow_definitions \
            (workflow_key, name, description, deployment, parameter_schema, enabled, sync_status, synced_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(workflow_key) DO UPDATE SET \
            name = excluded.name, description = excluded.description, deployment = excluded.deployment, \
            parameter_schema = excluded.parameter_schema, enabled = excluded.enabled, \
            sync_status = excluded.sync_status, synced_at = excluded.synced_at, updated_at = excluded.updated_at",
    )
    .bind(&def.workflow_key)
    .bind(&def.name)
    .bind(&def.description)
    .bind(&def.deployment)
    .bind(def.parameter_schema.to_string())
    .bind(def.enabled)
    .bind(def.sync_status.as_str())
    .bind(def.synced_at)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to upsert workflow definition")?;
    Ok(())
}

pub async fn fetch_definition(pool: &Pool, workflow_key: &str) -> Result<Option<WorkflowDefinition>> {
    let row = sqlx::query("SELECT * FROM workflow_definitions WHERE workflow_key = ?")
        .bind(workflow_key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(definition_from_row).transpose()
}

pub async fn list_definitions(pool: &Pool) -> Result<Vec<WorkflowDefinition>> {
    let rows = sqlx::query("SELECT * FROM workflow_definitions ORDER BY workflow_key")
        .fetch_all(pool)
        .await?;
    rows.iter().map(definition_from_row).collect()
}

#[instrument(skip_all)]
pub async fn set_definition_enabled(pool: &Pool, workflow_key: &str, enabled: bool) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE workflow_definitions SET enabled = ?, updated_at = ? WHERE workflow_key = ?",
    )
    .bind(enabled)
    .bind(Utc::now())
    .bind(workflow_key)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn mark_definition_sync(
    pool: &Pool,
    workflow_key: &str,
    status: DefinitionSyncStatus,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_definitions SET sync_status = ?, synced_at = ?, updated_at = ? WHERE workflow_key = ?",
    )
    .bind(status.as_str())
    .bind(synced_at)
    .bind(synced_at)
    .bind(workflow_key)
    .execute(pool)
    .await?;
    Ok(())
}
