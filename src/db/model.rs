//! Row mappers and query filters used by the repositories.
//!
//! Keep these focused on turning SQLite rows into domain entities. State
//! transitions and business rules live in the orchestrator modules.

use crate::model::{
    Batch, BatchItem, BatchKind, BatchStatus, DefinitionSyncStatus, DocSyncStatus, ItemOutcome,
    ProcessingJob, Run, RunStatus, Target, WorkflowDefinition,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Filters for retention cleanup. Only terminal runs are ever matched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupFilter {
    pub before_date: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub workflow_key: Option<String>,
    pub target: Option<Target>,
    #[serde(default)]
    pub include_zombie: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted_count: i64,
    pub zombie_count: i64,
    pub dry_run: bool,
}

fn parse_json(raw: Option<String>, column: &str) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s).with_context(|| format!("invalid JSON in {column}")))
        .transpose()
}

pub fn definition_from_row(row: &SqliteRow) -> Result<WorkflowDefinition> {
    let key: String = row.get("workflow_key");
    let status: String = row.get("sync_status");
    let schema: String = row.get("parameter_schema");
    Ok(WorkflowDefinition {
        sync_status: DefinitionSyncStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("definition {key} has unknown sync status {status}"))?,
        parameter_schema: serde_json::from_str(&schema)
            .with_context(|| format!("definition {key} has invalid parameter schema"))?,
        name: row.get("name"),
        description: row.try_get("description").ok().flatten(),
        deployment: row.get("deployment"),
        enabled: row.get("enabled"),
        synced_at: row.try_get("synced_at").ok().flatten(),
        workflow_key: key,
    })
}

pub fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let id: i64 = row.get("id");
    let node_id: Option<String> = row.try_get("node_id").ok().flatten();
    let document_id: Option<String> = row.try_get("document_id").ok().flatten();
    let target = match (node_id, document_id) {
        (Some(node), None) => Target::Node(node),
        (None, Some(doc)) => Target::Document(doc),
        _ => return Err(anyhow!("run {id} does not have exactly one target")),
    };
    let status: String = row.get("status");
    let parameters: String = row.get("parameters");
    Ok(Run {
        id,
        workflow_key: row.get("workflow_key"),
        target,
        parameters: serde_json::from_str(&parameters)
            .with_context(|| format!("run {id} has invalid parameters"))?,
        status: RunStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("run {id} has unknown status {status}"))?,
        external_run_id: row.try_get("external_run_id").ok().flatten(),
        result: parse_json(row.try_get("result").ok().flatten(), "runs.result")?,
        error: row.try_get("error").ok().flatten(),
        forced_termination: row.get("forced_termination"),
        created_by: row.try_get("created_by").ok().flatten(),
        created_at: row.get("created_at"),
        started_at: row.try_get("started_at").ok().flatten(),
        finished_at: row.try_get("finished_at").ok().flatten(),
        retry_of: row.try_get("retry_of").ok().flatten(),
    })
}

pub fn job_from_row(row: &SqliteRow) -> Result<ProcessingJob> {
    let id: i64 = row.get("id");
    let status: String = row.get("status");
    Ok(ProcessingJob {
        id,
        run_id: row.get("run_id"),
        idempotency_key: row.get("idempotency_key"),
        document_id: row.get("document_id"),
        document_version: row.get("document_version"),
        pipeline: row.get("pipeline"),
        dry_run: row.get("dry_run"),
        status: RunStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("job {id} has unknown run status {status}"))?,
        created_at: row.get("created_at"),
    })
}

pub fn sync_status_from_row(row: &SqliteRow) -> Result<DocSyncStatus> {
    let document_id: String = row.get("document_id");
    let status: String = row.get("last_status");
    Ok(DocSyncStatus {
        last_status: RunStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("sync status for {document_id} is unknown: {status}"))?,
        last_event_id: row.get("last_event_id"),
        last_attempt_version: row.try_get("last_attempt_version").ok().flatten(),
        last_synced_version: row.try_get("last_synced_version").ok().flatten(),
        last_error: row.try_get("last_error").ok().flatten(),
        last_external_run_id: row.try_get("last_external_run_id").ok().flatten(),
        last_run_id: row.try_get("last_run_id").ok().flatten(),
        last_success_at: row.try_get("last_success_at").ok().flatten(),
        updated_at: row.get("updated_at"),
        document_id,
    })
}

pub fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    let batch_id: String = row.get("batch_id");
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(Batch {
        pk: row.get("id"),
        kind: BatchKind::parse_kind(&kind)
            .ok_or_else(|| anyhow!("batch {batch_id} has unknown kind {kind}"))?,
        status: BatchStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("batch {batch_id} has unknown status {status}"))?,
        workflow_key: row.try_get("workflow_key").ok().flatten(),
        root_node_id: row.get("root_node_id"),
        total: row.get("total"),
        success_count: row.get("success_count"),
        failed_count: row.get("failed_count"),
        skipped_count: row.get("skipped_count"),
        concurrency: row.get("concurrency"),
        cancel_requested: row.get("cancel_requested"),
        error: row.try_get("error").ok().flatten(),
        created_by: row.try_get("created_by").ok().flatten(),
        created_at: row.get("created_at"),
        finished_at: row.try_get("finished_at").ok().flatten(),
        items: Vec::new(),
        batch_id,
    })
}

pub fn item_from_row(row: &SqliteRow) -> Result<BatchItem> {
    let seq: i64 = row.get("seq");
    let kind: String = row.get("target_kind");
    let outcome: String = row.get("outcome");
    Ok(BatchItem {
        seq,
        target: Target::from_parts(&kind, row.get("target_id"))
            .ok_or_else(|| anyhow!("batch item {seq} has unknown target kind {kind}"))?,
        name: row.get("name"),
        path: row.get("path"),
        outcome: ItemOutcome::parse_outcome(&outcome)
            .ok_or_else(|| anyhow!("batch item {seq} has unknown outcome {outcome}"))?,
        reason: row.try_get("reason").ok().flatten(),
        run_id: row.try_get("run_id").ok().flatten(),
    })
}
