//! Workflow definition admin: reconciliation against the engine's deployment
//! list plus the two admin writes.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, instrument, warn};

use crate::db;
use crate::error::{OrchestratorError, Result};
use crate::model::{DefinitionSyncStatus, WorkflowDefinition, SYNC_WORKFLOW_KEY};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub active: usize,
    pub missing: usize,
    pub errored: usize,
}

/// Mark each definition `active` or `missing` depending on whether its
/// deployment still exists. If the engine cannot be listed, every definition
/// is marked `error`.
#[instrument(skip_all)]
pub async fn reconcile_definitions(orch: &Orchestrator) -> Result<ReconcileReport> {
    let pool = orch.pool();
    let definitions = db::list_definitions(pool).await?;
    let now = Utc::now();
    let mut report = ReconcileReport::default();

    let deployments: HashSet<String> = match orch.engine().list_deployments().await {
        Ok(names) => names.into_iter().collect(),
        Err(err) => {
            warn!(?err, "engine deployment list unavailable");
            for def in &definitions {
                db::mark_definition_sync(pool, &def.workflow_key, DefinitionSyncStatus::Error, now)
                    .await?;
            }
            report.errored = definitions.len();
            return Ok(report);
        }
    };

    for def in &definitions {
        let status = if deployments.contains(&def.deployment) {
            report.active += 1;
            DefinitionSyncStatus::Active
        } else {
            report.missing += 1;
            DefinitionSyncStatus::Missing
        };
        db::mark_definition_sync(pool, &def.workflow_key, status, now).await?;
    }
    info!(active = report.active, missing = report.missing, "definitions reconciled");
    Ok(report)
}

pub async fn list(orch: &Orchestrator) -> Result<Vec<WorkflowDefinition>> {
    Ok(db::list_definitions(orch.pool()).await?)
}

pub async fn upsert(orch: &Orchestrator, def: &WorkflowDefinition) -> Result<WorkflowDefinition> {
    if def.workflow_key == SYNC_WORKFLOW_KEY {
        return Err(OrchestratorError::Validation(format!(
            "{SYNC_WORKFLOW_KEY} is reserved"
        )));
    }
    if def.workflow_key.trim().is_empty() || def.deployment.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "workflow_key and deployment must be non-empty".into(),
        ));
    }
    if !def.parameter_schema.is_object() {
        return Err(OrchestratorError::Validation(
            "parameter_schema must be a JSON object".into(),
        ));
    }
    db::upsert_definition(orch.pool(), def).await?;
    get(orch, &def.workflow_key).await
}

pub async fn get(orch: &Orchestrator, workflow_key: &str) -> Result<WorkflowDefinition> {
    db::fetch_definition(orch.pool(), workflow_key)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {workflow_key}")))
}

pub async fn set_enabled(
    orch: &Orchestrator,
    workflow_key: &str,
    enabled: bool,
) -> Result<WorkflowDefinition> {
    if !db::set_definition_enabled(orch.pool(), workflow_key, enabled).await? {
        return Err(OrchestratorError::NotFound(format!("workflow {workflow_key}")));
    }
    info!(workflow_key, enabled, "workflow toggled");
    get(orch, workflow_key).await
}
