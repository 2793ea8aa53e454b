//! Retry lineage: a retry is a fresh run pointing back at the run it retries.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, instrument};

use crate::db;
use crate::error::{OrchestratorError, Result};
use crate::model::{NewRun, Run, RunStatus, Target, SYNC_WORKFLOW_KEY};
use crate::orchestrator::Orchestrator;
use crate::pipeline;

/// Create a `pending` retry of a failed or cancelled run. The retry keeps the
/// original's workflow and target; `parameters` replaces the original's
/// parameters when given.
#[instrument(skip_all, fields(original_id = original_id))]
pub async fn create_retry(
    orch: &Orchestrator,
    original_id: i64,
    parameters: Option<Value>,
    created_by: Option<String>,
) -> Result<Run> {
    let original = orch.get_run(original_id).await?;
    if !matches!(original.status, RunStatus::Failed | RunStatus::Cancelled) {
        return Err(OrchestratorError::InvalidTransition {
            run_id: original_id,
            reason: format!(
                "only failed or cancelled runs can be retried, run is {}",
                original.status.as_str()
            ),
        });
    }

    let retry = if original.workflow_key == SYNC_WORKFLOW_KEY {
        let Target::Document(document_id) = &original.target else {
            return Err(OrchestratorError::Validation(format!(
                "sync run {original_id} has no document target"
            )));
        };
        pipeline::create_sync_run(orch, document_id, created_by, Some(original_id)).await?
    } else {
        let parameters = parameters.unwrap_or_else(|| original.parameters.clone());
        orch.runnable_definition(&original.workflow_key, &parameters)
            .await?;
        db::runs::insert_run(
            orch.pool(),
            &NewRun {
                workflow_key: original.workflow_key.clone(),
                target: original.target.clone(),
                parameters,
                created_by,
                retry_of: Some(original_id),
            },
        )
        .await?
    };
    info!(retry_id = retry.id, "retry created");
    Ok(retry)
}

#[derive(Debug, Clone, Serialize)]
pub struct Lineage {
    pub original: Run,
    /// Every retry descending from `original`, oldest first.
    pub attempts: Vec<Run>,
    pub latest_status: RunStatus,
}

/// Walk `retry_of` up to the original run, then collect every retry below it.
pub async fn lineage(orch: &Orchestrator, run_id: i64) -> Result<Lineage> {
    let mut original = orch.get_run(run_id).await?;
    let mut seen = HashSet::from([original.id]);
    while let Some(parent_id) = original.retry_of {
        if !seen.insert(parent_id) {
            break;
        }
        match db::runs::fetch_run(orch.pool(), parent_id).await? {
            Some(parent) => original = parent,
            None => break,
        }
    }

    let mut attempts = Vec::new();
    let mut visited = HashSet::from([original.id]);
    let mut frontier = vec![original.id];
    while let Some(id) = frontier.pop() {
        for retry in db::runs::list_retries_of(orch.pool(), id).await? {
            if visited.insert(retry.id) {
                frontier.push(retry.id);
                attempts.push(retry);
            }
        }
    }
    attempts.sort_by_key(|r| r.id);

    let latest_status = attempts.last().unwrap_or(&original).status;
    Ok(Lineage {
        original,
        attempts,
        latest_status,
    })
}
