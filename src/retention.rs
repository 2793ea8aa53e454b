//! Explicit retention cleanup. Normal operation never deletes runs.

use tracing::info;

use crate::db::{self, CleanupFilter, CleanupReport};
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Orchestrator;

pub async fn cleanup_runs(orch: &Orchestrator, filter: &CleanupFilter) -> Result<CleanupReport> {
    if let Some(status) = filter.status {
        if !status.is_terminal() {
            return Err(OrchestratorError::Validation(format!(
                "only terminal runs can be cleaned up, got status {}",
                status.as_str()
            )));
        }
    }
    let report = db::runs::cleanup_runs(orch.pool(), filter).await?;
    info!(
        deleted = report.deleted_count,
        zombies = report.zombie_count,
        dry_run = report.dry_run,
        "run cleanup"
    );
    Ok(report)
}
