//! Run state machine inputs after submission: remote status reports (push
//! or poll), operator cancellation and forced termination.
//!
//! Every transition is a conditional update on the prior status, so a report
//! that loses a race, or arrives for a run that is already terminal, is a
//! no-op rather than an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::db;
use crate::engine::RemoteState;
use crate::error::{OrchestratorError, Result};
use crate::model::{Run, RunStatus};
use crate::orchestrator::Orchestrator;

/// A remote status report, whatever transport delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedStatus {
    pub run_id: i64,
    pub state: RemoteState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub external_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transition", content = "detail", rename_all = "snake_case")]
pub enum Transition {
    Applied(RunStatus),
    /// Nothing changed; carries the reason.
    Ignored(String),
}

fn not_running(run: &Run, action: &str) -> OrchestratorError {
    let reason = match run.status {
        RunStatus::Pending => format!("cannot {action}: run has not been submitted"),
        status => format!("cannot {action}: run is {}", status.as_str()),
    };
    OrchestratorError::InvalidTransition {
        run_id: run.id,
        reason,
    }
}

/// Apply one observed status to its run.
#[instrument(skip_all, fields(run_id = obs.run_id, state = ?obs.state))]
pub async fn apply_observed(orch: &Orchestrator, obs: ObservedStatus) -> Result<Transition> {
    let run = orch.get_run(obs.run_id).await?;
    if let (Some(reported), Some(recorded)) = (&obs.external_run_id, &run.external_run_id) {
        if reported != recorded {
            return Err(OrchestratorError::Validation(format!(
                "external run id {reported} does not belong to run {}",
                run.id
            )));
        }
    }

    match run.status {
        status if status.is_terminal() => {
            info!(status = status.as_str(), "discarding report for terminal run");
            // Re-run the idempotent bookkeeping in case an earlier pass was interrupted.
            orch.settle(&run).await;
            return Ok(Transition::Ignored(format!("run already {}", status.as_str())));
        }
        RunStatus::Pending => {
            return Err(OrchestratorError::Conflict(format!(
                "run {} has not finished submitting",
                run.id
            )));
        }
        _ => {}
    }

    let (status, result, error) = match obs.state {
        RemoteState::Pending | RemoteState::Running => {
            debug!("run still in progress");
            return Ok(Transition::Ignored("run still in progress".into()));
        }
        RemoteState::Succeeded => (RunStatus::Success, obs.result, None),
        RemoteState::Failed => (
            RunStatus::Failed,
            None,
            Some(obs.error.unwrap_or_else(|| "remote run failed".into())),
        ),
        RemoteState::Cancelled => (
            RunStatus::Cancelled,
            None,
            Some(obs.error.unwrap_or_else(|| "cancelled by remote engine".into())),
        ),
    };

    let applied =
        db::runs::complete_run(orch.pool(), run.id, status, result.as_ref(), error.as_deref())
            .await?;
    if !applied {
        return Ok(Transition::Ignored("run changed concurrently".into()));
    }
    info!(status = status.as_str(), "run finished");
    let finished = orch.get_run(run.id).await?;
    orch.after_terminal(&finished).await;
    Ok(Transition::Applied(status))
}

/// Cancel a running run. The state only changes once the engine confirms.
#[instrument(skip_all, fields(run_id = run_id))]
pub async fn cancel_run(orch: &Orchestrator, run_id: i64) -> Result<Run> {
    let run = orch.get_run(run_id).await?;
    if run.status != RunStatus::Running {
        return Err(not_running(&run, "cancel"));
    }
    let external_run_id = run
        .external_run_id
        .as_deref()
        .ok_or_else(|| not_running(&run, "cancel"))?;
    orch.engine()
        .cancel(external_run_id)
        .await
        .map_err(|err| OrchestratorError::Remote(format!("{err:#}")))?;

    if db::runs::complete_run(
        orch.pool(),
        run_id,
        RunStatus::Cancelled,
        None,
        Some("cancelled by operator"),
    )
    .await?
    {
        info!("run cancelled");
        let cancelled = orch.get_run(run_id).await?;
        orch.after_terminal(&cancelled).await;
        return Ok(cancelled);
    }
    orch.get_run(run_id).await
}

/// `now - age` as a timestamp.
pub(crate) fn cutoff(age: Duration) -> Result<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age).map_err(anyhow::Error::from)?;
    Ok(Utc::now() - age)
}

pub(crate) fn forced_reason(threshold: Duration) -> String {
    format!(
        "forced termination: no remote confirmation after {}s",
        threshold.as_secs()
    )
}

/// Mark a running run failed without remote confirmation, provided it has
/// been running longer than the configured zombie threshold.
#[instrument(skip_all, fields(run_id = run_id))]
pub async fn force_terminate(orch: &Orchestrator, run_id: i64) -> Result<Run> {
    let threshold = orch.settings().zombie_threshold;
    let run = orch.get_run(run_id).await?;
    if run.status != RunStatus::Running {
        return Err(not_running(&run, "force-terminate"));
    }
    let started_before = cutoff(threshold)?;
    if !db::runs::force_terminate(orch.pool(), run_id, started_before, &forced_reason(threshold))
        .await?
    {
        let current = orch.get_run(run_id).await?;
        if current.status == RunStatus::Running {
            return Err(OrchestratorError::InvalidTransition {
                run_id,
                reason: format!(
                    "run has been running for less than {}s",
                    threshold.as_secs()
                ),
            });
        }
        return Err(not_running(&current, "force-terminate"));
    }

    warn!("run force-terminated");
    if let Some(external_run_id) = run.external_run_id.as_deref() {
        if let Err(err) = orch.engine().cancel(external_run_id).await {
            warn!(?err, external_run_id, "remote cancel after forced termination failed");
        }
    }
    let terminated = orch.get_run(run_id).await?;
    orch.after_terminal(&terminated).await;
    Ok(terminated)
}

/// Poll the engine once for a running run and apply the answer.
#[instrument(skip_all, fields(run_id = run_id))]
pub async fn refresh_run(orch: &Orchestrator, run_id: i64) -> Result<Transition> {
    let run = orch.get_run(run_id).await?;
    let Some(external_run_id) = run.external_run_id.clone() else {
        return Ok(Transition::Ignored(format!(
            "run is {} and has no remote reference",
            run.status.as_str()
        )));
    };
    if run.status != RunStatus::Running {
        return Ok(Transition::Ignored(format!("run already {}", run.status.as_str())));
    }
    let remote = orch
        .engine()
        .status(&external_run_id)
        .await
        .map_err(|err| OrchestratorError::Remote(format!("{err:#}")))?;
    apply_observed(
        orch,
        ObservedStatus {
            run_id,
            state: remote.state,
            result: remote.result,
            error: remote.error,
            external_run_id: Some(external_run_id),
        },
    )
    .await
}

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Poll with exponential backoff until the run is terminal or `timeout`
/// elapses. Returns the last observed run either way; callers check
/// `status.is_terminal()`.
pub async fn wait_for_terminal(orch: &Orchestrator, run_id: i64, opts: PollOptions) -> Result<Run> {
    let deadline = Instant::now() + opts.timeout;
    let mut interval = opts.initial_interval;
    loop {
        let run = orch.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        if run.status == RunStatus::Running {
            match refresh_run(orch, run_id).await {
                Ok(Transition::Applied(_)) => return orch.get_run(run_id).await,
                Ok(Transition::Ignored(_)) => {}
                Err(OrchestratorError::Remote(err)) => warn!(run_id, %err, "status poll failed"),
                Err(err) => return Err(err),
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(run);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
        interval = (interval * 2).min(opts.max_interval);
    }
}
