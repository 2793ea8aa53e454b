//! Stuck-run reclamation and the background task that drives it.

use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::db;
use crate::error::Result;
use crate::lifecycle::{cutoff, forced_reason};
use crate::orchestrator::Orchestrator;

/// Force-terminate every run that has been `running` longer than
/// `threshold`. Remote cancellation is attempted but never required.
#[instrument(skip_all, fields(threshold_secs = threshold.as_secs()))]
pub async fn reap(orch: &Orchestrator, threshold: Duration) -> Result<usize> {
    let pool = orch.pool();
    let started_before = cutoff(threshold)?;
    let reason = forced_reason(threshold);

    let mut terminated = Vec::new();
    for run in db::runs::list_stale_running(pool, started_before).await? {
        if db::runs::force_terminate(pool, run.id, started_before, &reason).await? {
            warn!(run_id = run.id, workflow_key = %run.workflow_key, "reaped zombie run");
            terminated.push(run);
        }
    }

    let cancels = terminated.iter().filter_map(|run| {
        let external_run_id = run.external_run_id.as_deref()?;
        Some(async move { (external_run_id, orch.engine().cancel(external_run_id).await) })
    });
    for (external_run_id, res) in join_all(cancels).await {
        if let Err(err) = res {
            warn!(?err, external_run_id, "remote cancel of reaped run failed");
        }
    }

    for run in &terminated {
        let run = orch.get_run(run.id).await?;
        orch.after_terminal(&run).await;
    }
    if !terminated.is_empty() {
        info!(count = terminated.len(), "reaped stuck runs");
    }
    Ok(terminated.len())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub stalled_runs: usize,
    pub aborted_batches: usize,
}

/// Close out work whose submission never finished, typically after a crash:
/// pending runs become `failed`, pending batches skip what they never
/// submitted and finalize. Work this process is still driving, and batches
/// whose heartbeat is newer than `threshold`, are skipped.
#[instrument(skip_all, fields(threshold_secs = threshold.as_secs()))]
pub async fn recover_stalled(orch: &Orchestrator, threshold: Duration) -> Result<RecoveryReport> {
    let pool = orch.pool();
    let before = cutoff(threshold)?;
    let mut report = RecoveryReport::default();

    for run in db::runs::list_stale_pending(pool, before).await? {
        if orch.is_submitting(run.id) {
            debug!(run_id = run.id, "submission still in flight");
            continue;
        }
        if let Some(pk) = db::batches::batch_pk_for_run(pool, run.id).await? {
            if orch.is_driving_batch(pk) {
                debug!(run_id = run.id, batch_pk = pk, "batch still submitting");
                continue;
            }
        }
        if db::runs::mark_submission_failed(pool, run.id, "submission interrupted").await? {
            warn!(run_id = run.id, "pending run never finished submitting");
            let failed = orch.get_run(run.id).await?;
            orch.after_terminal(&failed).await;
            report.stalled_runs += 1;
        }
    }

    for batch in db::batches::list_stale_pending(pool, before).await? {
        if orch.is_driving_batch(batch.pk) {
            debug!(batch_id = %batch.batch_id, "batch still submitting");
            continue;
        }
        warn!(batch_id = %batch.batch_id, "batch submission loop never finished");
        db::batches::record_error(pool, batch.pk, "batch submission interrupted").await?;
        db::batches::skip_remaining(pool, batch.pk, "batch_aborted").await?;
        if db::batches::mark_submissions_issued(pool, batch.pk).await? {
            report.aborted_batches += 1;
        }
        db::batches::try_finalize(pool, batch.pk).await?;
    }
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub threshold: Duration,
}

/// Periodic reap + recovery until the shutdown flag flips.
pub struct ReaperTask {
    orch: Orchestrator,
    config: ReaperConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl ReaperTask {
    pub fn new(orch: Orchestrator, config: ReaperConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            orch,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            threshold_secs = self.config.threshold.as_secs(),
            "reaper task started"
        );
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("reaper task shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => self.sweep().await,
            }
        }
    }

    async fn sweep(&self) {
        if let Err(err) = reap(&self.orch, self.config.threshold).await {
            error!(error = %err, "reap sweep failed");
        }
        match recover_stalled(&self.orch, self.config.threshold).await {
            Ok(report) if report != RecoveryReport::default() => {
                info!(
                    stalled_runs = report.stalled_runs,
                    aborted_batches = report.aborted_batches,
                    "recovered stalled submissions"
                );
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "stalled submission recovery failed"),
        }
    }
}

pub fn spawn_reaper(
    orch: Orchestrator,
    config: ReaperConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = ReaperTask::new(orch, config, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}
