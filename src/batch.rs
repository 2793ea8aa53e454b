//! Batch execution: plan a tree, then fan out one submission per eligible
//! target through a bounded pool. The batch outlives the call that started it
//! and finalizes when its last run settles.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::db::{self, batches::NewBatch};
use crate::error::{OrchestratorError, Result};
use crate::model::{Batch, BatchItem, BatchKind, BatchStatus, NewRun, Target};
use crate::orchestrator::{LiveGuard, Orchestrator};
use crate::pipeline;
use crate::planner::{self, EligibilityReport, PlanFilters, PlanMode, PlanRequest};

/// Preview and execute share one request shape. Without `workflow_key` the
/// batch synchronizes the documents attached to the planned nodes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchRequest {
    pub root_node_id: String,
    #[serde(default)]
    pub workflow_key: Option<String>,
    #[serde(default)]
    pub include_descendants: bool,
    #[serde(flatten)]
    pub filters: PlanFilters,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl BatchRequest {
    fn plan_request(&self) -> PlanRequest {
        PlanRequest {
            root_node_id: self.root_node_id.clone(),
            include_descendants: self.include_descendants,
            filters: self.filters.clone(),
            mode: if self.workflow_key.is_some() {
                PlanMode::Workflow
            } else {
                PlanMode::Sync
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchHandle {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: i64,
}

/// Returned by [`execute`]. `submissions` is the background submission loop,
/// absent when planning failed.
#[derive(Debug)]
pub struct LaunchedBatch {
    pub handle: BatchHandle,
    pub submissions: Option<JoinHandle<()>>,
}

#[derive(Debug, Serialize)]
pub struct BatchPage {
    pub items: Vec<Batch>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Everything a submission task needs, shared across the pool.
#[derive(Debug)]
struct SubmissionPlan {
    pk: i64,
    batch_id: String,
    workflow_key: Option<String>,
    parameters: Value,
    created_by: Option<String>,
    concurrency: usize,
}

enum LoopEnd {
    Exhausted,
    Cancelled,
}

/// Side-effect free eligibility report.
#[instrument(skip_all, fields(root = %req.root_node_id))]
pub async fn preview(orch: &Orchestrator, req: &BatchRequest) -> Result<EligibilityReport> {
    if let Some(key) = req.workflow_key.as_deref() {
        if db::fetch_definition(orch.pool(), key).await?.is_none() {
            return Err(OrchestratorError::Validation(format!(
                "unknown workflow key {key}"
            )));
        }
    }
    planner::plan(orch.content(), orch.pool(), &req.plan_request()).await
}

/// Create the batch, plan it, and start the submission loop. Returns once the
/// loop is spawned; a planning failure leaves a `failed` batch behind.
#[instrument(skip_all, fields(root = %req.root_node_id))]
pub async fn execute(orch: &Orchestrator, req: BatchRequest) -> Result<LaunchedBatch> {
    let settings = orch.settings();
    let concurrency = req.concurrency.unwrap_or(settings.default_concurrency);
    if concurrency == 0 || concurrency > settings.max_concurrency {
        return Err(OrchestratorError::Validation(format!(
            "concurrency must be within 1..={}",
            settings.max_concurrency
        )));
    }
    let parameters = req.parameters.clone().unwrap_or_else(|| json!({}));
    if let Some(key) = req.workflow_key.as_deref() {
        orch.runnable_definition(key, &parameters).await?;
    }

    let batch = db::batches::create_batch(
        orch.pool(),
        &NewBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            kind: if req.workflow_key.is_some() {
                BatchKind::Workflow
            } else {
                BatchKind::Sync
            },
            workflow_key: req.workflow_key.clone(),
            root_node_id: req.root_node_id.clone(),
            concurrency: concurrency as i64,
            created_by: req.created_by.clone(),
        },
    )
    .await?;
    let live = orch.track_batch(batch.pk);

    let report = match planner::plan(orch.content(), orch.pool(), &req.plan_request()).await {
        Ok(report) => report,
        Err(err) => {
            error!(batch_id = %batch.batch_id, error = %err, "batch planning failed");
            db::batches::mark_planning_failed(orch.pool(), batch.pk, &err.to_string()).await?;
            return Ok(LaunchedBatch {
                handle: BatchHandle {
                    batch_id: batch.batch_id,
                    status: BatchStatus::Failed,
                    total: 0,
                },
                submissions: None,
            });
        }
    };
    db::batches::record_plan(orch.pool(), batch.pk, &report.items).await?;
    info!(
        batch_id = %batch.batch_id,
        total = report.total_nodes,
        eligible = report.can_execute,
        concurrency,
        "batch planned"
    );

    let plan = Arc::new(SubmissionPlan {
        pk: batch.pk,
        batch_id: batch.batch_id.clone(),
        workflow_key: req.workflow_key,
        parameters,
        created_by: req.created_by,
        concurrency,
    });
    let submissions = tokio::spawn(drive_submissions(orch.clone(), plan, live));

    Ok(LaunchedBatch {
        handle: BatchHandle {
            batch_id: batch.batch_id,
            status: BatchStatus::Pending,
            total: report.total_nodes as i64,
        },
        submissions: Some(submissions),
    })
}

async fn drive_submissions(orch: Orchestrator, plan: Arc<SubmissionPlan>, _live: LiveGuard) {
    let pool = orch.pool();
    let pk = plan.pk;
    let leftover = match submit_all(&orch, &plan).await {
        Ok(LoopEnd::Exhausted) => None,
        Ok(LoopEnd::Cancelled) => Some("batch_cancelled"),
        Err(err) => {
            error!(batch_id = %plan.batch_id, error = %err, "batch submission loop aborted");
            if let Err(err) = db::batches::record_error(pool, pk, &err.to_string()).await {
                warn!(?err, "failed to record batch error");
            }
            Some("batch_aborted")
        }
    };
    if let Some(reason) = leftover {
        match db::batches::skip_remaining(pool, pk, reason).await {
            Ok(skipped) => info!(batch_id = %plan.batch_id, skipped, reason, "skipped unprocessed targets"),
            Err(err) => warn!(?err, "failed to skip unprocessed targets"),
        }
    }
    if let Err(err) = db::batches::mark_submissions_issued(pool, pk).await {
        warn!(?err, "failed to mark batch submissions issued");
        return;
    }
    match db::batches::try_finalize(pool, pk).await {
        Ok(Some(status)) => info!(batch_id = %plan.batch_id, status = status.as_str(), "batch finished"),
        Ok(None) => debug!(batch_id = %plan.batch_id, "batch running until its runs settle"),
        Err(err) => warn!(?err, "failed to finalize batch"),
    }
}

async fn submit_all(orch: &Orchestrator, plan: &Arc<SubmissionPlan>) -> Result<LoopEnd> {
    let items = db::batches::pending_items(orch.pool(), plan.pk).await?;
    let semaphore = Arc::new(Semaphore::new(plan.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut end = LoopEnd::Exhausted;

    for item in items {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("batch semaphore closed")?;
        if db::batches::is_cancel_requested(orch.pool(), plan.pk).await? {
            end = LoopEnd::Cancelled;
            break;
        }
        db::batches::touch_heartbeat(orch.pool(), plan.pk).await?;
        let orch = orch.clone();
        let plan = Arc::clone(plan);
        tasks.spawn(async move {
            let _permit = permit;
            submit_item(&orch, &plan, item).await
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|err| OrchestratorError::Internal(anyhow!(err)));
        if let Err(err) = outcome.and_then(|r| r) {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(end),
    }
}

/// Create, attach and submit one run. A failed submission is an ordinary
/// item outcome; only store errors abort the loop.
#[instrument(skip_all, fields(batch_id = %plan.batch_id, seq = item.seq))]
async fn submit_item(orch: &Orchestrator, plan: &SubmissionPlan, item: BatchItem) -> Result<()> {
    let pool = orch.pool();
    let run = match (&plan.workflow_key, &item.target) {
        (Some(key), target) => {
            db::runs::insert_run(
                pool,
                &NewRun {
                    workflow_key: key.clone(),
                    target: target.clone(),
                    parameters: plan.parameters.clone(),
                    created_by: plan.created_by.clone(),
                    retry_of: None,
                },
            )
            .await?
        }
        (None, Target::Document(document_id)) => {
            match pipeline::create_sync_run(orch, document_id, plan.created_by.clone(), None).await
            {
                Ok(run) => run,
                Err(OrchestratorError::NotFound(what)) => {
                    warn!(%what, "target vanished after planning");
                    db::batches::skip_item(pool, plan.pk, item.seq, "target_missing").await?;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        (None, Target::Node(node_id)) => {
            return Err(OrchestratorError::Internal(anyhow!(
                "sync batch planned node {node_id} instead of a document"
            )));
        }
    };

    if !db::batches::attach_run(pool, plan.pk, item.seq, run.id).await? {
        warn!(run_id = run.id, "batch item no longer pending; dropping run");
        if db::runs::mark_submission_failed(pool, run.id, "batch item no longer pending").await? {
            let failed = orch.get_run(run.id).await?;
            orch.after_terminal(&failed).await;
        }
        return Ok(());
    }

    match orch.submit_run(&run).await {
        Ok(_) => Ok(()),
        Err(OrchestratorError::Submission { run_id, message }) => {
            debug!(run_id, %message, "batch item submission failed");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

pub async fn get_batch(orch: &Orchestrator, batch_id: &str) -> Result<Batch> {
    db::batches::fetch_batch(orch.pool(), batch_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("batch {batch_id}")))
}

pub async fn list_batches(orch: &Orchestrator, limit: i64, offset: i64) -> Result<BatchPage> {
    let limit = limit.clamp(1, 100);
    let offset = offset.max(0);
    let items = db::batches::list_batches(orch.pool(), limit, offset).await?;
    let total = db::batches::count_batches(orch.pool()).await?;
    Ok(BatchPage {
        items,
        total,
        limit,
        offset,
    })
}

/// Stop issuing new submissions for a batch. Runs already submitted keep
/// going and must be cancelled individually.
#[instrument(skip_all, fields(batch_id = %batch_id))]
pub async fn cancel_batch(orch: &Orchestrator, batch_id: &str) -> Result<Batch> {
    let batch = get_batch(orch, batch_id).await?;
    if batch.status.is_terminal() {
        return Err(OrchestratorError::Conflict(format!(
            "batch {batch_id} is already {}",
            batch.status.as_str()
        )));
    }
    if !db::batches::request_cancel(orch.pool(), batch.pk).await? {
        return Err(OrchestratorError::Conflict(format!(
            "batch {batch_id} finished before it could be cancelled"
        )));
    }
    info!("batch cancellation requested");
    get_batch(orch, batch_id).await
}
