//! Run creation, submission, and the bookkeeping that follows a run into a
//! terminal state.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::content::ContentStore;
use crate::db::{self, Pool};
use crate::engine::{RemoteEngine, SubmitSpec};
use crate::error::{OrchestratorError, Result};
use crate::model::{
    ItemOutcome, NewRun, Run, RunStatus, Target, WorkflowDefinition, SYNC_WORKFLOW_KEY,
};

/// Runtime knobs taken from the configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub callback_base_url: String,
    pub sync_deployment: String,
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    pub zombie_threshold: Duration,
    pub write_back_results: bool,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            callback_base_url: cfg.engine.callback_base_url.clone(),
            sync_deployment: cfg.engine.sync_deployment.clone(),
            default_concurrency: cfg.orchestrator.default_concurrency,
            max_concurrency: cfg.orchestrator.max_concurrency,
            zombie_threshold: cfg.zombie_threshold(),
            write_back_results: cfg.orchestrator.write_back_results,
        }
    }
}

/// A single-run trigger request.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub workflow_key: String,
    pub target: Target,
    pub parameters: Option<Value>,
    pub retry_of_id: Option<i64>,
    pub created_by: Option<String>,
}

/// Ids of batches or runs whose submission this process is still driving.
#[derive(Debug, Default)]
pub(crate) struct LiveSet(Mutex<HashSet<i64>>);

impl LiveSet {
    fn ids(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(self: &Arc<Self>, id: i64) -> LiveGuard {
        self.ids().insert(id);
        LiveGuard {
            set: Arc::clone(self),
            id,
        }
    }

    fn contains(&self, id: i64) -> bool {
        self.ids().contains(&id)
    }
}

/// Marks one id live until dropped.
#[derive(Debug)]
pub(crate) struct LiveGuard {
    set: Arc<LiveSet>,
    id: i64,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.set.ids().remove(&self.id);
    }
}

/// Shared handle over the stores and the two remote collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    pool: Pool,
    engine: Arc<dyn RemoteEngine>,
    content: Arc<dyn ContentStore>,
    settings: Arc<Settings>,
    live_batches: Arc<LiveSet>,
    live_runs: Arc<LiveSet>,
}

impl Orchestrator {
    pub fn new(
        pool: Pool,
        engine: Arc<dyn RemoteEngine>,
        content: Arc<dyn ContentStore>,
        settings: Settings,
    ) -> Self {
        Self {
            pool,
            engine,
            content,
            settings: Arc::new(settings),
            live_batches: Arc::default(),
            live_runs: Arc::default(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn engine(&self) -> &dyn RemoteEngine {
        self.engine.as_ref()
    }

    pub fn content(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Held by the task planning and submitting batch `pk`.
    pub(crate) fn track_batch(&self, pk: i64) -> LiveGuard {
        self.live_batches.enter(pk)
    }

    /// Whether this process is still planning or submitting batch `pk`.
    pub fn is_driving_batch(&self, pk: i64) -> bool {
        self.live_batches.contains(pk)
    }

    /// Whether this process has a submission of `run_id` in flight.
    pub fn is_submitting(&self, run_id: i64) -> bool {
        self.live_runs.contains(run_id)
    }

    pub fn callback_url(&self, run_id: i64) -> String {
        format!(
            "{}/callback/{}",
            self.settings.callback_base_url.trim_end_matches('/'),
            run_id
        )
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Run> {
        db::runs::fetch_run(&self.pool, run_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {run_id}")))
    }

    /// Definition that may be triggered right now with `parameters`.
    pub async fn runnable_definition(
        &self,
        workflow_key: &str,
        parameters: &Value,
    ) -> Result<WorkflowDefinition> {
        if workflow_key == SYNC_WORKFLOW_KEY {
            return Err(OrchestratorError::Validation(format!(
                "{SYNC_WORKFLOW_KEY} is reserved for document synchronization"
            )));
        }
        let def = db::fetch_definition(&self.pool, workflow_key)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("unknown workflow key {workflow_key}"))
            })?;
        if !def.enabled {
            return Err(OrchestratorError::Validation(format!(
                "workflow {workflow_key} is disabled"
            )));
        }
        if !parameters.is_object() {
            return Err(OrchestratorError::Validation(
                "parameters must be a JSON object".into(),
            ));
        }
        let missing: Vec<&str> = def
            .required_parameters()
            .into_iter()
            .filter(|name| parameters.get(*name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "missing required parameters: {}",
                missing.join(", ")
            )));
        }
        Ok(def)
    }

    /// The target must exist in the content store.
    pub async fn ensure_target(&self, target: &Target) -> Result<()> {
        let exists = match target {
            Target::Node(id) => self.content.node(id).await?.is_some(),
            Target::Document(id) => self.content.document(id).await?.is_some(),
        };
        if exists {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(format!(
                "{} {} does not exist",
                target.kind_str(),
                target.id()
            )))
        }
    }

    async fn deployment_for(&self, workflow_key: &str) -> Result<String> {
        if workflow_key == SYNC_WORKFLOW_KEY {
            return Ok(self.settings.sync_deployment.clone());
        }
        let def = db::fetch_definition(&self.pool, workflow_key)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("unknown workflow key {workflow_key}"))
            })?;
        Ok(def.deployment)
    }

    /// Validate and create a pending run, or a retry of `retry_of_id`, then
    /// submit it. A failed submission is recorded on the run and surfaced.
    #[instrument(skip_all, fields(workflow_key = %req.workflow_key, target = req.target.id()))]
    pub async fn trigger_run(&self, req: TriggerRequest) -> Result<Run> {
        let run = match req.retry_of_id {
            Some(original_id) => {
                let original = self.get_run(original_id).await?;
                if original.workflow_key != req.workflow_key || original.target != req.target {
                    return Err(OrchestratorError::Validation(format!(
                        "run {original_id} is not a {} run on {} {}",
                        req.workflow_key,
                        req.target.kind_str(),
                        req.target.id()
                    )));
                }
                crate::retry::create_retry(self, original_id, req.parameters, req.created_by)
                    .await?
            }
            None => {
                let parameters = req.parameters.unwrap_or_else(|| json!({}));
                self.runnable_definition(&req.workflow_key, &parameters)
                    .await?;
                self.ensure_target(&req.target).await?;
                db::runs::insert_run(
                    &self.pool,
                    &NewRun {
                        workflow_key: req.workflow_key,
                        target: req.target,
                        parameters,
                        created_by: req.created_by,
                        retry_of: None,
                    },
                )
                .await?
            }
        };
        self.submit_run(&run).await
    }

    /// `pending -> running` on acceptance, `pending -> failed` otherwise.
    #[instrument(skip_all, fields(run_id = run.id))]
    pub async fn submit_run(&self, run: &Run) -> Result<Run> {
        let _live = self.live_runs.enter(run.id);
        let deployment = match self.deployment_for(&run.workflow_key).await {
            Ok(deployment) => deployment,
            Err(err) => return self.fail_submission(run, err.to_string()).await,
        };
        let spec = SubmitSpec {
            deployment,
            parameters: run.parameters.clone(),
            run_id: run.id,
            callback_url: Some(self.callback_url(run.id)),
        };

        match self.engine.submit(&spec).await {
            Ok(external_run_id) => {
                let applied =
                    db::runs::mark_running(&self.pool, run.id, &external_run_id, Utc::now())
                        .await?;
                if !applied {
                    warn!(external_run_id, "run left pending before submission completed");
                } else if let Target::Document(document_id) = &run.target {
                    if run.workflow_key == SYNC_WORKFLOW_KEY {
                        db::jobs::mark_sync_submitted(
                            &self.pool,
                            document_id,
                            run.id,
                            &external_run_id,
                        )
                        .await?;
                    }
                }
                info!(external_run_id, "run submitted");
                self.get_run(run.id).await
            }
            Err(err) => self.fail_submission(run, format!("{err:#}")).await,
        }
    }

    async fn fail_submission(&self, run: &Run, message: String) -> Result<Run> {
        warn!(run_id = run.id, error = %message, "run submission failed");
        if db::runs::mark_submission_failed(&self.pool, run.id, &message).await? {
            let failed = self.get_run(run.id).await?;
            self.after_terminal(&failed).await;
        }
        Err(OrchestratorError::Submission {
            run_id: run.id,
            message,
        })
    }

    /// Called once by whichever writer moved `run` into a terminal state.
    pub(crate) async fn after_terminal(&self, run: &Run) {
        self.settle(run).await;
        if run.status == RunStatus::Success && self.settings.write_back_results {
            self.write_back(run).await;
        }
    }

    /// Idempotent bookkeeping for a terminal run: resolve its batch item,
    /// finalize the batch, record the sync outcome. Safe to repeat.
    #[instrument(skip_all, fields(run_id = run.id, status = run.status.as_str()))]
    pub(crate) async fn settle(&self, run: &Run) {
        let Some(outcome) = ItemOutcome::from_run_status(run.status) else {
            return;
        };
        match db::batches::resolve_item_for_run(&self.pool, run.id, outcome, run.error.as_deref())
            .await
        {
            Ok(Some(batch_pk)) => match db::batches::try_finalize(&self.pool, batch_pk).await {
                Ok(Some(status)) => info!(batch_pk, status = status.as_str(), "batch finished"),
                Ok(None) => {}
                Err(err) => warn!(?err, batch_pk, "failed to finalize batch"),
            },
            Ok(None) => {}
            Err(err) => warn!(?err, "failed to resolve batch item"),
        }

        if run.workflow_key == SYNC_WORKFLOW_KEY {
            if let Some(document_id) = run.target.document_id() {
                if let Err(err) = db::jobs::record_sync_outcome(
                    &self.pool,
                    document_id,
                    run.id,
                    run.status,
                    run.error.as_deref(),
                )
                .await
                {
                    warn!(?err, document_id, "failed to record sync outcome");
                }
            }
        }
    }

    /// Best effort: failures are logged and never touch the run.
    async fn write_back(&self, run: &Run) {
        let Some(result) = run.result.as_ref() else {
            return;
        };
        if run.workflow_key == SYNC_WORKFLOW_KEY {
            return;
        }
        match db::jobs::fetch_job_by_run(&self.pool, run.id).await {
            Ok(Some(job)) if job.dry_run => return,
            Ok(_) => {}
            Err(err) => {
                warn!(?err, run_id = run.id, "skipping write-back, job lookup failed");
                return;
            }
        }
        if let Err(err) = self.content.write_result(&run.target, result).await {
            warn!(?err, run_id = run.id, "result write-back failed");
        }
    }
}
