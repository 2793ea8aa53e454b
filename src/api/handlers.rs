//! Request handlers. Each one is a thin translation between HTTP and an
//! orchestrator operation.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::batch::{self, BatchHandle, BatchPage, BatchRequest};
use crate::db::{CleanupFilter, CleanupReport};
use crate::definitions::{self, ReconcileReport};
use crate::engine::RemoteState;
use crate::error::OrchestratorError;
use crate::lifecycle::{self, ObservedStatus, Transition};
use crate::model::{
    Batch, DefinitionSyncStatus, DocSyncStatus, ProcessingJob, Run, RunStatus, Target,
    WorkflowDefinition,
};
use crate::orchestrator::TriggerRequest;
use crate::pipeline::{self, JobRequest, Submission};
use crate::planner::EligibilityReport;
use crate::retention;
use crate::retry::{self, Lineage};
use crate::signature;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "version": state.version }))
}

// ----- batches -----

pub async fn preview_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Json<EligibilityReport>> {
    Ok(Json(batch::preview(&state.orch, &req).await?))
}

pub async fn execute_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<(StatusCode, Json<BatchHandle>)> {
    let launched = batch::execute(&state.orch, req).await?;
    Ok((StatusCode::ACCEPTED, Json(launched.handle)))
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

pub async fn list_batches(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<BatchPage>> {
    Ok(Json(batch::list_batches(&state.orch, page.limit, page.offset).await?))
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<Batch>> {
    Ok(Json(batch::get_batch(&state.orch, &batch_id).await?))
}

pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<Batch>> {
    Ok(Json(batch::cancel_batch(&state.orch, &batch_id).await?))
}

// ----- runs -----

#[derive(Debug, Default, Deserialize)]
pub struct TriggerBody {
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub retry_of_id: Option<i64>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub run_id: i64,
    pub status: RunStatus,
}

async fn trigger(
    state: &AppState,
    target: Target,
    workflow_key: String,
    body: TriggerBody,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let run = state
        .orch
        .trigger_run(TriggerRequest {
            workflow_key,
            target,
            parameters: body.parameters,
            retry_of_id: body.retry_of_id,
            created_by: body.created_by,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(TriggerResponse {
            run_id: run.id,
            status: run.status,
        }),
    ))
}

pub async fn trigger_node_run(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    trigger(&state, Target::Node(id), key, body).await
}

pub async fn trigger_document_run(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    trigger(&state, Target::Document(id), key, body).await
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<Run>> {
    Ok(Json(state.orch.get_run(run_id).await?))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<Run>> {
    Ok(Json(lifecycle::cancel_run(&state.orch, run_id).await?))
}

pub async fn force_terminate(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<Run>> {
    Ok(Json(lifecycle::force_terminate(&state.orch, run_id).await?))
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub run_id: i64,
    pub transition: Transition,
}

pub async fn refresh_run(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<TransitionResponse>> {
    let transition = lifecycle::refresh_run(&state.orch, run_id).await?;
    Ok(Json(TransitionResponse { run_id, transition }))
}

pub async fn run_lineage(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> ApiResult<Json<Lineage>> {
    Ok(Json(retry::lineage(&state.orch, run_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    pub before_date: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub workflow_key: Option<String>,
    pub node_id: Option<String>,
    pub document_id: Option<String>,
    #[serde(default)]
    pub include_zombie: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl TryFrom<CleanupQuery> for CleanupFilter {
    type Error = ApiError;

    fn try_from(q: CleanupQuery) -> Result<Self, Self::Error> {
        let target = match (q.node_id, q.document_id) {
            (Some(_), Some(_)) => {
                return Err(OrchestratorError::Validation(
                    "node_id and document_id are mutually exclusive".into(),
                )
                .into())
            }
            (Some(id), None) => Some(Target::Node(id)),
            (None, Some(id)) => Some(Target::Document(id)),
            (None, None) => None,
        };
        Ok(CleanupFilter {
            before_date: q.before_date,
            status: q.status,
            workflow_key: q.workflow_key,
            target,
            include_zombie: q.include_zombie,
            dry_run: q.dry_run,
        })
    }
}

pub async fn cleanup_runs(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<Json<CleanupReport>> {
    let filter = CleanupFilter::try_from(query)?;
    Ok(Json(retention::cleanup_runs(&state.orch, &filter).await?))
}

/// Remote engine status report.
#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(alias = "state")]
    pub status: RemoteState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub external_run_id: Option<String>,
}

/// Signature is checked over the path run id and raw body before anything is
/// parsed.
pub async fn engine_callback(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<TransitionResponse>> {
    let provided = headers
        .get(signature::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing callback signature".into()))?;
    if !signature::verify(&state.callback_secret, run_id, &body, provided) {
        warn!(run_id, "rejected callback with invalid signature");
        return Err(ApiError::Unauthorized("invalid callback signature".into()));
    }
    let payload: CallbackBody = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("invalid callback body: {err}")))?;

    let transition = lifecycle::apply_observed(
        &state.orch,
        ObservedStatus {
            run_id,
            state: payload.status,
            result: payload.result,
            error: payload.error,
            external_run_id: payload.external_run_id,
        },
    )
    .await?;
    Ok(Json(TransitionResponse { run_id, transition }))
}

// ----- documents -----

#[derive(Debug, Default, Deserialize)]
pub struct SyncBody {
    #[serde(default)]
    pub created_by: Option<String>,
}

pub async fn sync_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SyncBody>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let run = pipeline::sync_document(&state.orch, &id, body.created_by).await?;
    Ok((
        StatusCode::CREATED,
        Json(TriggerResponse {
            run_id: run.id,
            status: run.status,
        }),
    ))
}

pub async fn sync_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DocSyncStatus>> {
    Ok(Json(pipeline::sync_status(&state.orch, &id).await?))
}

#[derive(Debug, Deserialize)]
pub struct JobBody {
    pub pipeline: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// 201 for a new job, 200 with the existing job for a repeat.
pub async fn submit_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<JobBody>,
) -> ApiResult<(StatusCode, Json<Submission>)> {
    let submission = pipeline::submit_processing_job(
        &state.orch,
        JobRequest {
            document_id: id,
            pipeline: body.pipeline,
            dry_run: body.dry_run,
            parameters: body.parameters,
            created_by: body.created_by,
        },
    )
    .await?;
    let status = match submission {
        Submission::Created(_) => StatusCode::CREATED,
        Submission::AlreadySubmitted(_) => StatusCode::OK,
    };
    Ok((status, Json(submission)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> ApiResult<Json<ProcessingJob>> {
    Ok(Json(pipeline::get_job(&state.orch, job_id).await?))
}

// ----- workflow definitions -----

pub async fn list_workflows(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    Ok(Json(definitions::list(&state.orch).await?))
}

pub async fn reconcile_workflows(
    State(state): State<AppState>,
) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(definitions::reconcile_definitions(&state.orch).await?))
}

#[derive(Debug, Deserialize)]
pub struct DefinitionBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub deployment: String,
    #[serde(default = "empty_schema")]
    pub parameter_schema: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn empty_schema() -> Value {
    json!({})
}

fn default_enabled() -> bool {
    true
}

pub async fn upsert_workflow(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<DefinitionBody>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let def = WorkflowDefinition {
        workflow_key: key,
        name: body.name,
        description: body.description,
        deployment: body.deployment,
        parameter_schema: body.parameter_schema,
        enabled: body.enabled,
        sync_status: DefinitionSyncStatus::Active,
        synced_at: None,
    };
    Ok(Json(definitions::upsert(&state.orch, &def).await?))
}

#[derive(Debug, Deserialize)]
pub struct EnabledBody {
    pub enabled: bool,
}

pub async fn set_workflow_enabled(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<EnabledBody>,
) -> ApiResult<Json<WorkflowDefinition>> {
    Ok(Json(
        definitions::set_enabled(&state.orch, &key, body.enabled).await?,
    ))
}
