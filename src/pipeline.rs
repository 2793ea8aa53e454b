//! Document-level operations: content-addressed processing jobs and the
//! fixed document synchronization run.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::content::DocumentInfo;
use crate::db::{self, jobs::JobInsert, jobs::NewJob, jobs::SyncAttempt};
use crate::error::{OrchestratorError, Result};
use crate::idempotency;
use crate::model::{
    DocSyncStatus, NewRun, ProcessingJob, Run, RunStatus, Target, SYNC_WORKFLOW_KEY,
};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub document_id: String,
    pub pipeline: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "job", rename_all = "snake_case")]
pub enum Submission {
    Created(ProcessingJob),
    /// Same document version, pipeline and dry-run flag were submitted before.
    AlreadySubmitted(ProcessingJob),
}

impl Submission {
    pub fn job(&self) -> &ProcessingJob {
        match self {
            Submission::Created(job) | Submission::AlreadySubmitted(job) => job,
        }
    }

    /// Strict view for callers that treat a repeat as an error.
    pub fn into_created(self) -> Result<ProcessingJob> {
        match self {
            Submission::Created(job) => Ok(job),
            Submission::AlreadySubmitted(job) => Err(OrchestratorError::Duplicate {
                key: job.idempotency_key,
                existing_job_id: job.id,
            }),
        }
    }
}

async fn require_document(orch: &Orchestrator, document_id: &str) -> Result<DocumentInfo> {
    orch.content()
        .document(document_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("document {document_id}")))
}

/// Submit `pipeline` over the current version of a document, at most once
/// per (document, version, pipeline, dry-run).
#[instrument(skip_all, fields(document_id = %req.document_id, pipeline = %req.pipeline))]
pub async fn submit_processing_job(orch: &Orchestrator, req: JobRequest) -> Result<Submission> {
    let mut parameters = req.parameters.unwrap_or_else(|| json!({}));
    orch.runnable_definition(&req.pipeline, &parameters).await?;
    let document = require_document(orch, &req.document_id).await?;

    let key = idempotency::key(&document.id, document.version, &req.pipeline, req.dry_run);
    if let Some(existing) = db::jobs::fetch_job_by_key(orch.pool(), &key).await? {
        info!(job_id = existing.id, "job already submitted");
        return Ok(Submission::AlreadySubmitted(existing));
    }

    if let Some(obj) = parameters.as_object_mut() {
        obj.insert("document_version".into(), json!(document.version));
        obj.insert("dry_run".into(), json!(req.dry_run));
    }
    let new_run = NewRun {
        workflow_key: req.pipeline.clone(),
        target: Target::Document(document.id.clone()),
        parameters,
        created_by: req.created_by,
        retry_of: None,
    };
    let new_job = NewJob {
        idempotency_key: key,
        document_id: document.id.clone(),
        document_version: document.version,
        pipeline: req.pipeline,
        dry_run: req.dry_run,
    };

    match db::jobs::insert_job_with_run(orch.pool(), &new_run, &new_job).await? {
        JobInsert::Duplicate(existing) => {
            info!(job_id = existing.id, "lost the race to an identical submission");
            Ok(Submission::AlreadySubmitted(existing))
        }
        JobInsert::Created(job) => {
            let run = orch.get_run(job.run_id).await?;
            orch.submit_run(&run).await?;
            let job = db::jobs::fetch_job(orch.pool(), job.id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job.id)))?;
            Ok(Submission::Created(job))
        }
    }
}

pub async fn get_job(orch: &Orchestrator, job_id: i64) -> Result<ProcessingJob> {
    db::jobs::fetch_job(orch.pool(), job_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))
}

/// Create a pending sync run for the document's current version and make it
/// the document's latest attempt.
pub(crate) async fn create_sync_run(
    orch: &Orchestrator,
    document_id: &str,
    created_by: Option<String>,
    retry_of: Option<i64>,
) -> Result<Run> {
    let document = require_document(orch, document_id).await?;
    let run = db::runs::insert_run(
        orch.pool(),
        &NewRun {
            workflow_key: SYNC_WORKFLOW_KEY.to_string(),
            target: Target::Document(document.id.clone()),
            parameters: json!({ "document_id": document.id, "version": document.version }),
            created_by,
            retry_of,
        },
    )
    .await?;
    let event_id = uuid::Uuid::new_v4().to_string();
    db::jobs::record_sync_attempt(
        orch.pool(),
        &SyncAttempt {
            document_id: &document.id,
            event_id: &event_id,
            run_id: run.id,
            version: Some(document.version),
            status: RunStatus::Pending,
            external_run_id: None,
            error: None,
        },
    )
    .await?;
    Ok(run)
}

#[instrument(skip_all, fields(document_id = %document_id))]
pub async fn sync_document(
    orch: &Orchestrator,
    document_id: &str,
    created_by: Option<String>,
) -> Result<Run> {
    let run = create_sync_run(orch, document_id, created_by, None).await?;
    orch.submit_run(&run).await
}

pub async fn sync_status(orch: &Orchestrator, document_id: &str) -> Result<DocSyncStatus> {
    db::jobs::fetch_sync_status(orch.pool(), document_id)
        .await?
        .ok_or_else(|| {
            OrchestratorError::NotFound(format!("sync status for document {document_id}"))
        })
}
