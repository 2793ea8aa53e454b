//! Error taxonomy surfaced by orchestrator operations.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Rejected before any record was created.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Idempotency key collision; the existing job answers the request.
    #[error("duplicate submission for key {key}: job {existing_job_id} already exists")]
    Duplicate { key: String, existing_job_id: i64 },

    #[error("invalid transition for run {run_id}: {reason}")]
    InvalidTransition { run_id: i64, reason: String },

    #[error("conflict: {0}")]
    Conflict(String),

    /// Submission to the remote engine failed; the run is recorded as failed.
    #[error("submission of run {run_id} failed: {message}")]
    Submission { run_id: i64, message: String },

    #[error("remote engine error: {0}")]
    Remote(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
