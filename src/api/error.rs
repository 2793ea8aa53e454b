//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::error::OrchestratorError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Orchestrator(OrchestratorError::Internal(err))
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use OrchestratorError as E;
        let (status, code, details) = match &self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", None),
            ApiError::Orchestrator(err) => match err {
                E::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", None),
                E::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
                E::Duplicate {
                    key,
                    existing_job_id,
                } => (
                    StatusCode::CONFLICT,
                    "DUPLICATE",
                    Some(json!({ "key": key, "existing_job_id": existing_job_id })),
                ),
                E::InvalidTransition { run_id, .. } => (
                    StatusCode::CONFLICT,
                    "INVALID_TRANSITION",
                    Some(json!({ "run_id": run_id })),
                ),
                E::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT", None),
                E::Submission { run_id, .. } => (
                    StatusCode::BAD_GATEWAY,
                    "SUBMISSION_FAILED",
                    Some(json!({ "run_id": run_id })),
                ),
                E::Remote(_) => (StatusCode::BAD_GATEWAY, "REMOTE_ERROR", None),
                E::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None),
            },
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = ?self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
