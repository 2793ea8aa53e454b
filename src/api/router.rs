use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Batches
        .route("/batch/preview", post(handlers::preview_batch))
        .route("/batch/execute", post(handlers::execute_batch))
        .route("/batches", get(handlers::list_batches))
        .route("/batches/:batch_id", get(handlers::get_batch))
        .route("/batches/:batch_id/cancel", post(handlers::cancel_batch))
        // Single runs
        .route("/nodes/:id/workflows/:key/runs", post(handlers::trigger_node_run))
        .route(
            "/documents/:id/workflows/:key/runs",
            post(handlers::trigger_document_run),
        )
        .route("/runs", delete(handlers::cleanup_runs))
        .route("/runs/:run_id", get(handlers::get_run))
        .route("/runs/:run_id/cancel", post(handlers::cancel_run))
        .route("/runs/:run_id/force-terminate", post(handlers::force_terminate))
        .route("/runs/:run_id/refresh", post(handlers::refresh_run))
        .route("/runs/:run_id/lineage", get(handlers::run_lineage))
        .route("/callback/:run_id", post(handlers::engine_callback))
        // Documents
        .route("/documents/:id/sync", post(handlers::sync_document))
        .route("/documents/:id/sync-status", get(handlers::sync_status))
        .route("/documents/:id/jobs", post(handlers::submit_job))
        .route("/jobs/:job_id", get(handlers::get_job))
        // Workflow definitions
        .route("/workflows", get(handlers::list_workflows))
        .route("/workflows/reconcile", post(handlers::reconcile_workflows))
        .route("/workflows/:key", put(handlers::upsert_workflow))
        .route("/workflows/:key/enabled", post(handlers::set_workflow_enabled))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
