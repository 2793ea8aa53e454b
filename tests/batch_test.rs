mod common;

use serde_json::json;
use std::time::Duration;

use common::{
    count_rows, orchestrator, seed_definition, setup_pool, wait_until, MemoryContent, RecordingEngine,
};
use flowrun::batch::{self, BatchRequest};
use flowrun::engine::RemoteState;
use flowrun::lifecycle::{self, ObservedStatus};
use flowrun::model::{BatchStatus, ItemOutcome, RunStatus, Target};
use flowrun::planner::{PlanFilters, SkipReason};
use flowrun::{pipeline, Orchestrator, OrchestratorError};

/// root
/// ├── c1 (source)
/// │   └── g1 (source)
/// ├── c2
/// └── c3
///     └── g2 (source)
async fn mixed_tree(content: &MemoryContent) {
    content.add_node(None, "root", true).await;
    content.add_node(Some("root"), "c1", true).await;
    content.add_node(Some("c1"), "g1", true).await;
    content.add_node(Some("root"), "c2", false).await;
    content.add_node(Some("root"), "c3", false).await;
    content.add_node(Some("c3"), "g2", true).await;
}

async fn flat_tree(content: &MemoryContent, children: usize) {
    content.add_node(None, "root", true).await;
    for i in 0..children {
        content.add_node(Some("root"), &format!("leaf-{i:02}"), true).await;
    }
}

fn request(workflow_key: Option<&str>, concurrency: usize) -> BatchRequest {
    BatchRequest {
        root_node_id: "root".into(),
        workflow_key: workflow_key.map(str::to_string),
        include_descendants: true,
        parameters: Some(json!({"language": "en"})),
        concurrency: Some(concurrency),
        created_by: Some("ops".into()),
        ..Default::default()
    }
}

async fn succeed_all(orch: &Orchestrator, run_ids: &[i64]) {
    for &run_id in run_ids {
        lifecycle::apply_observed(
            orch,
            ObservedStatus {
                run_id,
                state: RemoteState::Succeeded,
                result: None,
                error: None,
                external_run_id: None,
            },
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn preview_reports_skips_without_side_effects() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let engine = RecordingEngine::new();
    let content = MemoryContent::new();
    mixed_tree(&content).await;
    let orch = orchestrator(pool, &engine, &content);

    let mut req = request(Some("summarize"), 2);
    req.filters = PlanFilters {
        skip_no_source: true,
        ..Default::default()
    };
    let report = batch::preview(&orch, &req).await.unwrap();

    assert_eq!(report.root_id, "root");
    assert_eq!(report.total_nodes, 5);
    assert_eq!(report.can_execute, 3);
    assert_eq!(report.will_skip, 2);
    let order: Vec<&str> = report.items.iter().map(|i| i.target.id()).collect();
    assert_eq!(order, vec!["c1", "g1", "c2", "c3", "g2"]);
    for item in report.items.iter().filter(|i| !i.can_execute) {
        assert_eq!(item.skip_reason, Some(SkipReason::NoSource));
    }
    assert_eq!(report.items[1].path, "/root/c1/g1");

    assert_eq!(batch::preview(&orch, &req).await.unwrap(), report);
    assert_eq!(count_rows(orch.pool(), "batches").await, 0);
    assert_eq!(count_rows(orch.pool(), "runs").await, 0);
    assert!(engine.submissions().await.is_empty());
}

#[tokio::test]
async fn preview_without_descendants_covers_root_only() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let content = MemoryContent::new();
    mixed_tree(&content).await;
    let orch = orchestrator(pool, &RecordingEngine::new(), &content);

    let mut req = request(Some("summarize"), 1);
    req.include_descendants = false;
    let report = batch::preview(&orch, &req).await.unwrap();
    assert_eq!(report.total_nodes, 1);
    assert_eq!(report.items[0].target, Target::Node("root".into()));
}

#[tokio::test]
async fn preview_rejects_unknown_workflow() {
    let pool = setup_pool().await;
    let content = MemoryContent::new();
    mixed_tree(&content).await;
    let orch = orchestrator(pool, &RecordingEngine::new(), &content);

    let err = batch::preview(&orch, &request(Some("nope"), 1)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

#[tokio::test]
async fn execute_bounds_in_flight_submissions() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &["language"]).await;
    let engine = RecordingEngine::with_delay(Duration::from_millis(20));
    let content = MemoryContent::new();
    flat_tree(&content, 10).await;
    let orch = orchestrator(pool, &engine, &content);

    let launched = batch::execute(&orch, request(Some("summarize"), 2)).await.unwrap();
    assert_eq!(launched.handle.status, BatchStatus::Pending);
    assert_eq!(launched.handle.total, 10);
    launched.submissions.unwrap().await.unwrap();

    assert_eq!(engine.submissions().await.len(), 10);
    assert!(engine.max_in_flight() <= 2, "max in flight {}", engine.max_in_flight());

    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Running);
    assert!(batch.items.iter().all(|i| i.outcome == ItemOutcome::Submitted));

    let run_ids: Vec<i64> = batch.items.iter().filter_map(|i| i.run_id).collect();
    assert_eq!(run_ids.len(), 10);
    succeed_all(&orch, &run_ids).await;

    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.success_count, 10);
    assert_eq!(batch.processed(), batch.total);
    assert!(batch.finished_at.is_some());
}

#[tokio::test]
async fn failed_submissions_count_without_stopping_the_batch() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let engine = RecordingEngine::new();
    let content = MemoryContent::new();
    mixed_tree(&content).await;
    let orch = orchestrator(pool, &engine, &content);
    // Runs are numbered from 1 in planning order over eligible items.
    engine.fail_run(2).await;

    let mut req = request(Some("summarize"), 1);
    req.filters.skip_no_source = true;
    let launched = batch::execute(&orch, req).await.unwrap();
    launched.submissions.unwrap().await.unwrap();

    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.total, 5);
    assert_eq!(batch.skipped_count, 2);
    assert_eq!(batch.failed_count, 1);
    assert_eq!(batch.status, BatchStatus::Running);

    let running: Vec<i64> = batch
        .items
        .iter()
        .filter(|i| i.outcome == ItemOutcome::Submitted)
        .filter_map(|i| i.run_id)
        .collect();
    assert_eq!(running.len(), 2);
    succeed_all(&orch, &running).await;

    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!((batch.success_count, batch.failed_count, batch.skipped_count), (2, 1, 2));
    let skipped: Vec<_> = batch
        .items
        .iter()
        .filter(|i| i.outcome == ItemOutcome::Skipped)
        .map(|i| i.reason.as_deref())
        .collect();
    assert_eq!(skipped, vec![Some("no_source"), Some("no_source")]);
}

#[tokio::test]
async fn batch_with_nothing_eligible_completes_immediately() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let content = MemoryContent::new();
    mixed_tree(&content).await;
    let orch = orchestrator(pool, &RecordingEngine::new(), &content);

    let mut req = request(Some("summarize"), 3);
    req.filters.name_filter = Some("zzz".into());
    let launched = batch::execute(&orch, req).await.unwrap();
    launched.submissions.unwrap().await.unwrap();

    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.skipped_count, 5);
}

#[tokio::test]
async fn planning_failure_leaves_failed_batch() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let content = MemoryContent::new();
    let orch = orchestrator(pool, &RecordingEngine::new(), &content);

    let launched = batch::execute(&orch, request(Some("summarize"), 1)).await.unwrap();
    assert_eq!(launched.handle.status, BatchStatus::Failed);
    assert!(launched.submissions.is_none());

    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch.error.as_deref().unwrap().contains("root"));
    assert_eq!(count_rows(orch.pool(), "runs").await, 0);
}

#[tokio::test]
async fn execute_validates_before_creating_anything() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &["language"]).await;
    let content = MemoryContent::new();
    flat_tree(&content, 2).await;
    let orch = orchestrator(pool, &RecordingEngine::new(), &content);

    let err = batch::execute(&orch, request(Some("summarize"), 0)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
    let err = batch::execute(&orch, request(Some("summarize"), 11)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let mut req = request(Some("summarize"), 1);
    req.parameters = None;
    let err = batch::execute(&orch, req).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    assert_eq!(count_rows(orch.pool(), "batches").await, 0);
}

#[tokio::test]
async fn cancel_stops_new_submissions() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let engine = RecordingEngine::gated();
    let content = MemoryContent::new();
    flat_tree(&content, 3).await;
    let orch = orchestrator(pool, &engine, &content);

    let launched = batch::execute(&orch, request(Some("summarize"), 1)).await.unwrap();
    let batch_id = launched.handle.batch_id.clone();
    wait_until(|| engine.in_flight() == 1).await;

    let flagged = batch::cancel_batch(&orch, &batch_id).await.unwrap();
    assert!(flagged.cancel_requested);
    engine.release(10);
    launched.submissions.unwrap().await.unwrap();

    assert_eq!(engine.submissions().await.len(), 1);
    let batch = batch::get_batch(&orch, &batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Running);
    assert_eq!(batch.skipped_count, 2);
    assert!(batch
        .items
        .iter()
        .filter(|i| i.outcome == ItemOutcome::Skipped)
        .all(|i| i.reason.as_deref() == Some("batch_cancelled")));

    let in_flight = batch.items[0].run_id.unwrap();
    succeed_all(&orch, &[in_flight]).await;
    let batch = batch::get_batch(&orch, &batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.success_count, 1);

    let err = batch::cancel_batch(&orch, &batch_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));
}

#[tokio::test]
async fn run_outcomes_resolve_batch_items() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let engine = RecordingEngine::new();
    let content = MemoryContent::new();
    flat_tree(&content, 2).await;
    let orch = orchestrator(pool, &engine, &content);

    let launched = batch::execute(&orch, request(Some("summarize"), 2)).await.unwrap();
    launched.submissions.unwrap().await.unwrap();
    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    let first = batch.items[0].run_id.unwrap();
    let second = batch.items[1].run_id.unwrap();

    lifecycle::cancel_run(&orch, first).await.unwrap();
    lifecycle::apply_observed(
        &orch,
        ObservedStatus {
            run_id: second,
            state: RemoteState::Failed,
            result: None,
            error: Some("boom".into()),
            external_run_id: None,
        },
    )
    .await
    .unwrap();

    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.items[0].outcome, ItemOutcome::Cancelled);
    assert_eq!(batch.items[1].outcome, ItemOutcome::Failed);
    assert_eq!(batch.failed_count, 2);
    assert_eq!(batch.status, BatchStatus::Completed);
}

#[tokio::test]
async fn sync_batch_skips_documents_already_synced() {
    let pool = setup_pool().await;
    let engine = RecordingEngine::new();
    let content = MemoryContent::new();
    content.add_node(None, "root", true).await;
    content.add_node(Some("root"), "chapter", true).await;
    content.add_document("chapter", "doc-a", 3).await;
    content.add_document("chapter", "doc-b", 1).await;
    let orch = orchestrator(pool, &engine, &content);

    let synced = pipeline::sync_document(&orch, "doc-a", None).await.unwrap();
    succeed_all(&orch, &[synced.id]).await;
    assert_eq!(
        pipeline::sync_status(&orch, "doc-a").await.unwrap().last_synced_version,
        Some(3)
    );

    let mut req = request(None, 2);
    req.filters.skip_up_to_date = true;
    let report = batch::preview(&orch, &req).await.unwrap();
    assert_eq!(report.total_nodes, 2);
    assert_eq!(report.items[0].skip_reason, Some(SkipReason::UpToDate));
    assert!(report.items[1].can_execute);

    let launched = batch::execute(&orch, req).await.unwrap();
    launched.submissions.unwrap().await.unwrap();
    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.workflow_key, None);
    let run_id = batch.items[1].run_id.unwrap();
    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.target, Target::Document("doc-b".into()));
    assert_eq!(run.status, RunStatus::Running);

    succeed_all(&orch, &[run_id]).await;
    let batch = batch::get_batch(&orch, &launched.handle.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(
        pipeline::sync_status(&orch, "doc-b").await.unwrap().last_synced_version,
        Some(1)
    );
}

#[tokio::test]
async fn list_batches_pages_newest_first() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let content = MemoryContent::new();
    flat_tree(&content, 1).await;
    let orch = orchestrator(pool, &RecordingEngine::new(), &content);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let launched = batch::execute(&orch, request(Some("summarize"), 1)).await.unwrap();
        launched.submissions.unwrap().await.unwrap();
        ids.push(launched.handle.batch_id);
    }

    let page = batch::list_batches(&orch, 2, 0).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].batch_id, ids[2]);

    let page = batch::list_batches(&orch, 500, 0).await.unwrap();
    assert_eq!(page.limit, 100);

    let err = batch::get_batch(&orch, "missing").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}
