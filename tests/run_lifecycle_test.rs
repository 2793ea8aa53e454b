mod common;

use chrono::Utc;
use serde_json::json;
use std::time::Duration;

use common::{count_rows, orchestrator, seed_definition, setup_pool, MemoryContent, RecordingEngine};
use flowrun::db;
use flowrun::engine::RemoteState;
use flowrun::lifecycle::{self, ObservedStatus, PollOptions, Transition};
use flowrun::model::{NewRun, RunStatus, Target};
use flowrun::orchestrator::TriggerRequest;
use flowrun::{Orchestrator, OrchestratorError};

async fn fixture() -> (Orchestrator, RecordingEngine, MemoryContent) {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &["language"]).await;
    let engine = RecordingEngine::new();
    let content = MemoryContent::new();
    content.add_node(None, "n1", true).await;
    let orch = orchestrator(pool, &engine, &content);
    (orch, engine, content)
}

fn trigger(key: &str, node: &str) -> TriggerRequest {
    TriggerRequest {
        workflow_key: key.into(),
        target: Target::Node(node.into()),
        parameters: Some(json!({"language": "en"})),
        retry_of_id: None,
        created_by: Some("alice".into()),
    }
}

fn observed(run_id: i64, state: RemoteState) -> ObservedStatus {
    ObservedStatus {
        run_id,
        state,
        result: None,
        error: None,
        external_run_id: None,
    }
}

#[tokio::test]
async fn trigger_submits_and_marks_running() {
    let (orch, engine, _) = fixture().await;

    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();

    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.external_run_id.as_deref(), Some(format!("ext-{}", run.id).as_str()));
    assert!(run.started_at.is_some());
    assert_eq!(run.created_by.as_deref(), Some("alice"));

    let subs = engine.submissions().await;
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].deployment, "summarize/prod");
    assert_eq!(subs[0].parameters, json!({"language": "en"}));
    assert_eq!(
        subs[0].callback_url.as_deref(),
        Some(format!("http://orchestrator.test/callback/{}", run.id).as_str())
    );
}

#[tokio::test]
async fn invalid_triggers_create_no_runs() {
    let (orch, engine, _) = fixture().await;
    seed_definition(orch.pool(), "disabled", &[]).await;
    db::set_definition_enabled(orch.pool(), "disabled", false)
        .await
        .unwrap();

    let mut missing_param = trigger("summarize", "n1");
    missing_param.parameters = Some(json!({}));
    let cases = vec![
        trigger("nope", "n1"),
        trigger("disabled", "n1"),
        trigger("summarize", "missing-node"),
        trigger("document_sync", "n1"),
        missing_param,
    ];
    for req in cases {
        let err = orch.trigger_run(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)), "{err:?}");
    }

    assert_eq!(count_rows(orch.pool(), "runs").await, 0);
    assert!(engine.submissions().await.is_empty());
}

#[tokio::test]
async fn rejected_submission_fails_the_run() {
    let (orch, engine, _) = fixture().await;
    engine.fail_submissions(true);

    let err = orch.trigger_run(trigger("summarize", "n1")).await.unwrap_err();
    let OrchestratorError::Submission { run_id, message } = err else {
        panic!("expected submission error, got {err:?}");
    };
    assert!(message.contains("unavailable"));

    let run = orch.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(message.as_str()));
    assert!(run.external_run_id.is_none());
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn success_report_is_applied_once() {
    let (orch, _, content) = fixture().await;
    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();

    let mut report = observed(run.id, RemoteState::Succeeded);
    report.result = Some(json!({"summary": "short"}));
    report.external_run_id = run.external_run_id.clone();
    let first = lifecycle::apply_observed(&orch, report.clone()).await.unwrap();
    assert_eq!(first, Transition::Applied(RunStatus::Success));
    let finished = orch.get_run(run.id).await.unwrap();
    assert_eq!(finished.result, Some(json!({"summary": "short"})));
    assert!(finished.finished_at.is_some());

    // A late failure report must not overwrite the recorded outcome.
    let second = lifecycle::apply_observed(&orch, observed(run.id, RemoteState::Failed))
        .await
        .unwrap();
    assert!(matches!(second, Transition::Ignored(_)));
    assert_eq!(orch.get_run(run.id).await.unwrap(), finished);

    let writes = content.writes().await;
    assert_eq!(writes, vec![(Target::Node("n1".into()), json!({"summary": "short"}))]);
}

#[tokio::test]
async fn failure_report_records_error() {
    let (orch, _, content) = fixture().await;
    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();

    let mut report = observed(run.id, RemoteState::Failed);
    report.error = Some("model timeout".into());
    lifecycle::apply_observed(&orch, report).await.unwrap();

    let run = orch.get_run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("model timeout"));
    assert!(!run.forced_termination);
    assert!(content.writes().await.is_empty());
}

#[tokio::test]
async fn in_progress_report_changes_nothing() {
    let (orch, _, _) = fixture().await;
    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();

    let res = lifecycle::apply_observed(&orch, observed(run.id, RemoteState::Running))
        .await
        .unwrap();
    assert!(matches!(res, Transition::Ignored(_)));
    assert_eq!(orch.get_run(run.id).await.unwrap(), run);
}

#[tokio::test]
async fn report_for_pending_run_conflicts() {
    let (orch, _, _) = fixture().await;
    let run = db::runs::insert_run(
        orch.pool(),
        &NewRun {
            workflow_key: "summarize".into(),
            target: Target::Node("n1".into()),
            parameters: json!({"language": "en"}),
            created_by: None,
            retry_of: None,
        },
    )
    .await
    .unwrap();

    let err = lifecycle::apply_observed(&orch, observed(run.id, RemoteState::Succeeded))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));
    assert_eq!(orch.get_run(run.id).await.unwrap().status, RunStatus::Pending);
}

#[tokio::test]
async fn report_with_foreign_external_id_is_rejected() {
    let (orch, _, _) = fixture().await;
    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();

    let mut report = observed(run.id, RemoteState::Succeeded);
    report.external_run_id = Some("ext-someone-else".into());
    let err = lifecycle::apply_observed(&orch, report).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert_eq!(orch.get_run(run.id).await.unwrap().status, RunStatus::Running);
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let (orch, _, _) = fixture().await;
    let err = lifecycle::apply_observed(&orch, observed(42, RemoteState::Succeeded))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn cancel_waits_for_engine_confirmation() {
    let (orch, engine, _) = fixture().await;
    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();

    engine.fail_cancels(true);
    let err = lifecycle::cancel_run(&orch, run.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Remote(_)));
    assert_eq!(orch.get_run(run.id).await.unwrap().status, RunStatus::Running);

    engine.fail_cancels(false);
    let cancelled = lifecycle::cancel_run(&orch, run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());
    assert_eq!(engine.cancels().await.len(), 2);

    let err = lifecycle::cancel_run(&orch, run.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
}

#[tokio::test]
async fn force_terminate_respects_threshold() {
    let (orch, engine, _) = fixture().await;
    let fresh = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();

    let err = lifecycle::force_terminate(&orch, fresh.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

    let stale = db::runs::insert_run(
        orch.pool(),
        &NewRun {
            workflow_key: "summarize".into(),
            target: Target::Node("n1".into()),
            parameters: json!({"language": "en"}),
            created_by: None,
            retry_of: None,
        },
    )
    .await
    .unwrap();
    let long_ago = Utc::now() - chrono::Duration::hours(2);
    db::runs::mark_running(orch.pool(), stale.id, "ext-stale", long_ago)
        .await
        .unwrap();

    engine.fail_cancels(true);
    let terminated = lifecycle::force_terminate(&orch, stale.id).await.unwrap();
    assert_eq!(terminated.status, RunStatus::Failed);
    assert!(terminated.forced_termination);
    assert!(terminated
        .error
        .as_deref()
        .unwrap()
        .starts_with("forced termination"));
    assert_eq!(engine.cancels().await, vec!["ext-stale".to_string()]);

    // A late success report does not resurrect a force-terminated run.
    let res = lifecycle::apply_observed(&orch, observed(stale.id, RemoteState::Succeeded))
        .await
        .unwrap();
    assert!(matches!(res, Transition::Ignored(_)));
    assert_eq!(orch.get_run(stale.id).await.unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn refresh_applies_polled_status() {
    let (orch, engine, _) = fixture().await;
    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();
    let ext = run.external_run_id.clone().unwrap();

    engine.set_status(&ext, RemoteState::Running, None).await;
    let res = lifecycle::refresh_run(&orch, run.id).await.unwrap();
    assert!(matches!(res, Transition::Ignored(_)));

    engine
        .set_status(&ext, RemoteState::Succeeded, Some(json!({"ok": true})))
        .await;
    let res = lifecycle::refresh_run(&orch, run.id).await.unwrap();
    assert_eq!(res, Transition::Applied(RunStatus::Success));
    assert_eq!(orch.get_run(run.id).await.unwrap().result, Some(json!({"ok": true})));
}

#[tokio::test]
async fn wait_for_terminal_polls_until_done() {
    let (orch, engine, _) = fixture().await;
    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();
    let ext = run.external_run_id.clone().unwrap();
    engine.set_status(&ext, RemoteState::Cancelled, None).await;

    let opts = PollOptions {
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
    };
    let done = lifecycle::wait_for_terminal(&orch, run.id, opts).await.unwrap();
    assert_eq!(done.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn wait_for_terminal_returns_last_state_on_timeout() {
    let (orch, engine, _) = fixture().await;
    let run = orch.trigger_run(trigger("summarize", "n1")).await.unwrap();
    let ext = run.external_run_id.clone().unwrap();
    engine.set_status(&ext, RemoteState::Running, None).await;

    let opts = PollOptions {
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(40),
    };
    let last = lifecycle::wait_for_terminal(&orch, run.id, opts).await.unwrap();
    assert_eq!(last.status, RunStatus::Running);
}
