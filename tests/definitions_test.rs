mod common;

use serde_json::json;

use common::{orchestrator, seed_definition, setup_pool, MemoryContent, RecordingEngine};
use flowrun::definitions::{self, ReconcileReport};
use flowrun::model::{DefinitionSyncStatus, WorkflowDefinition};
use flowrun::OrchestratorError;

#[tokio::test]
async fn reconcile_marks_missing_deployments() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    seed_definition(&pool, "extract", &[]).await;
    let engine = RecordingEngine::new();
    engine.set_deployments(Some(vec!["summarize/prod", "other/prod"])).await;
    let orch = orchestrator(pool, &engine, &MemoryContent::new());

    let report = definitions::reconcile_definitions(&orch).await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            active: 1,
            missing: 1,
            errored: 0
        }
    );

    let summarize = definitions::get(&orch, "summarize").await.unwrap();
    assert_eq!(summarize.sync_status, DefinitionSyncStatus::Active);
    assert!(summarize.synced_at.is_some());
    let extract = definitions::get(&orch, "extract").await.unwrap();
    assert_eq!(extract.sync_status, DefinitionSyncStatus::Missing);
}

#[tokio::test]
async fn unreachable_engine_marks_every_definition_errored() {
    let pool = setup_pool().await;
    seed_definition(&pool, "summarize", &[]).await;
    let engine = RecordingEngine::new();
    let orch = orchestrator(pool, &engine, &MemoryContent::new());

    let report = definitions::reconcile_definitions(&orch).await.unwrap();
    assert_eq!(report.errored, 1);
    let def = definitions::get(&orch, "summarize").await.unwrap();
    assert_eq!(def.sync_status, DefinitionSyncStatus::Error);
}

#[tokio::test]
async fn admin_writes_validate_and_toggle() {
    let pool = setup_pool().await;
    let orch = orchestrator(pool, &RecordingEngine::new(), &MemoryContent::new());

    let mut def = WorkflowDefinition {
        workflow_key: "translate".into(),
        name: "Translate".into(),
        description: Some("Translate a node".into()),
        deployment: "translate/prod".into(),
        parameter_schema: json!({"required": ["target_language"]}),
        enabled: true,
        sync_status: DefinitionSyncStatus::Active,
        synced_at: None,
    };
    let stored = definitions::upsert(&orch, &def).await.unwrap();
    assert_eq!(stored.deployment, "translate/prod");

    let disabled = definitions::set_enabled(&orch, "translate", false).await.unwrap();
    assert!(!disabled.enabled);
    assert_eq!(definitions::list(&orch).await.unwrap().len(), 1);

    let err = definitions::set_enabled(&orch, "ghost", true).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    def.workflow_key = "document_sync".into();
    let err = definitions::upsert(&orch, &def).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    def.workflow_key = "broken".into();
    def.parameter_schema = json!(["not", "an", "object"]);
    let err = definitions::upsert(&orch, &def).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}
