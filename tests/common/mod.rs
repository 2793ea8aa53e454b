#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

use flowrun::content::{ContentStore, DocumentInfo, NodeInfo};
use flowrun::db::{self, Pool};
use flowrun::engine::{RemoteEngine, RemoteState, RemoteStatus, SubmitSpec};
use flowrun::model::{DefinitionSyncStatus, Target, WorkflowDefinition};
use flowrun::{Orchestrator, Settings};

pub const SECRET: &str = "test-callback-secret-0123456789";

pub async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn settings() -> Settings {
    Settings {
        callback_base_url: "http://orchestrator.test".into(),
        sync_deployment: "document-sync/test".into(),
        default_concurrency: 3,
        max_concurrency: 10,
        zombie_threshold: Duration::from_secs(3600),
        write_back_results: true,
    }
}

pub fn orchestrator(pool: Pool, engine: &RecordingEngine, content: &MemoryContent) -> Orchestrator {
    Orchestrator::new(
        pool,
        Arc::new(engine.clone()),
        Arc::new(content.clone()),
        settings(),
    )
}

pub async fn seed_definition(pool: &Pool, key: &str, required: &[&str]) -> WorkflowDefinition {
    let def = WorkflowDefinition {
        workflow_key: key.into(),
        name: key.to_uppercase(),
        description: None,
        deployment: format!("{key}/prod"),
        parameter_schema: json!({ "required": required }),
        enabled: true,
        sync_status: DefinitionSyncStatus::Active,
        synced_at: None,
    };
    db::upsert_definition(pool, &def).await.unwrap();
    def
}

pub async fn count_rows(pool: &Pool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Poll `cond` until it holds, failing the test after about a second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition never became true");
}

/// Remote engine fake. Accepts everything unless told otherwise and records
/// every call. External ids are `ext-{run_id}`.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    submissions: Arc<Mutex<Vec<SubmitSpec>>>,
    cancels: Arc<Mutex<Vec<String>>>,
    statuses: Arc<Mutex<HashMap<String, RemoteStatus>>>,
    failing_runs: Arc<Mutex<Vec<i64>>>,
    deployments: Arc<Mutex<Option<Vec<String>>>>,
    fail_all_submits: Arc<AtomicBool>,
    fail_cancel: Arc<AtomicBool>,
    gate: Option<Arc<Semaphore>>,
    submit_delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each submission sleeps for `delay` while counted as in flight.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            submit_delay: Some(delay),
            ..Default::default()
        }
    }

    /// Submissions block until permits are added through [`Self::release`].
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.fail_all_submits.store(fail, Ordering::SeqCst);
    }

    pub async fn fail_run(&self, run_id: i64) {
        self.failing_runs.lock().await.push(run_id);
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    pub async fn set_status(&self, external_run_id: &str, state: RemoteState, result: Option<Value>) {
        self.statuses.lock().await.insert(
            external_run_id.to_string(),
            RemoteStatus {
                state,
                result,
                error: None,
            },
        );
    }

    pub async fn set_deployments(&self, deployments: Option<Vec<&str>>) {
        *self.deployments.lock().await =
            deployments.map(|d| d.into_iter().map(str::to_string).collect());
    }

    pub async fn submissions(&self) -> Vec<SubmitSpec> {
        self.submissions.lock().await.clone()
    }

    pub async fn cancels(&self) -> Vec<String> {
        self.cancels.lock().await.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteEngine for RecordingEngine {
    async fn submit(&self, spec: &SubmitSpec) -> Result<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        self.submissions.lock().await.push(spec.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_all_submits.load(Ordering::SeqCst)
            || self.failing_runs.lock().await.contains(&spec.run_id)
        {
            return Err(anyhow!("deployment {} unavailable", spec.deployment));
        }
        Ok(format!("ext-{}", spec.run_id))
    }

    async fn cancel(&self, external_run_id: &str) -> Result<()> {
        self.cancels.lock().await.push(external_run_id.to_string());
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(anyhow!("engine refused cancel"));
        }
        Ok(())
    }

    async fn status(&self, external_run_id: &str) -> Result<RemoteStatus> {
        self.statuses
            .lock()
            .await
            .get(external_run_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown run {external_run_id}"))
    }

    async fn list_deployments(&self) -> Result<Vec<String>> {
        self.deployments
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("engine unreachable"))
    }
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<String, NodeInfo>,
    children: HashMap<String, Vec<String>>,
    documents: HashMap<String, DocumentInfo>,
    node_documents: HashMap<String, Vec<String>>,
}

/// In-memory content tree. Children and documents keep insertion order.
#[derive(Clone, Default)]
pub struct MemoryContent {
    tree: Arc<Mutex<Tree>>,
    writes: Arc<Mutex<Vec<(Target, Value)>>>,
}

impl MemoryContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_node(&self, parent: Option<&str>, id: &str, has_source: bool) {
        let mut tree = self.tree.lock().await;
        let path = match parent.and_then(|p| tree.nodes.get(p)) {
            Some(p) => format!("{}/{id}", p.path),
            None => format!("/{id}"),
        };
        tree.nodes.insert(
            id.to_string(),
            NodeInfo {
                id: id.to_string(),
                parent_id: parent.map(str::to_string),
                name: id.to_string(),
                path,
                doc_type: None,
                has_source,
                has_output: false,
            },
        );
        tree.children.entry(id.to_string()).or_default();
        if let Some(parent) = parent {
            tree.children
                .entry(parent.to_string())
                .or_default()
                .push(id.to_string());
        }
    }

    pub async fn add_document(&self, node_id: &str, id: &str, version: i64) {
        let mut tree = self.tree.lock().await;
        let path = tree
            .nodes
            .get(node_id)
            .map(|n| format!("{}/{id}", n.path))
            .unwrap_or_else(|| format!("/{id}"));
        tree.documents.insert(
            id.to_string(),
            DocumentInfo {
                id: id.to_string(),
                node_id: node_id.to_string(),
                name: id.to_string(),
                path,
                doc_type: Some("article".into()),
                version,
                has_content: true,
                has_output: false,
            },
        );
        tree.node_documents
            .entry(node_id.to_string())
            .or_default()
            .push(id.to_string());
    }

    pub async fn set_document_version(&self, id: &str, version: i64) {
        if let Some(doc) = self.tree.lock().await.documents.get_mut(id) {
            doc.version = version;
        }
    }

    pub async fn writes(&self) -> Vec<(Target, Value)> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl ContentStore for MemoryContent {
    async fn node(&self, id: &str) -> Result<Option<NodeInfo>> {
        Ok(self.tree.lock().await.nodes.get(id).cloned())
    }

    async fn children(&self, id: &str) -> Result<Vec<NodeInfo>> {
        let tree = self.tree.lock().await;
        let ids = tree
            .children
            .get(id)
            .ok_or_else(|| anyhow!("node {id} not found"))?;
        Ok(ids.iter().filter_map(|c| tree.nodes.get(c).cloned()).collect())
    }

    async fn documents(&self, node_id: &str) -> Result<Vec<DocumentInfo>> {
        let tree = self.tree.lock().await;
        Ok(tree
            .node_documents
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|d| tree.documents.get(d).cloned()).collect())
            .unwrap_or_default())
    }

    async fn document(&self, id: &str) -> Result<Option<DocumentInfo>> {
        Ok(self.tree.lock().await.documents.get(id).cloned())
    }

    async fn write_result(&self, target: &Target, payload: &Value) -> Result<()> {
        self.writes
            .lock()
            .await
            .push((target.clone(), payload.clone()));
        Ok(())
    }
}
