use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved run key for the fixed document synchronization operation.
pub const SYNC_WORKFLOW_KEY: &str = "document_sync";

/// What a run or batch item applies to. Exactly one kind per target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Node(String),
    Document(String),
}

impl Target {
    pub fn id(&self) -> &str {
        match self {
            Target::Node(id) | Target::Document(id) => id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Target::Node(_) => "node",
            Target::Document(_) => "document",
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Target::Node(id) => Some(id),
            Target::Document(_) => None,
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        match self {
            Target::Document(id) => Some(id),
            Target::Node(_) => None,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "node" => Some(Target::Node(id)),
            "document" => Some(Target::Document(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "running" => Some(BatchStatus::Running),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Workflow,
    Sync,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Workflow => "workflow",
            BatchKind::Sync => "sync",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(BatchKind::Workflow),
            "sync" => Some(BatchKind::Sync),
            _ => None,
        }
    }
}

/// Outcome recorded on one batch detail entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Planned and eligible, not yet submitted.
    Pending,
    /// A run exists and has not reached a terminal state.
    Submitted,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Pending => "pending",
            ItemOutcome::Submitted => "submitted",
            ItemOutcome::Success => "success",
            ItemOutcome::Failed => "failed",
            ItemOutcome::Cancelled => "cancelled",
            ItemOutcome::Skipped => "skipped",
        }
    }

    pub fn parse_outcome(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemOutcome::Pending),
            "submitted" => Some(ItemOutcome::Submitted),
            "success" => Some(ItemOutcome::Success),
            "failed" => Some(ItemOutcome::Failed),
            "cancelled" => Some(ItemOutcome::Cancelled),
            "skipped" => Some(ItemOutcome::Skipped),
            _ => None,
        }
    }

    /// Terminal run status to the outcome it resolves a submitted item to.
    pub fn from_run_status(status: RunStatus) -> Option<Self> {
        match status {
            RunStatus::Success => Some(ItemOutcome::Success),
            RunStatus::Failed => Some(ItemOutcome::Failed),
            RunStatus::Cancelled => Some(ItemOutcome::Cancelled),
            RunStatus::Pending | RunStatus::Running => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionSyncStatus {
    Active,
    Missing,
    Error,
}

impl DefinitionSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionSyncStatus::Active => "active",
            DefinitionSyncStatus::Missing => "missing",
            DefinitionSyncStatus::Error => "error",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "active" => Some(DefinitionSyncStatus::Active),
            "missing" => Some(DefinitionSyncStatus::Missing),
            "error" => Some(DefinitionSyncStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub workflow_key: String,
    pub name: String,
    pub description: Option<String>,
    pub deployment: String,
    pub parameter_schema: Value,
    pub enabled: bool,
    pub sync_status: DefinitionSyncStatus,
    pub synced_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    /// Names listed under `required` in the parameter schema.
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameter_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: i64,
    pub workflow_key: String,
    pub target: Target,
    pub parameters: Value,
    pub status: RunStatus,
    pub external_run_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Set when the run was terminated locally without remote confirmation.
    pub forced_termination: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_of: Option<i64>,
}

/// Insert payload for a fresh `pending` run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_key: String,
    pub target: Target,
    pub parameters: Value,
    pub created_by: Option<String>,
    pub retry_of: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingJob {
    pub id: i64,
    pub run_id: i64,
    pub idempotency_key: String,
    pub document_id: String,
    pub document_version: i64,
    pub pipeline: String,
    pub dry_run: bool,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocSyncStatus {
    pub document_id: String,
    pub last_event_id: String,
    pub last_attempt_version: Option<i64>,
    pub last_synced_version: Option<i64>,
    pub last_status: RunStatus,
    pub last_error: Option<String>,
    pub last_external_run_id: Option<String>,
    pub last_run_id: Option<i64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItem {
    pub seq: i64,
    pub target: Target,
    pub name: String,
    pub path: String,
    pub outcome: ItemOutcome,
    pub reason: Option<String>,
    pub run_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    #[serde(skip)]
    pub pk: i64,
    pub batch_id: String,
    pub kind: BatchKind,
    pub workflow_key: Option<String>,
    pub root_node_id: String,
    pub status: BatchStatus,
    pub total: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub concurrency: i64,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn processed(&self) -> i64 {
        self.success_count + self.failed_count + self.skipped_count
    }
}
