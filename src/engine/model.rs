use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One submission to the remote engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitSpec {
    pub deployment: String,
    pub parameters: Value,
    /// Local run id, echoed back by the engine as a correlation tag.
    pub run_id: i64,
    pub callback_url: Option<String>,
}

/// Run state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    #[serde(alias = "scheduled", alias = "queued")]
    Pending,
    Running,
    #[serde(alias = "completed", alias = "success")]
    Succeeded,
    #[serde(alias = "crashed", alias = "error")]
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl RemoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteState::Succeeded | RemoteState::Failed | RemoteState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub state: RemoteState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct CreateRunResponse {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct DeploymentSummary {
    pub name: String,
}

#[derive(Deserialize, Debug)]
pub struct ListDeploymentsResponse {
    pub deployments: Vec<DeploymentSummary>,
}
