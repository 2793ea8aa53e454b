//! Client side of the remote workflow execution engine.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;

pub mod model;

pub use model::{RemoteState, RemoteStatus, SubmitSpec};
use model::{CreateRunResponse, ListDeploymentsResponse};

/// The remote workflow execution engine, treated as an opaque capability.
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    /// Submit a run; returns the engine's run reference.
    async fn submit(&self, spec: &SubmitSpec) -> Result<String>;

    async fn cancel(&self, external_run_id: &str) -> Result<()>;

    async fn status(&self, external_run_id: &str) -> Result<RemoteStatus>;

    /// Names of the deployments the engine currently knows.
    async fn list_deployments(&self) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct EngineClient {
    http: Client,
    base_url: Url,
    token: String,
    submit_max_attempts: u32,
    retry_base_delay: Duration,
}

impl fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineClient")
            .field("base_url", &self.base_url)
            .field("submit_max_attempts", &self.submit_max_attempts)
            .finish_non_exhaustive()
    }
}

/// Failure of one HTTP exchange. `retryable` is set only when the engine
/// cannot have accepted the run.
struct AttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl EngineClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.engine.base_url).context("invalid engine.base_url")?;
        let http = Client::builder()
            .user_agent(concat!("flowrun/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.engine.timeout_ms))
            .build()
            .context("failed to build engine HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token: cfg.engine.token.clone(),
            submit_max_attempts: cfg.engine.submit_max_attempts.max(1),
            retry_base_delay: Duration::from_millis(500),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("invalid engine base URL")
    }

    async fn submit_once(&self, spec: &SubmitSpec) -> Result<String, AttemptError> {
        let fatal = |error: anyhow::Error| AttemptError {
            retryable: false,
            error,
        };
        let url = self
            .endpoint(&format!("api/deployments/{}/runs", spec.deployment))
            .map_err(fatal)?;
        let body = json!({
            "parameters": spec.parameters,
            "tags": { "flowrun_run_id": spec.run_id },
            "callback_url": spec.callback_url,
        });

        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|err| AttemptError {
                retryable: err.is_connect(),
                error: anyhow::Error::new(err).context("failed to reach engine"),
            })?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(AttemptError {
                retryable: refused_before_accept(status),
                error: anyhow!("engine rejected submission {}: {}", status, text),
            });
        }
        let payload: CreateRunResponse = res
            .json()
            .await
            .context("invalid engine response JSON")
            .map_err(fatal)?;
        Ok(payload.id)
    }
}

/// Statuses the engine answers without creating a run. A timeout or any other
/// 5xx may follow an accepted submission and is never retried.
fn refused_before_accept(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

#[async_trait]
impl RemoteEngine for EngineClient {
    /// Bounded retry with exponential backoff on connect errors, 429 and 503.
    /// Anything else fails on the first attempt.
    async fn submit(&self, spec: &SubmitSpec) -> Result<String> {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match self.submit_once(spec).await {
                Ok(external_id) => {
                    info!(run_id = spec.run_id, external_id, attempt, "engine accepted run");
                    return Ok(external_id);
                }
                Err(AttemptError { retryable, error })
                    if retryable && attempt < self.submit_max_attempts =>
                {
                    let delay = self.retry_base_delay * (1_u32 << (attempt - 1).min(6));
                    warn!(?error, run_id = spec.run_id, attempt, ?delay, "engine submission failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError { error, .. }) => return Err(error),
            }
        }
    }

    async fn cancel(&self, external_run_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("api/runs/{external_run_id}/cancel"))?;
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to reach engine")?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("engine refused cancel {}: {}", status, text));
        }
        Ok(())
    }

    async fn status(&self, external_run_id: &str) -> Result<RemoteStatus> {
        let url = self.endpoint(&format!("api/runs/{external_run_id}"))?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to reach engine")?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("engine status error {}: {}", status, text));
        }
        res.json::<RemoteStatus>()
            .await
            .context("invalid engine status JSON")
    }

    async fn list_deployments(&self) -> Result<Vec<String>> {
        let url = self.endpoint("api/deployments")?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to reach engine")?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("engine deployment list error {}: {}", status, text));
        }
        let payload: ListDeploymentsResponse = res
            .json()
            .await
            .context("invalid engine deployment list JSON")?;
        Ok(payload.deployments.into_iter().map(|d| d.name).collect())
    }
}
