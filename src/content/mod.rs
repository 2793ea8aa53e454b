//! Lookups against the content tree service and result write-back.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::model::Target;

pub mod model;

pub use model::{DocumentInfo, NodeInfo};
use model::{DocumentList, NodeList};

/// Read access to the hierarchical content tree plus result write-back.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn node(&self, id: &str) -> Result<Option<NodeInfo>>;

    /// Direct children of `id`, in the store's display order.
    async fn children(&self, id: &str) -> Result<Vec<NodeInfo>>;

    /// Documents attached to `node_id`, in the store's display order.
    async fn documents(&self, node_id: &str) -> Result<Vec<DocumentInfo>>;

    async fn document(&self, id: &str) -> Result<Option<DocumentInfo>>;

    async fn write_result(&self, target: &Target, payload: &Value) -> Result<()>;
}

#[derive(Clone)]
pub struct ContentClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for ContentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ContentClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.content.base_url).context("invalid content.base_url")?;
        let http = Client::builder()
            .user_agent(concat!("flowrun/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.engine.timeout_ms))
            .build()
            .context("failed to build content HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token: cfg.content.token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("invalid content base URL")
    }

    /// GET returning `None` on 404.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.endpoint(path)?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("failed to reach content store")?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("content store error {} on {}: {}", status, path, text));
        }
        let body = res
            .json::<T>()
            .await
            .with_context(|| format!("invalid content store JSON from {path}"))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl ContentStore for ContentClient {
    async fn node(&self, id: &str) -> Result<Option<NodeInfo>> {
        self.get_optional(&format!("api/nodes/{id}")).await
    }

    async fn children(&self, id: &str) -> Result<Vec<NodeInfo>> {
        let list: Option<NodeList> = self.get_optional(&format!("api/nodes/{id}/children")).await?;
        list.map(|l| l.nodes)
            .ok_or_else(|| anyhow!("node {id} not found in content store"))
    }

    async fn documents(&self, node_id: &str) -> Result<Vec<DocumentInfo>> {
        let list: Option<DocumentList> = self
            .get_optional(&format!("api/nodes/{node_id}/documents"))
            .await?;
        list.map(|l| l.documents)
            .ok_or_else(|| anyhow!("node {node_id} not found in content store"))
    }

    async fn document(&self, id: &str) -> Result<Option<DocumentInfo>> {
        self.get_optional(&format!("api/documents/{id}")).await
    }

    #[instrument(skip_all, fields(target = target.id()))]
    async fn write_result(&self, target: &Target, payload: &Value) -> Result<()> {
        let path = match target {
            Target::Node(id) => format!("api/nodes/{id}/output"),
            Target::Document(id) => format!("api/documents/{id}/output"),
        };
        let url = self.endpoint(&path)?;
        let res = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&json!({ "output": payload }))
            .send()
            .await
            .context("failed to reach content store")?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("content store rejected write-back {}: {}", status, text));
        }
        debug!("result written back");
        Ok(())
    }
}
