//! Configuration loader and validator for the orchestrator service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub engine: Engine,
    pub content: Content,
    #[serde(default)]
    pub orchestrator: Orchestrator,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub listen_addr: String,
}

/// Remote workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Engine {
    pub base_url: String,
    pub token: String,
    /// Public base URL the engine calls back into (`{callback_base_url}/callback/{run_id}`).
    pub callback_base_url: String,
    pub callback_secret: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_submit_max_attempts")]
    pub submit_max_attempts: u32,
    pub sync_deployment: String,
}

/// Upstream content store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Content {
    pub base_url: String,
    pub token: String,
}

/// Orchestrator tuning. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Orchestrator {
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_zombie_threshold_seconds")]
    pub zombie_threshold_seconds: u64,
    #[serde(default = "default_reap_interval_seconds")]
    pub reap_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub write_back_results: bool,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            max_concurrency: default_max_concurrency(),
            zombie_threshold_seconds: default_zombie_threshold_seconds(),
            reap_interval_seconds: default_reap_interval_seconds(),
            write_back_results: true,
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_submit_max_attempts() -> u32 {
    3
}

fn default_concurrency() -> usize {
    3
}

fn default_max_concurrency() -> usize {
    10
}

fn default_zombie_threshold_seconds() -> u64 {
    3600
}

fn default_reap_interval_seconds() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `app.data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        let dir = self.app.data_dir.trim();
        match (dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => dir.to_string(),
        }
    }

    /// `DATABASE_URL` if set, otherwise a SQLite file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/flowrun.db", self.resolved_data_dir()))
    }

    pub fn zombie_threshold(&self) -> Duration {
        Duration::from_secs(self.orchestrator.zombie_threshold_seconds)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.reap_interval_seconds)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.listen_addr must be a socket address"));
    }

    if cfg.engine.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("engine.base_url must be non-empty"));
    }
    if cfg.engine.callback_base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("engine.callback_base_url must be non-empty"));
    }
    if cfg.engine.callback_secret.trim().len() < 16 {
        return Err(ConfigError::Invalid(
            "engine.callback_secret must be at least 16 characters",
        ));
    }
    if cfg.engine.submit_max_attempts == 0 {
        return Err(ConfigError::Invalid("engine.submit_max_attempts must be > 0"));
    }
    if cfg.engine.timeout_ms == 0 {
        return Err(ConfigError::Invalid("engine.timeout_ms must be > 0"));
    }
    if cfg.engine.sync_deployment.trim().is_empty() {
        return Err(ConfigError::Invalid("engine.sync_deployment must be non-empty"));
    }

    if cfg.content.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("content.base_url must be non-empty"));
    }

    let orch = &cfg.orchestrator;
    if orch.max_concurrency == 0 {
        return Err(ConfigError::Invalid("orchestrator.max_concurrency must be > 0"));
    }
    if orch.default_concurrency == 0 || orch.default_concurrency > orch.max_concurrency {
        return Err(ConfigError::Invalid(
            "orchestrator.default_concurrency must be within 1..=max_concurrency",
        ));
    }
    if orch.zombie_threshold_seconds == 0 {
        return Err(ConfigError::Invalid(
            "orchestrator.zombie_threshold_seconds must be > 0",
        ));
    }
    if orch.reap_interval_seconds == 0 {
        return Err(ConfigError::Invalid("orchestrator.reap_interval_seconds must be > 0"));
    }

    Ok(())
}

/// Returns a complete example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  listen_addr: "127.0.0.1:8080"

engine:
  base_url: "http://127.0.0.1:4200/"
  token: "ENGINE_API_TOKEN"
  callback_base_url: "http://127.0.0.1:8080"
  callback_secret: "change-me-to-a-long-shared-secret"
  timeout_ms: 10000
  submit_max_attempts: 3
  sync_deployment: "document-sync/production"

content:
  base_url: "http://127.0.0.1:9000/"
  token: "CONTENT_API_TOKEN"

orchestrator:
  default_concurrency: 3
  max_concurrency: 10
  zombie_threshold_seconds: 3600
  reap_interval_seconds: 300
  write_back_results: true
"#
}
