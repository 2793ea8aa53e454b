use std::sync::Arc;

use crate::orchestrator::Orchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orch: Orchestrator,
    /// Shared secret the engine signs callbacks with.
    pub callback_secret: Arc<str>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(orch: Orchestrator, callback_secret: &str) -> Self {
        Self {
            orch,
            callback_secret: Arc::from(callback_secret),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
