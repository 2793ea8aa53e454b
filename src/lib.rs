//! Workflow and batch execution orchestrator.
//!
//! Runs are single attempts of a workflow against one node or document,
//! executed by a remote engine. Batches fan runs out over a content tree.

pub mod api;
pub mod batch;
pub mod config;
pub mod content;
pub mod db;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod reaper;
pub mod retention;
pub mod retry;
pub mod signature;

pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, Settings};
