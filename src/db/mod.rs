//! Database module: record stores backed by SQLite.
//!
//! - `repo`: pool setup, migrations and workflow definitions.
//! - `runs`: the run record store (one row per attempt).
//! - `batches`: the batch record store (counters plus detail list).
//! - `jobs`: document pipeline jobs and the per-document sync status cache.
//! - `model`: row mappers and query filters shared by the stores.
//!
//! Run and batch functions are reached through their submodules
//! (`db::runs::fetch_run`), pool plumbing is re-exported at `crate::db::*`.

pub mod batches;
pub mod jobs;
pub mod model;
pub mod repo;
pub mod runs;

pub use model::{CleanupFilter, CleanupReport};
pub use repo::*;
