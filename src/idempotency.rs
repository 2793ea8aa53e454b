//! Deterministic idempotency keys for content-addressed document pipelines.
//!
//! Node workflows are never deduplicated this way: each trigger is an
//! explicit user action and creates a new run.

use serde_json::json;
use sha2::{Digest, Sha256};

const KEY_PREFIX: &str = "pj1";

/// SHA-256 over the canonical JSON encoding of the tuple, hex encoded and
/// prefixed with the key scheme version.
pub fn key(target_id: &str, target_version: i64, operation_id: &str, dry_run: bool) -> String {
    // A JSON array keeps field boundaries unambiguous ("a|b" vs "a", "|b").
    let canonical = json!([target_id, target_version, operation_id, dry_run]).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{KEY_PREFIX}:{}", hex::encode(digest))
}
