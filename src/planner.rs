//! Eligibility planning: which targets under a root a batch would touch,
//! and why the others are skipped. Planning never writes anything.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::instrument;

use crate::content::{ContentStore, DocumentInfo, NodeInfo};
use crate::db::{self, Pool};
use crate::error::{OrchestratorError, Result};
use crate::model::Target;

/// Why a planned target will not be executed. Declaration order is the
/// evaluation priority: the first predicate that matches is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NameFilter,
    ExcludedType,
    NoSource,
    HasOutput,
    UpToDate,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NameFilter => "name_filter",
            SkipReason::ExcludedType => "excluded_type",
            SkipReason::NoSource => "no_source",
            SkipReason::HasOutput => "has_output",
            SkipReason::UpToDate => "up_to_date",
        }
    }
}

/// Optional skip predicates. All off by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFilters {
    #[serde(default)]
    pub skip_no_source: bool,
    #[serde(default)]
    pub skip_has_output: bool,
    /// Case-insensitive substring the target name must contain.
    #[serde(default)]
    pub name_filter: Option<String>,
    #[serde(default)]
    pub excluded_types: Vec<String>,
    /// Sync plans only: skip documents whose current version already synced.
    #[serde(default)]
    pub skip_up_to_date: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// One run per node.
    Workflow,
    /// One sync run per document attached to the planned nodes.
    Sync,
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub root_node_id: String,
    pub include_descendants: bool,
    pub filters: PlanFilters,
    pub mode: PlanMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub target: Target,
    pub name: String,
    pub path: String,
    pub can_execute: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityReport {
    pub root_id: String,
    pub total_nodes: usize,
    pub can_execute: usize,
    pub will_skip: usize,
    pub items: Vec<PlanItem>,
}

impl EligibilityReport {
    fn from_items(root_id: &str, items: Vec<PlanItem>) -> Self {
        let can_execute = items.iter().filter(|i| i.can_execute).count();
        Self {
            root_id: root_id.to_string(),
            total_nodes: items.len(),
            can_execute,
            will_skip: items.len() - can_execute,
            items,
        }
    }
}

/// The facts the predicates look at, shared by nodes and documents.
struct Candidate<'a> {
    name: &'a str,
    doc_type: Option<&'a str>,
    has_source: bool,
    has_output: bool,
    up_to_date: bool,
}

fn first_skip(filters: &PlanFilters, c: &Candidate<'_>) -> Option<SkipReason> {
    if let Some(needle) = filters.name_filter.as_deref().filter(|n| !n.trim().is_empty()) {
        if !c.name.to_lowercase().contains(&needle.trim().to_lowercase()) {
            return Some(SkipReason::NameFilter);
        }
    }
    if let Some(doc_type) = c.doc_type {
        if filters.excluded_types.iter().any(|t| t.eq_ignore_ascii_case(doc_type)) {
            return Some(SkipReason::ExcludedType);
        }
    }
    if filters.skip_no_source && !c.has_source {
        return Some(SkipReason::NoSource);
    }
    if filters.skip_has_output && c.has_output {
        return Some(SkipReason::HasOutput);
    }
    if filters.skip_up_to_date && c.up_to_date {
        return Some(SkipReason::UpToDate);
    }
    None
}

fn item(target: Target, name: &str, path: &str, skip: Option<SkipReason>) -> PlanItem {
    PlanItem {
        target,
        name: name.to_string(),
        path: path.to_string(),
        can_execute: skip.is_none(),
        skip_reason: skip,
    }
}

/// Candidate nodes in pre-order. Without descendants the root itself is the
/// only candidate; with descendants the root is the container and excluded.
async fn candidate_nodes(
    content: &dyn ContentStore,
    root: NodeInfo,
    include_descendants: bool,
) -> Result<Vec<NodeInfo>> {
    if !include_descendants {
        return Ok(vec![root]);
    }
    let mut out = Vec::new();
    let mut stack: Vec<NodeInfo> = content.children(&root.id).await?.into_iter().rev().collect();
    while let Some(node) = stack.pop() {
        let children = content.children(&node.id).await?;
        stack.extend(children.into_iter().rev());
        out.push(node);
    }
    Ok(out)
}

/// Versions already synced successfully, keyed by document id.
async fn synced_versions(pool: &Pool, docs: &[DocumentInfo]) -> Result<HashMap<String, i64>> {
    let mut versions = HashMap::new();
    for doc in docs {
        if let Some(status) = db::jobs::fetch_sync_status(pool, &doc.id).await? {
            if let Some(v) = status.last_synced_version {
                versions.insert(doc.id.clone(), v);
            }
        }
    }
    Ok(versions)
}

/// Build the eligibility report for `req`. Deterministic for an unchanged
/// tree: the output order is the content store's order, walked pre-order.
#[instrument(skip_all, fields(root = %req.root_node_id, descendants = req.include_descendants))]
pub async fn plan(
    content: &dyn ContentStore,
    pool: &Pool,
    req: &PlanRequest,
) -> Result<EligibilityReport> {
    let root = content
        .node(&req.root_node_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("node {}", req.root_node_id)))?;
    let nodes = candidate_nodes(content, root, req.include_descendants).await?;

    let items = match req.mode {
        PlanMode::Workflow => nodes
            .iter()
            .map(|n| {
                let skip = first_skip(
                    &req.filters,
                    &Candidate {
                        name: &n.name,
                        doc_type: n.doc_type.as_deref(),
                        has_source: n.has_source,
                        has_output: n.has_output,
                        up_to_date: false,
                    },
                );
                item(Target::Node(n.id.clone()), &n.name, &n.path, skip)
            })
            .collect(),
        PlanMode::Sync => {
            let mut docs = Vec::new();
            for node in &nodes {
                docs.extend(content.documents(&node.id).await?);
            }
            let synced = if req.filters.skip_up_to_date {
                synced_versions(pool, &docs).await?
            } else {
                HashMap::new()
            };
            docs.iter()
                .map(|d| {
                    let skip = first_skip(
                        &req.filters,
                        &Candidate {
                            name: &d.name,
                            doc_type: d.doc_type.as_deref(),
                            has_source: d.has_content,
                            has_output: d.has_output,
                            up_to_date: synced.get(&d.id) == Some(&d.version),
                        },
                    );
                    item(Target::Document(d.id.clone()), &d.name, &d.path, skip)
                })
                .collect()
        }
    };

    Ok(EligibilityReport::from_items(&req.root_node_id, items))
}
