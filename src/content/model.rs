use serde::{Deserialize, Serialize};

/// A node in the upstream content tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub doc_type: Option<String>,
    /// Whether the node carries source content a workflow can read.
    #[serde(default)]
    pub has_source: bool,
    /// Whether a previous run already produced output for this node.
    #[serde(default)]
    pub has_output: bool,
}

/// A document attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub doc_type: Option<String>,
    pub version: i64,
    #[serde(default)]
    pub has_content: bool,
    #[serde(default)]
    pub has_output: bool,
}

#[derive(Deserialize, Debug)]
pub struct NodeList {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Deserialize, Debug)]
pub struct DocumentList {
    pub documents: Vec<DocumentInfo>,
}
