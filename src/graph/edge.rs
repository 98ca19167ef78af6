//! Edge implementation for the narrative graph
//!
//! Edges are directed, ordered transitions between nodes. An edge is
//! addressed by its source node and its order index; order indices are
//! unique within a source node so traversal order is always deterministic.

use super::types::NodeId;
use serde::{Deserialize, Serialize};

/// A directed, ordered transition from one node to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node (edge goes FROM this node)
    pub source: NodeId,

    /// Target node (edge goes TO this node)
    pub target: NodeId,

    /// Choice text shown to the player, if this edge is a menu option
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Position among the source node's outgoing edges
    pub order: u32,
}

impl Edge {
    /// Create an unlabeled edge
    pub fn new(source: NodeId, target: NodeId, order: u32) -> Self {
        Edge {
            source,
            target,
            label: None,
            order,
        }
    }

    /// Create a choice edge carrying option text
    pub fn choice(source: NodeId, target: NodeId, label: impl Into<String>, order: u32) -> Self {
        Edge {
            source,
            target,
            label: Some(label.into()),
            order,
        }
    }
}
