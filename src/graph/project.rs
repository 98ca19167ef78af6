//! Project aggregate and read-only snapshots
//!
//! A `Project` owns every node and character of a story. The store never
//! mutates a published project; each commit publishes a fresh `Snapshot`
//! that shares unchanged nodes with its predecessor.

use super::edge::Edge;
use super::node::{Character, Node};
use super::types::{CharacterId, Locale, NodeId, NodeKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Deref;
use std::sync::Arc;

/// Root aggregate of a story
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub title: String,

    /// Locale whose text drives classification and export
    #[serde(default)]
    pub default_locale: Locale,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NodeId>,

    /// Incremented on every committed mutation
    #[serde(default)]
    pub schema_version: u64,

    #[serde(default)]
    pub nodes: BTreeMap<NodeId, Arc<Node>>,

    #[serde(default)]
    pub characters: BTreeMap<CharacterId, Character>,

    /// Setting notes shared by every generation prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_info: Option<String>,
}

impl Project {
    pub fn new(title: impl Into<String>) -> Self {
        Project {
            title: title.into(),
            default_locale: Locale::default(),
            start: None,
            schema_version: 0,
            nodes: BTreeMap::new(),
            characters: BTreeMap::new(),
            world_info: None,
        }
    }

    pub fn with_world_info(mut self, world_info: impl Into<String>) -> Self {
        self.world_info = Some(world_info.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<Locale>) -> Self {
        self.default_locale = locale.into();
        self
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id).map(|n| n.as_ref())
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn character(&self, id: &CharacterId) -> Option<&Character> {
        self.characters.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.edges.len()).sum()
    }

    /// Smallest id strictly greater than every existing node id.
    ///
    /// Once `u64::MAX` is taken this falls back to the lowest unused id.
    pub fn next_node_id(&self) -> NodeId {
        let Some(last) = self.nodes.keys().next_back() else {
            return NodeId::new(0);
        };
        match last.as_u64().checked_add(1) {
            Some(next) => NodeId::new(next),
            None => self.lowest_free_node_id(),
        }
    }

    fn lowest_free_node_id(&self) -> NodeId {
        let mut candidate = 0u64;
        for id in self.nodes.keys() {
            if id.as_u64() != candidate {
                break;
            }
            candidate += 1;
        }
        NodeId::new(candidate)
    }

    /// Default-locale text of a node
    pub fn primary_text(&self, id: NodeId) -> &str {
        self.node(id)
            .map(|n| n.text_for(&self.default_locale))
            .unwrap_or("")
    }

    /// Edges pointing at `target`, ordered by (source, order)
    pub fn incoming(&self, target: NodeId) -> Vec<&Edge> {
        self.nodes
            .values()
            .flat_map(|n| n.edges.iter())
            .filter(|e| e.target == target)
            .collect()
    }

    /// Whether an edge participates in the permitted Jump -> Label cycle form
    pub fn is_jump_to_label(&self, edge: &Edge) -> bool {
        let source = self.node(edge.source).map(|n| n.kind);
        let target = self.node(edge.target).map(|n| n.kind);
        source == Some(NodeKind::Jump) && target == Some(NodeKind::Label)
    }

    /// Whether `to` is reachable from `from` without following Jump -> Label edges
    pub fn reaches_without_jumps(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.node(id) {
                for edge in &node.edges {
                    if !self.is_jump_to_label(edge) {
                        stack.push(edge.target);
                    }
                }
            }
        }
        false
    }

    /// Every node reachable from the start node (including it)
    pub fn reachable_from_start(&self) -> BTreeSet<NodeId> {
        let mut reachable = BTreeSet::new();
        let Some(start) = self.start.filter(|s| self.has_node(*s)) else {
            return reachable;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(node) = self.node(id) {
                queue.extend(node.edges.iter().map(|e| e.target));
            }
        }
        reachable
    }

    /// Nodes not reachable from the start node, in id order
    pub fn unreachable_nodes(&self) -> Vec<NodeId> {
        let reachable = self.reachable_from_start();
        self.nodes
            .keys()
            .filter(|id| !reachable.contains(id))
            .copied()
            .collect()
    }

    /// Nodes whose derived emotion does not match their current primary text
    pub fn stale_emotions(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| {
                let text = n.text_for(&self.default_locale);
                n.emotion.is_some() && !n.emotion_matches(text)
            })
            .map(|n| n.id)
            .collect()
    }

    /// Hex SHA-256 of the canonical JSON form of this project
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Immutable, point-in-time view of a project
#[derive(Debug, Clone)]
pub struct Snapshot {
    project: Arc<Project>,
}

impl Snapshot {
    pub fn new(project: Project) -> Self {
        Snapshot {
            project: Arc::new(project),
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn schema_version(&self) -> u64 {
        self.project.schema_version
    }

    /// Whether two snapshots share the same underlying state
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.project, &other.project)
    }
}

impl Deref for Snapshot {
    type Target = Project;

    fn deref(&self) -> &Project {
        &self.project
    }
}
