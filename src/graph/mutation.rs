//! Mutations accepted by the graph store
//!
//! Every mutation is validated as a single unit before anything becomes
//! visible. `Batch` groups several mutations into one atomic commit.

use super::edge::Edge;
use super::node::{AssetRef, Character, Node};
use super::types::{CharacterId, Locale, NodeId};
use crate::emotion::EmotionTag;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Insert a new node. Its edge list must be empty; edges are added with `AddEdge`.
    CreateNode { node: Node },

    /// Remove a node, every edge touching it, and cancel its generation jobs
    DeleteNode { id: NodeId },

    UpdateText {
        node: NodeId,
        locale: Locale,
        text: String,
    },

    AddEdge { edge: Edge },

    RemoveEdge { source: NodeId, order: u32 },

    /// Reorder a node's edges. `sequence` lists the existing order indices
    /// in the desired order; edges are renumbered densely from 0.
    ReorderEdges { source: NodeId, sequence: Vec<u32> },

    /// Create or replace a character
    SetCharacter { character: Character },

    RemoveCharacter { id: CharacterId },

    SetSpeaker {
        node: NodeId,
        speaker: Option<CharacterId>,
    },

    SetAssets { node: NodeId, assets: Vec<AssetRef> },

    SetStart { node: NodeId },

    /// Replace the project's world setting notes
    SetWorldInfo { text: Option<String> },

    SetManualEmotionOverride {
        node: NodeId,
        tag: Option<EmotionTag>,
    },

    Batch { mutations: Vec<Mutation> },
}

impl Mutation {
    pub fn create_node(node: Node) -> Self {
        Mutation::CreateNode { node }
    }

    pub fn delete_node(id: NodeId) -> Self {
        Mutation::DeleteNode { id }
    }

    pub fn update_text(node: NodeId, locale: impl Into<Locale>, text: impl Into<String>) -> Self {
        Mutation::UpdateText {
            node,
            locale: locale.into(),
            text: text.into(),
        }
    }

    pub fn add_edge(edge: Edge) -> Self {
        Mutation::AddEdge { edge }
    }

    pub fn set_character(character: Character) -> Self {
        Mutation::SetCharacter { character }
    }

    pub fn batch(mutations: impl IntoIterator<Item = Mutation>) -> Self {
        Mutation::Batch {
            mutations: mutations.into_iter().collect(),
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreateNode { .. } => "create_node",
            Mutation::DeleteNode { .. } => "delete_node",
            Mutation::UpdateText { .. } => "update_text",
            Mutation::AddEdge { .. } => "add_edge",
            Mutation::RemoveEdge { .. } => "remove_edge",
            Mutation::ReorderEdges { .. } => "reorder_edges",
            Mutation::SetCharacter { .. } => "set_character",
            Mutation::RemoveCharacter { .. } => "remove_character",
            Mutation::SetSpeaker { .. } => "set_speaker",
            Mutation::SetAssets { .. } => "set_assets",
            Mutation::SetStart { .. } => "set_start",
            Mutation::SetWorldInfo { .. } => "set_world_info",
            Mutation::SetManualEmotionOverride { .. } => "set_manual_emotion_override",
            Mutation::Batch { .. } => "batch",
        }
    }
}
