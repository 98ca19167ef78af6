//! Graph change events
//!
//! Captures committed changes to the graph so caches (classifier,
//! generation jobs, UI views) can invalidate what they hold.

use super::types::{CharacterId, Locale, NodeId};
use crate::emotion::EmotionTag;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    NodeCreated {
        id: NodeId,
        version: u64,
    },
    NodeDeleted {
        id: NodeId,
        version: u64,
    },
    TextUpdated {
        id: NodeId,
        locale: Locale,
        version: u64,
    },
    EmotionUpdated {
        id: NodeId,
        tag: Option<EmotionTag>,
        version: u64,
    },
    /// Reclassification failed; the node kept its previous tag
    ClassificationFailed {
        id: NodeId,
        reason: String,
        version: u64,
    },
    EdgesChanged {
        id: NodeId,
        version: u64,
    },
    SpeakerChanged {
        id: NodeId,
        speaker: Option<CharacterId>,
        version: u64,
    },
    AssetsChanged {
        id: NodeId,
        version: u64,
    },
    OverrideChanged {
        id: NodeId,
        tag: Option<EmotionTag>,
        version: u64,
    },
    CharacterChanged {
        character: CharacterId,
        removed: bool,
        version: u64,
    },
    StartChanged {
        id: NodeId,
        version: u64,
    },
    WorldInfoChanged {
        version: u64,
    },
}

impl ChangeEvent {
    /// The node this event concerns, if any
    pub fn node_id(&self) -> Option<NodeId> {
        use ChangeEvent::*;
        match self {
            NodeCreated { id, .. }
            | NodeDeleted { id, .. }
            | TextUpdated { id, .. }
            | EmotionUpdated { id, .. }
            | ClassificationFailed { id, .. }
            | EdgesChanged { id, .. }
            | SpeakerChanged { id, .. }
            | AssetsChanged { id, .. }
            | OverrideChanged { id, .. }
            | StartChanged { id, .. } => Some(*id),
            CharacterChanged { .. } | WorldInfoChanged { .. } => None,
        }
    }

    /// Schema version of the snapshot that published this event
    pub fn version(&self) -> u64 {
        use ChangeEvent::*;
        match self {
            NodeCreated { version, .. }
            | NodeDeleted { version, .. }
            | TextUpdated { version, .. }
            | EmotionUpdated { version, .. }
            | ClassificationFailed { version, .. }
            | EdgesChanged { version, .. }
            | SpeakerChanged { version, .. }
            | AssetsChanged { version, .. }
            | OverrideChanged { version, .. }
            | CharacterChanged { version, .. }
            | StartChanged { version, .. }
            | WorldInfoChanged { version } => *version,
        }
    }

    pub(crate) fn set_version(&mut self, v: u64) {
        use ChangeEvent::*;
        match self {
            NodeCreated { version, .. }
            | NodeDeleted { version, .. }
            | TextUpdated { version, .. }
            | EmotionUpdated { version, .. }
            | ClassificationFailed { version, .. }
            | EdgesChanged { version, .. }
            | SpeakerChanged { version, .. }
            | AssetsChanged { version, .. }
            | OverrideChanged { version, .. }
            | CharacterChanged { version, .. }
            | StartChanged { version, .. }
            | WorldInfoChanged { version } => *version = v,
        }
    }
}
