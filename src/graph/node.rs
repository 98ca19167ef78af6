//! Node and character definitions for the narrative graph
//!
//! A node is a single narrative unit: a narration line, a dialogue line,
//! a choice point, a label or a jump. Speaker and asset references are
//! weak, id-based references resolved against the owning store (speakers)
//! or the external asset manager (assets) at use time.

use super::edge::Edge;
use super::types::{CharacterId, Locale, NodeId, NodeKind};
use crate::emotion::EmotionTag;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of external asset a node refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Background,
    Sprite,
    Music,
    Sound,
}

/// Weak reference to an asset owned by the asset manager
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct AssetRef {
    pub kind: AssetKind,
    pub key: String,
}

impl AssetRef {
    pub fn new(kind: AssetKind, key: impl Into<String>) -> Self {
        AssetRef {
            kind,
            key: key.into(),
        }
    }

    pub fn background(key: impl Into<String>) -> Self {
        Self::new(AssetKind::Background, key)
    }

    pub fn sprite(key: impl Into<String>) -> Self {
        Self::new(AssetKind::Sprite, key)
    }

    pub fn music(key: impl Into<String>) -> Self {
        Self::new(AssetKind::Music, key)
    }

    pub fn sound(key: impl Into<String>) -> Self {
        Self::new(AssetKind::Sound, key)
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.key)
    }
}

/// Emotion derived from a node's text, stamped with the digest of that text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEmotion {
    pub tag: EmotionTag,
    pub text_digest: String,
}

/// A story node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node
    pub id: NodeId,

    pub kind: NodeKind,

    /// Text content per locale
    #[serde(default)]
    pub text: BTreeMap<Locale, String>,

    /// Speaking character (weak reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<CharacterId>,

    /// Outgoing edges, kept sorted by order index
    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Asset references (weak references into the asset manager)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<AssetRef>,

    /// Emotion derived by the classifier; only ever written by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<DerivedEmotion>,

    /// Author override that wins over the derived emotion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_override: Option<EmotionTag>,
}

impl Node {
    /// Create a node with no text
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Node {
            id,
            kind,
            text: BTreeMap::new(),
            speaker: None,
            edges: Vec::new(),
            assets: Vec::new(),
            emotion: None,
            manual_override: None,
        }
    }

    /// Set text for a locale (builder style)
    pub fn with_text(mut self, locale: impl Into<Locale>, text: impl Into<String>) -> Self {
        self.text.insert(locale.into(), text.into());
        self
    }

    pub fn with_speaker(mut self, speaker: impl Into<CharacterId>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    pub fn with_asset(mut self, asset: AssetRef) -> Self {
        self.assets.push(asset);
        self
    }

    /// Text for a locale, empty when missing
    pub fn text_for(&self, locale: &Locale) -> &str {
        self.text.get(locale).map(String::as_str).unwrap_or("")
    }

    /// Effective emotion: the manual override if set, else the derived tag
    pub fn effective_emotion(&self) -> Option<&EmotionTag> {
        self.manual_override
            .as_ref()
            .or_else(|| self.emotion.as_ref().map(|d| &d.tag))
    }

    /// Whether the derived emotion was computed from `text`
    pub fn emotion_matches(&self, text: &str) -> bool {
        self.emotion
            .as_ref()
            .map(|d| d.text_digest == text_digest(text))
            .unwrap_or(false)
    }

    /// Outgoing edge with the given order index
    pub fn edge(&self, order: u32) -> Option<&Edge> {
        self.edges.iter().find(|e| e.order == order)
    }

    /// Insert an edge keeping the list sorted by order index
    pub(crate) fn insert_edge(&mut self, edge: Edge) {
        let pos = self
            .edges
            .binary_search_by_key(&edge.order, |e| e.order)
            .unwrap_or_else(|p| p);
        self.edges.insert(pos, edge);
    }

    /// Default successor: the target of the lowest-order edge
    pub fn next(&self) -> Option<NodeId> {
        self.edges.first().map(|e| e.target)
    }
}

/// Presentation hints for a character, opaque to the core
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresentationHints {
    /// Image tag used for the character's sprites
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite: Option<String>,

    /// Voice identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Name colour, e.g. "#ffaacc"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A character that can speak dialogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    #[serde(default)]
    pub hints: PresentationHints,

    /// Personality and background, passed to the model when drafting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Character {
    pub fn new(id: impl Into<CharacterId>, name: impl Into<String>) -> Self {
        Character {
            id: id.into(),
            name: name.into(),
            hints: PresentationHints::default(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_sprite(mut self, sprite: impl Into<String>) -> Self {
        self.hints.sprite = Some(sprite.into());
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.hints.voice = Some(voice.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.hints.color = Some(color.into());
        self
    }
}

/// Hex SHA-256 digest of a text, used to key classifications
pub fn text_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
