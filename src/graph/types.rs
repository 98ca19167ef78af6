//! Core type definitions for the narrative graph

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a story node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Script label generated for this node by the export compiler
    pub fn script_label(&self) -> String {
        format!("node_{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId(id)
    }
}

/// Identifier of a character.
///
/// Character ids double as script identifiers in the exported project,
/// so they are restricted to `[A-Za-z_][A-Za-z0-9_]*` and may not shadow
/// a statement keyword or a name the exported project defines itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct CharacterId(String);

impl CharacterId {
    pub fn new(id: impl Into<String>) -> Self {
        CharacterId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a speaker in the exported script
    pub fn is_valid(&self) -> bool {
        is_identifier(&self.0) && !RESERVED_NAMES.contains(&self.0.as_str())
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CharacterId {
    fn from(s: &str) -> Self {
        CharacterId(s.to_string())
    }
}

impl From<String> for CharacterId {
    fn from(s: String) -> Self {
        CharacterId(s)
    }
}

/// Locale key for node text (e.g. "en", "zh_CN")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Locale(String);

impl Locale {
    pub fn new(locale: impl Into<String>) -> Self {
        Locale(locale.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Locale {
    fn default() -> Self {
        Locale("en".to_string())
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Locale {
    fn from(s: &str) -> Self {
        Locale(s.to_string())
    }
}

/// Closed set of node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Narration,
    Dialogue,
    ChoicePoint,
    Label,
    Jump,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Narration => "narration",
            NodeKind::Dialogue => "dialogue",
            NodeKind::ChoicePoint => "choice",
            NodeKind::Label => "label",
            NodeKind::Jump => "jump",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "narration" => Some(NodeKind::Narration),
            "dialogue" => Some(NodeKind::Dialogue),
            "choice" => Some(NodeKind::ChoicePoint),
            "label" => Some(NodeKind::Label),
            "jump" => Some(NodeKind::Jump),
            _ => None,
        }
    }

    /// Maximum number of outgoing edges a node of this kind may carry
    pub fn max_out_degree(&self) -> Option<usize> {
        match self {
            NodeKind::ChoicePoint => None,
            _ => Some(1),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Words a say statement may not start with, plus names defined by the
/// exported project and Python keywords
const RESERVED_NAMES: &[&str] = &[
    "add", "adv", "and", "as", "at", "behind", "build", "call", "camera", "centered", "config",
    "default", "define", "elif", "else", "expression", "extend", "False", "for", "hide", "if",
    "image", "in", "init", "is", "jump", "label", "layeredimage", "menu", "None", "not", "nvl",
    "onlayer", "or", "pass", "pause", "persistent", "play", "python", "queue", "renpy", "return",
    "scene", "screen", "show", "stop", "store", "style", "testcase", "transform", "translate",
    "True", "vcentered", "voice", "while", "window", "with", "zorder", "narrator", "Character",
];

/// Returns true when `s` matches `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
