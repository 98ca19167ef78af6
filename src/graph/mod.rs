//! Narrative graph
//!
//! The single source of truth for a story: nodes, ordered edges,
//! characters and the designated start node. All changes go through
//! [`GraphStore::apply`], which validates them as a unit and publishes
//! immutable snapshots.

pub mod edge;
pub mod event;
pub mod mutation;
pub mod node;
pub mod project;
pub mod store;
pub mod types;

// Re-export main types
pub use edge::Edge;
pub use event::ChangeEvent;
pub use mutation::Mutation;
pub use node::{text_digest, AssetKind, AssetRef, Character, DerivedEmotion, Node, PresentationHints};
pub use project::{Project, Snapshot};
pub use store::{validate_project, EventStream, GraphError, GraphResult, GraphStore, MutationObserver};
pub use types::{is_identifier, CharacterId, Locale, NodeId, NodeKind};
