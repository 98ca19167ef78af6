//! vnova narrative engine
//!
//! The core of a visual-novel authoring tool: a branching story graph with
//! enforced integrity rules, AI-assisted text generation against that graph,
//! automatic emotion tagging of edited text, and a deterministic compiler
//! that turns the graph into a Ren'Py project.
//!
//! # Components
//!
//! - [`graph`]: the single-writer graph store, its mutations and snapshots
//! - [`emotion`]: classification of node text into emotion tags
//! - [`generation`]: generation jobs, retries and cancellation
//! - [`export`]: Ren'Py export and re-import
//! - [`persistence`]: the versioned project file and the mutation journal
//! - [`config`]: engine configuration
//!
//! ## Example Usage
//!
//! ```rust
//! use vnova::graph::{Edge, GraphStore, Mutation, Node, NodeId, NodeKind, Project};
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let store = GraphStore::new(Project::new("Rainy Cafe")).unwrap();
//!
//!     let hello = Node::new(NodeId::new(0), NodeKind::Narration).with_text("en", "Rain.");
//!     let bye = Node::new(NodeId::new(1), NodeKind::Narration).with_text("en", "Silence.");
//!     store.apply(Mutation::create_node(hello)).await.unwrap();
//!     store.apply(Mutation::create_node(bye)).await.unwrap();
//!     let snapshot = store
//!         .apply(Mutation::add_edge(Edge::new(NodeId::new(0), NodeId::new(1), 0)))
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(snapshot.start, Some(NodeId::new(0)));
//!     assert_eq!(snapshot.edge_count(), 1);
//! });
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod emotion;
pub mod export;
pub mod generation;
pub mod graph;
pub mod persistence;

// Re-export main types for convenience
pub use config::{ConfigError, ConfigResult, EngineConfig};

pub use emotion::{ClassificationError, EmotionCategory, EmotionClassifier, EmotionTag};

pub use export::{ExportError, ExportManifest, Exporter, ImportError};

pub use generation::{GenerationError, GenerationJob, GenerationOrchestrator, JobId, JobStatus};

pub use graph::{
    ChangeEvent, GraphError, GraphResult, GraphStore, Mutation, Node, NodeId, NodeKind, Project,
    Snapshot,
};

pub use persistence::{Journal, JournalError, PersistenceError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}
