//! Transactional narrative graph store
//!
//! Every mutation is applied to a private working copy of the current
//! project, validated, reclassified where text changed, and only then
//! published as a new immutable [`Snapshot`]. A rejected mutation leaves
//! the published state untouched.
//!
//! Writers are serialised by an async mutex; readers never block and
//! always see a fully committed snapshot.

use super::edge::Edge;
use super::event::ChangeEvent;
use super::mutation::Mutation;
use super::node::{text_digest, AssetRef, Character, DerivedEmotion, Node};
use super::project::{Project, Snapshot};
use super::types::{CharacterId, Locale, NodeId, NodeKind};
use crate::emotion::{EmotionClassifier, EmotionTag};
use futures::Stream;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Errors raised when a mutation or a loaded project breaks a graph rule
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Referential integrity: node {0} already exists")]
    DuplicateNode(NodeId),

    #[error("Referential integrity: node {key} is stored under a different id {id}")]
    InconsistentId { key: NodeId, id: NodeId },

    #[error("Referential integrity: edge from {from} targets missing node {target}")]
    DanglingEdgeTarget { from: NodeId, target: NodeId },

    #[error("Referential integrity: node {node} names unknown speaker '{speaker}'")]
    UnknownSpeaker { node: NodeId, speaker: CharacterId },

    #[error("Character '{0}' not found")]
    CharacterNotFound(CharacterId),

    #[error("Referential integrity: character '{character}' is still spoken by node {node}")]
    CharacterInUse { character: CharacterId, node: NodeId },

    #[error("Character id '{0}' is not a valid identifier")]
    InvalidCharacterId(CharacterId),

    #[error("Acyclicity: edge {from} -> {to} closes a cycle not formed by a Jump to a Label")]
    IllegalCycle { from: NodeId, to: NodeId },

    #[error("Edge order: node {node} already has an edge with order {order}")]
    DuplicateEdgeOrder { node: NodeId, order: u32 },

    #[error("Edge with order {order} not found on node {node}")]
    EdgeNotFound { node: NodeId, order: u32 },

    #[error("Edge order: reorder of node {node} is not a permutation of its edges")]
    InvalidReorder { node: NodeId },

    #[error("Structure: {kind:?} node {node} cannot have more outgoing edges")]
    OutDegreeExceeded { node: NodeId, kind: NodeKind },

    #[error("Structure: jump {jump} must target a Label node, not {target}")]
    JumpTargetNotLabel { jump: NodeId, target: NodeId },

    #[error("Structure: edge listed on node {node} has source {edge_source}")]
    MisplacedEdge { node: NodeId, edge_source: NodeId },

    #[error("Structure: node {0} is the start node; designate another start first")]
    StartNodeDeletion(NodeId),

    #[error("Node {0} must be created without edges; add them with AddEdge")]
    EdgesOnCreate(NodeId),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Stream of change events returned by [`GraphStore::subscribe`]
pub type EventStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// Synchronous hook invoked after every commit
pub trait MutationObserver: Send + Sync {
    fn on_commit(&self, snapshot: &Snapshot, events: &[ChangeEvent]);
}

/// Store of one project
pub struct GraphStore {
    state: watch::Sender<Snapshot>,
    writer: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ChangeEvent>,
    classifier: Option<Arc<EmotionClassifier>>,
    observers: Mutex<Vec<Weak<dyn MutationObserver>>>,
}

impl GraphStore {
    /// Open a store without an emotion classifier.
    ///
    /// Derived tags whose text changed since they were computed are dropped.
    pub fn new(project: Project) -> GraphResult<Self> {
        let mut project = normalize(project);
        validate_project(&project)?;

        let ids: Vec<NodeId> = project.nodes.keys().copied().collect();
        for id in ids {
            let Some(text) = project.node(id).map(|n| n.text_for(&project.default_locale).to_string()) else {
                continue;
            };
            if let Some(node) = project.nodes.get_mut(&id) {
                if !node.emotion_matches(&text) {
                    let node = Arc::make_mut(node);
                    node.emotion = empty_text_emotion(&text);
                }
            }
        }

        Ok(Self::from_parts(project, None))
    }

    /// Open a store with a classifier, recomputing missing or stale tags
    pub async fn with_classifier(
        project: Project,
        classifier: Arc<EmotionClassifier>,
    ) -> GraphResult<Self> {
        let project = normalize(project);
        validate_project(&project)?;
        let store = Self::from_parts(project, Some(classifier));
        let refreshed = store.reclassify_stale().await;
        if refreshed > 0 {
            info!("Reclassified {} nodes on open", refreshed);
        }
        Ok(store)
    }

    fn from_parts(project: Project, classifier: Option<Arc<EmotionClassifier>>) -> Self {
        info!(
            "Opened project '{}' with {} nodes and {} characters",
            project.title,
            project.node_count(),
            project.characters.len()
        );
        let (state, _) = watch::channel(Snapshot::new(project));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state,
            writer: tokio::sync::Mutex::new(()),
            events,
            classifier,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Current committed snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    /// Receiver that is notified whenever a new snapshot is published
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    pub fn classifier(&self) -> Option<&Arc<EmotionClassifier>> {
        self.classifier.as_ref()
    }

    /// Validate and commit a mutation atomically.
    ///
    /// Text changes are reclassified before the new snapshot becomes
    /// visible, so readers never observe text paired with a tag derived
    /// from older text.
    pub async fn apply(&self, mutation: Mutation) -> GraphResult<Snapshot> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot();
        let name = mutation.name();

        let mut txn = Transaction::new(current.project().clone());
        if let Err(e) = txn.apply(mutation) {
            warn!("Rejected {}: {}", name, e);
            return Err(e);
        }

        let Transaction {
            mut project,
            mut events,
            text_changed,
        } = txn;
        self.refresh_emotions(&mut project, &text_changed, &mut events)
            .await;
        let snapshot = self.commit(project, events, true);
        debug!("Committed {} at version {}", name, snapshot.schema_version());
        Ok(snapshot)
    }

    /// Recompute tags that are missing or no longer match their text.
    ///
    /// Returns the number of nodes whose tag changed. Refreshed tags are
    /// published under the current version: only mutations advance it, so
    /// journal replay after a restart still lines up with the saved project.
    pub async fn reclassify_stale(&self) -> usize {
        let _guard = self.writer.lock().await;
        let mut project = self.snapshot().project().clone();
        let locale = project.default_locale.clone();
        let stale: BTreeSet<NodeId> = project
            .nodes
            .values()
            .filter(|n| !n.emotion_matches(n.text_for(&locale)))
            .map(|n| n.id)
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let mut events = Vec::new();
        self.refresh_emotions(&mut project, &stale, &mut events).await;
        let changed = events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::EmotionUpdated { .. }))
            .count();
        if !events.is_empty() {
            self.commit(project, events, false);
        }
        changed
    }

    /// Events concerning a single node
    pub fn subscribe(&self, node: NodeId) -> EventStream {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| match item {
            Ok(event) if event.node_id() == Some(node) => Some(event),
            Ok(_) => None,
            Err(e) => {
                warn!("Subscriber for {} lagged: {}", node, e);
                None
            }
        });
        Box::pin(stream)
    }

    /// Every committed change event
    pub fn subscribe_all(&self) -> EventStream {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Subscriber lagged: {}", e);
                None
            }
        });
        Box::pin(stream)
    }

    /// Register an observer; it is dropped once the last strong reference goes away
    pub fn observe<T: MutationObserver + 'static>(&self, observer: &Arc<T>) {
        let weak: Weak<dyn MutationObserver> = Arc::downgrade(observer) as Weak<dyn MutationObserver>;
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(weak);
    }

    async fn refresh_emotions(
        &self,
        project: &mut Project,
        ids: &BTreeSet<NodeId>,
        events: &mut Vec<ChangeEvent>,
    ) {
        for &id in ids {
            let Some(node) = project.node(id) else {
                continue;
            };
            let text = node.text_for(&project.default_locale).to_string();
            if node.emotion_matches(&text) {
                continue;
            }

            let derived = match (&self.classifier, empty_text_emotion(&text)) {
                (_, Some(neutral)) => Ok(Some(neutral)),
                (None, None) => Ok(None),
                (Some(classifier), None) => classifier.classify(&text).await.map(|tag| {
                    Some(DerivedEmotion {
                        tag,
                        text_digest: text_digest(&text),
                    })
                }),
            };

            let Some(slot) = project.nodes.get_mut(&id) else {
                continue;
            };
            match derived {
                Ok(emotion) => {
                    let tag = emotion.as_ref().map(|d| d.tag);
                    if slot.emotion != emotion {
                        Arc::make_mut(slot).emotion = emotion;
                        events.push(ChangeEvent::EmotionUpdated { id, tag, version: 0 });
                    }
                }
                Err(e) => {
                    warn!("Classification of {} failed, keeping previous tag: {}", id, e);
                    events.push(ChangeEvent::ClassificationFailed {
                        id,
                        reason: e.to_string(),
                        version: 0,
                    });
                }
            }
        }
    }

    fn commit(&self, mut project: Project, mut events: Vec<ChangeEvent>, advance: bool) -> Snapshot {
        if advance {
            project.schema_version += 1;
        }
        let version = project.schema_version;
        for event in events.iter_mut() {
            event.set_version(version);
        }

        let snapshot = Snapshot::new(project);
        self.state.send_replace(snapshot.clone());

        for event in &events {
            // No receivers is not an error
            let _ = self.events.send(event.clone());
        }

        let observers: Vec<Arc<dyn MutationObserver>> = {
            let mut list = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            list.retain(|w| w.strong_count() > 0);
            list.iter().filter_map(|w| w.upgrade()).collect()
        };
        for observer in observers {
            observer.on_commit(&snapshot, &events);
        }

        snapshot
    }
}

/// Tag for blank text; `None` means the text needs the classifier
fn empty_text_emotion(text: &str) -> Option<DerivedEmotion> {
    text.trim().is_empty().then(|| DerivedEmotion {
        tag: EmotionTag::neutral(),
        text_digest: text_digest(text),
    })
}

/// Sort every node's edges by order index
fn normalize(mut project: Project) -> Project {
    for node in project.nodes.values_mut() {
        if node.edges.windows(2).any(|w| w[0].order > w[1].order) {
            Arc::make_mut(node).edges.sort_by_key(|e| e.order);
        }
    }
    project
}

/// Check every graph rule over a whole project
pub fn validate_project(project: &Project) -> GraphResult<()> {
    if let Some(start) = project.start {
        if !project.has_node(start) {
            return Err(GraphError::NodeNotFound(start));
        }
    }

    for (id, character) in &project.characters {
        if !id.is_valid() || character.id != *id {
            return Err(GraphError::InvalidCharacterId(character.id.clone()));
        }
    }

    for (&key, node) in &project.nodes {
        if node.id != key {
            return Err(GraphError::InconsistentId { key, id: node.id });
        }
        if let Some(speaker) = &node.speaker {
            if !project.characters.contains_key(speaker) {
                return Err(GraphError::UnknownSpeaker {
                    node: key,
                    speaker: speaker.clone(),
                });
            }
        }
        if let Some(max) = node.kind.max_out_degree() {
            if node.edges.len() > max {
                return Err(GraphError::OutDegreeExceeded {
                    node: key,
                    kind: node.kind,
                });
            }
        }
        for (i, edge) in node.edges.iter().enumerate() {
            if edge.source != key {
                return Err(GraphError::MisplacedEdge {
                    node: key,
                    edge_source: edge.source,
                });
            }
            let Some(target) = project.node(edge.target) else {
                return Err(GraphError::DanglingEdgeTarget {
                    from: key,
                    target: edge.target,
                });
            };
            if node.kind == NodeKind::Jump && target.kind != NodeKind::Label {
                return Err(GraphError::JumpTargetNotLabel {
                    jump: key,
                    target: edge.target,
                });
            }
            if i > 0 && node.edges[i - 1].order == edge.order {
                return Err(GraphError::DuplicateEdgeOrder {
                    node: key,
                    order: edge.order,
                });
            }
        }
    }

    check_acyclic(project)
}

/// Kahn's algorithm over the graph without Jump -> Label edges
fn check_acyclic(project: &Project) -> GraphResult<()> {
    let mut indegree: BTreeMap<NodeId, usize> = project.nodes.keys().map(|id| (*id, 0)).collect();
    for node in project.nodes.values() {
        for edge in node.edges.iter().filter(|e| !project.is_jump_to_label(e)) {
            if let Some(d) = indegree.get_mut(&edge.target) {
                *d += 1;
            }
        }
    }

    let mut queue: VecDeque<NodeId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    while let Some(id) = queue.pop_front() {
        indegree.remove(&id);
        let Some(node) = project.node(id) else {
            continue;
        };
        for edge in node.edges.iter().filter(|e| !project.is_jump_to_label(e)) {
            if let Some(d) = indegree.get_mut(&edge.target) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(edge.target);
                }
            }
        }
    }

    // Whatever is left sits on or behind a cycle; report an edge between leftovers
    for id in indegree.keys() {
        if let Some(node) = project.node(*id) {
            if let Some(edge) = node
                .edges
                .iter()
                .find(|e| !project.is_jump_to_label(e) && indegree.contains_key(&e.target))
            {
                return Err(GraphError::IllegalCycle {
                    from: edge.source,
                    to: edge.target,
                });
            }
        }
    }
    Ok(())
}

/// Working copy of a project plus what changed
struct Transaction {
    project: Project,
    events: Vec<ChangeEvent>,
    text_changed: BTreeSet<NodeId>,
}

impl Transaction {
    fn new(project: Project) -> Self {
        Self {
            project,
            events: Vec::new(),
            text_changed: BTreeSet::new(),
        }
    }

    fn apply(&mut self, mutation: Mutation) -> GraphResult<()> {
        match mutation {
            Mutation::CreateNode { node } => self.create_node(node),
            Mutation::DeleteNode { id } => self.delete_node(id),
            Mutation::UpdateText { node, locale, text } => self.update_text(node, locale, text),
            Mutation::AddEdge { edge } => self.add_edge(edge),
            Mutation::RemoveEdge { source, order } => self.remove_edge(source, order),
            Mutation::ReorderEdges { source, sequence } => self.reorder_edges(source, sequence),
            Mutation::SetCharacter { character } => self.set_character(character),
            Mutation::RemoveCharacter { id } => self.remove_character(id),
            Mutation::SetSpeaker { node, speaker } => self.set_speaker(node, speaker),
            Mutation::SetAssets { node, assets } => self.set_assets(node, assets),
            Mutation::SetStart { node } => self.set_start(node),
            Mutation::SetWorldInfo { text } => {
                self.project.world_info = text.filter(|t| !t.trim().is_empty());
                self.events.push(ChangeEvent::WorldInfoChanged { version: 0 });
                Ok(())
            }
            Mutation::SetManualEmotionOverride { node, tag } => self.set_override(node, tag),
            Mutation::Batch { mutations } => {
                for m in mutations {
                    self.apply(m)?;
                }
                Ok(())
            }
        }
    }

    fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut Node> {
        self.project
            .nodes
            .get_mut(&id)
            .map(Arc::make_mut)
            .ok_or(GraphError::NodeNotFound(id))
    }

    fn check_speaker(&self, node: NodeId, speaker: &Option<CharacterId>) -> GraphResult<()> {
        match speaker {
            Some(s) if !self.project.characters.contains_key(s) => Err(GraphError::UnknownSpeaker {
                node,
                speaker: s.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn create_node(&mut self, mut node: Node) -> GraphResult<()> {
        let id = node.id;
        if self.project.has_node(id) {
            return Err(GraphError::DuplicateNode(id));
        }
        if !node.edges.is_empty() {
            return Err(GraphError::EdgesOnCreate(id));
        }
        self.check_speaker(id, &node.speaker)?;

        node.emotion = None;
        self.project.nodes.insert(id, Arc::new(node));
        self.events.push(ChangeEvent::NodeCreated { id, version: 0 });
        self.text_changed.insert(id);

        if self.project.start.is_none() {
            self.project.start = Some(id);
            self.events.push(ChangeEvent::StartChanged { id, version: 0 });
        }
        Ok(())
    }

    fn delete_node(&mut self, id: NodeId) -> GraphResult<()> {
        if !self.project.has_node(id) {
            return Err(GraphError::NodeNotFound(id));
        }
        if self.project.start == Some(id) {
            return Err(GraphError::StartNodeDeletion(id));
        }

        self.project.nodes.remove(&id);
        self.text_changed.remove(&id);

        let referrers: Vec<NodeId> = self
            .project
            .nodes
            .values()
            .filter(|n| n.edges.iter().any(|e| e.target == id))
            .map(|n| n.id)
            .collect();
        for source in referrers {
            self.node_mut(source)?.edges.retain(|e| e.target != id);
            self.events.push(ChangeEvent::EdgesChanged {
                id: source,
                version: 0,
            });
        }

        self.events.push(ChangeEvent::NodeDeleted { id, version: 0 });
        Ok(())
    }

    fn update_text(&mut self, id: NodeId, locale: Locale, text: String) -> GraphResult<()> {
        let primary = locale == self.project.default_locale;
        self.node_mut(id)?.text.insert(locale.clone(), text);
        if primary {
            self.text_changed.insert(id);
        }
        self.events.push(ChangeEvent::TextUpdated {
            id,
            locale,
            version: 0,
        });
        Ok(())
    }

    fn add_edge(&mut self, edge: Edge) -> GraphResult<()> {
        let source = self
            .project
            .node(edge.source)
            .ok_or(GraphError::NodeNotFound(edge.source))?;
        let target = self
            .project
            .node(edge.target)
            .ok_or(GraphError::DanglingEdgeTarget {
                from: edge.source,
                target: edge.target,
            })?;

        if source.edge(edge.order).is_some() {
            return Err(GraphError::DuplicateEdgeOrder {
                node: edge.source,
                order: edge.order,
            });
        }
        if let Some(max) = source.kind.max_out_degree() {
            if source.edges.len() >= max {
                return Err(GraphError::OutDegreeExceeded {
                    node: source.id,
                    kind: source.kind,
                });
            }
        }
        let jump_to_label = source.kind == NodeKind::Jump && target.kind == NodeKind::Label;
        if source.kind == NodeKind::Jump && !jump_to_label {
            return Err(GraphError::JumpTargetNotLabel {
                jump: edge.source,
                target: edge.target,
            });
        }
        if !jump_to_label && self.project.reaches_without_jumps(edge.target, edge.source) {
            return Err(GraphError::IllegalCycle {
                from: edge.source,
                to: edge.target,
            });
        }

        let id = edge.source;
        self.node_mut(id)?.insert_edge(edge);
        self.events.push(ChangeEvent::EdgesChanged { id, version: 0 });
        Ok(())
    }

    fn remove_edge(&mut self, source: NodeId, order: u32) -> GraphResult<()> {
        let node = self.node_mut(source)?;
        let before = node.edges.len();
        node.edges.retain(|e| e.order != order);
        if node.edges.len() == before {
            return Err(GraphError::EdgeNotFound { node: source, order });
        }
        self.events.push(ChangeEvent::EdgesChanged {
            id: source,
            version: 0,
        });
        Ok(())
    }

    fn reorder_edges(&mut self, source: NodeId, sequence: Vec<u32>) -> GraphResult<()> {
        let node = self.node_mut(source)?;

        let mut requested = sequence.clone();
        requested.sort_unstable();
        requested.dedup();
        let existing: Vec<u32> = node.edges.iter().map(|e| e.order).collect();
        if requested.len() != sequence.len() || requested != existing {
            return Err(GraphError::InvalidReorder { node: source });
        }

        let mut reordered = Vec::with_capacity(sequence.len());
        for (position, order) in sequence.iter().enumerate() {
            if let Some(edge) = node.edge(*order) {
                let mut edge = edge.clone();
                edge.order = position as u32;
                reordered.push(edge);
            }
        }
        node.edges = reordered;

        self.events.push(ChangeEvent::EdgesChanged {
            id: source,
            version: 0,
        });
        Ok(())
    }

    fn set_character(&mut self, character: Character) -> GraphResult<()> {
        if !character.id.is_valid() {
            return Err(GraphError::InvalidCharacterId(character.id));
        }
        let id = character.id.clone();
        self.project.characters.insert(id.clone(), character);
        self.events.push(ChangeEvent::CharacterChanged {
            character: id,
            removed: false,
            version: 0,
        });
        Ok(())
    }

    fn remove_character(&mut self, id: CharacterId) -> GraphResult<()> {
        if !self.project.characters.contains_key(&id) {
            return Err(GraphError::CharacterNotFound(id));
        }
        if let Some(node) = self
            .project
            .nodes
            .values()
            .find(|n| n.speaker.as_ref() == Some(&id))
        {
            return Err(GraphError::CharacterInUse {
                character: id,
                node: node.id,
            });
        }
        self.project.characters.remove(&id);
        self.events.push(ChangeEvent::CharacterChanged {
            character: id,
            removed: true,
            version: 0,
        });
        Ok(())
    }

    fn set_speaker(&mut self, id: NodeId, speaker: Option<CharacterId>) -> GraphResult<()> {
        self.check_speaker(id, &speaker)?;
        self.node_mut(id)?.speaker = speaker.clone();
        self.events.push(ChangeEvent::SpeakerChanged {
            id,
            speaker,
            version: 0,
        });
        Ok(())
    }

    fn set_assets(&mut self, id: NodeId, assets: Vec<AssetRef>) -> GraphResult<()> {
        self.node_mut(id)?.assets = assets;
        self.events.push(ChangeEvent::AssetsChanged { id, version: 0 });
        Ok(())
    }

    fn set_start(&mut self, id: NodeId) -> GraphResult<()> {
        if !self.project.has_node(id) {
            return Err(GraphError::NodeNotFound(id));
        }
        self.project.start = Some(id);
        self.events.push(ChangeEvent::StartChanged { id, version: 0 });
        Ok(())
    }

    fn set_override(&mut self, id: NodeId, tag: Option<EmotionTag>) -> GraphResult<()> {
        let tag = tag.map(|t| EmotionTag::new(t.category, t.confidence));
        self.node_mut(id)?.manual_override = tag;
        self.events.push(ChangeEvent::OverrideChanged {
            id,
            tag,
            version: 0,
        });
        Ok(())
    }
}
