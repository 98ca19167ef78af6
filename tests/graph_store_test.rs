//! Integration tests for the graph store
//!
//! Exercises the mutation API end to end: rule enforcement, atomic
//! rejection, snapshot isolation, change notification and the emotion
//! tags kept in step with node text.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use vnova::emotion::{
    ClassificationError, ClassificationResult, ClassifierConfig, EmotionClassifier, EmotionScorer,
    ScoreVector,
};
use vnova::graph::{
    validate_project, Character, ChangeEvent, Edge, GraphError, GraphStore, Mutation, Node, NodeId,
    NodeKind, Project,
};
use vnova::EmotionCategory;

/// Scorer with canned answers that counts its calls
#[derive(Default)]
struct ScriptedScorer {
    answers: HashMap<String, ScoreVector>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl ScriptedScorer {
    fn with(mut self, text: &str, scores: &[(EmotionCategory, f32)]) -> Self {
        self.answers.insert(text.to_string(), scores.iter().copied().collect());
        self
    }
}

#[async_trait]
impl EmotionScorer for ScriptedScorer {
    async fn score(&self, text: &str) -> ClassificationResult<ScoreVector> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClassificationError::Network("connection refused".to_string()));
        }
        Ok(self
            .answers
            .get(text)
            .cloned()
            .unwrap_or_else(|| [(EmotionCategory::Neutral, 0.9)].into_iter().collect()))
    }
}

fn sad_scorer() -> ScriptedScorer {
    ScriptedScorer::default().with(
        "I failed everything",
        &[
            (EmotionCategory::Sadness, 0.81),
            (EmotionCategory::Anger, 0.10),
            (EmotionCategory::Neutral, 0.05),
            (EmotionCategory::Joy, 0.02),
            (EmotionCategory::Fear, 0.01),
            (EmotionCategory::Surprise, 0.01),
        ],
    )
}

async fn classified_store(scorer: Arc<ScriptedScorer>) -> GraphStore {
    let classifier = Arc::new(EmotionClassifier::new(scorer, ClassifierConfig::default()));
    GraphStore::with_classifier(Project::new("test"), classifier)
        .await
        .unwrap()
}

fn line(id: u64, kind: NodeKind, text: &str) -> Mutation {
    Mutation::create_node(Node::new(NodeId::new(id), kind).with_text("en", text))
}

fn link(from: u64, to: u64, order: u32) -> Mutation {
    Mutation::add_edge(Edge::new(NodeId::new(from), NodeId::new(to), order))
}

/// start(0) -> 1 -> choice(2) -> {3, 4}
async fn branching_store() -> GraphStore {
    let store = GraphStore::new(Project::new("branching")).unwrap();
    store
        .apply(Mutation::batch([
            line(0, NodeKind::Narration, "Rain."),
            line(1, NodeKind::Dialogue, "Hello"),
            line(2, NodeKind::ChoicePoint, "Which way?"),
            line(3, NodeKind::Narration, "Left."),
            line(4, NodeKind::Narration, "Right."),
            link(0, 1, 0),
            link(1, 2, 0),
            Mutation::add_edge(Edge::choice(NodeId::new(2), NodeId::new(3), "Go left", 0)),
            Mutation::add_edge(Edge::choice(NodeId::new(2), NodeId::new(4), "Go right", 1)),
        ]))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_sad_text_gets_sadness_tag() {
    let store = classified_store(Arc::new(sad_scorer())).await;
    let snapshot = store
        .apply(line(0, NodeKind::Dialogue, "I failed everything"))
        .await
        .unwrap();

    let tag = snapshot.node(NodeId::new(0)).unwrap().effective_emotion().copied().unwrap();
    assert_eq!(tag.category, EmotionCategory::Sadness);
    assert!((tag.confidence - 0.81).abs() < 1e-6);
}

#[tokio::test]
async fn test_edge_to_missing_node_is_rejected() {
    let store = branching_store().await;
    let before = store.snapshot();

    let err = store.apply(link(4, 99, 0)).await.unwrap_err();
    assert_eq!(
        err,
        GraphError::DanglingEdgeTarget {
            from: NodeId::new(4),
            target: NodeId::new(99)
        }
    );
    assert!(err.to_string().contains("99"));

    let after = store.snapshot();
    assert!(after.ptr_eq(&before));
    assert_eq!(after.content_hash(), before.content_hash());
}

#[tokio::test]
async fn test_rejected_mutations_leave_store_identical() {
    let store = branching_store().await;
    let hash = store.snapshot().content_hash();
    let version = store.snapshot().schema_version();

    let bad = vec![
        line(1, NodeKind::Narration, "duplicate id"),
        link(1, 3, 1),
        link(4, 0, 0),
        Mutation::DeleteNode { id: NodeId::new(0) },
        Mutation::RemoveEdge {
            source: NodeId::new(2),
            order: 7,
        },
        Mutation::ReorderEdges {
            source: NodeId::new(2),
            sequence: vec![0, 0],
        },
        Mutation::SetSpeaker {
            node: NodeId::new(1),
            speaker: Some("ghost".into()),
        },
        Mutation::batch([line(10, NodeKind::Narration, "fine"), link(10, 42, 0)]),
    ];

    for mutation in bad {
        let name = mutation.name();
        assert!(store.apply(mutation).await.is_err(), "{} should be rejected", name);
        assert_eq!(store.snapshot().content_hash(), hash, "{} changed the store", name);
        assert_eq!(store.snapshot().schema_version(), version);
    }
}

#[tokio::test]
async fn test_invariants_hold_after_mixed_sequence() {
    let store = branching_store().await;
    let mutations = vec![
        line(5, NodeKind::Label, "Chapter 2"),
        line(6, NodeKind::Jump, ""),
        link(3, 6, 0),
        Mutation::add_edge(Edge::new(NodeId::new(6), NodeId::new(5), 0)),
        link(5, 1, 0),
        link(4, 4, 0),
        Mutation::DeleteNode { id: NodeId::new(3) },
        Mutation::set_character(Character::new("yuko", "Yuko")),
        Mutation::SetSpeaker {
            node: NodeId::new(1),
            speaker: Some("yuko".into()),
        },
        Mutation::RemoveCharacter { id: "yuko".into() },
    ];

    let mut last_version = store.snapshot().schema_version();
    for mutation in mutations {
        let _ = store.apply(mutation).await;
        let snapshot = store.snapshot();
        assert!(snapshot.schema_version() >= last_version);
        last_version = snapshot.schema_version();

        validate_project(&snapshot).unwrap();
        for node in snapshot.nodes.values() {
            for edge in &node.edges {
                assert!(snapshot.has_node(edge.target));
            }
        }
    }

    let snapshot = store.snapshot();
    assert!(!snapshot.has_node(NodeId::new(3)));
    assert!(snapshot.incoming(NodeId::new(3)).is_empty());
    assert!(snapshot.character(&"yuko".into()).is_some());
}

#[tokio::test]
async fn test_old_snapshots_are_isolated() {
    let store = branching_store().await;
    let old = store.snapshot();

    store
        .apply(Mutation::update_text(NodeId::new(1), "en", "Goodbye"))
        .await
        .unwrap();

    assert_eq!(old.primary_text(NodeId::new(1)), "Hello");
    assert_eq!(store.snapshot().primary_text(NodeId::new(1)), "Goodbye");
    assert_eq!(store.snapshot().schema_version(), old.schema_version() + 1);
}

#[tokio::test]
async fn test_concurrent_writers_are_serialised() {
    let store = Arc::new(GraphStore::new(Project::new("concurrent")).unwrap());
    let mut handles = Vec::new();
    for id in 0..32u64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.apply(line(id, NodeKind::Narration, "tick")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let snapshot = store.snapshot();
    assert_eq!(snapshot.node_count(), 32);
    assert_eq!(snapshot.schema_version(), 32);
}

#[tokio::test]
async fn test_subscribe_delivers_node_events_in_order() {
    let store = classified_store(Arc::new(sad_scorer())).await;
    store
        .apply(Mutation::batch([
            line(0, NodeKind::Narration, "Start"),
            line(1, NodeKind::Dialogue, "Fine."),
        ]))
        .await
        .unwrap();

    let mut events = store.subscribe(NodeId::new(1));
    store
        .apply(Mutation::update_text(NodeId::new(0), "en", "Elsewhere"))
        .await
        .unwrap();
    store
        .apply(Mutation::update_text(NodeId::new(1), "en", "I failed everything"))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, ChangeEvent::TextUpdated { id, .. } if id == NodeId::new(1)));

    let second = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    match second {
        ChangeEvent::EmotionUpdated { id, tag, version } => {
            assert_eq!(id, NodeId::new(1));
            assert_eq!(tag.map(|t| t.category), Some(EmotionCategory::Sadness));
            assert_eq!(version, store.snapshot().schema_version());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_identical_text_is_scored_once() {
    let scorer = Arc::new(sad_scorer());
    let store = classified_store(scorer.clone()).await;

    store
        .apply(line(0, NodeKind::Dialogue, "I failed everything"))
        .await
        .unwrap();
    store
        .apply(line(1, NodeKind::Dialogue, "I failed everything"))
        .await
        .unwrap();

    assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
    let snapshot = store.snapshot();
    assert_eq!(
        snapshot.node(NodeId::new(1)).unwrap().effective_emotion().map(|t| t.category),
        Some(EmotionCategory::Sadness)
    );
}

#[tokio::test]
async fn test_other_locales_do_not_reclassify() {
    let scorer = Arc::new(sad_scorer());
    let store = classified_store(scorer.clone()).await;
    store
        .apply(line(0, NodeKind::Dialogue, "I failed everything"))
        .await
        .unwrap();
    let calls = scorer.calls.load(Ordering::SeqCst);

    store
        .apply(Mutation::update_text(NodeId::new(0), "ja", "全部だめだった"))
        .await
        .unwrap();

    assert_eq!(scorer.calls.load(Ordering::SeqCst), calls);
    assert!(store.snapshot().stale_emotions().is_empty());
}

#[tokio::test]
async fn test_failed_classification_keeps_previous_tag() {
    let scorer = Arc::new(sad_scorer());
    let store = classified_store(scorer.clone()).await;
    store
        .apply(line(0, NodeKind::Dialogue, "I failed everything"))
        .await
        .unwrap();

    scorer.failing.store(true, Ordering::SeqCst);
    let mut events = store.subscribe(NodeId::new(0));
    let snapshot = store
        .apply(Mutation::update_text(NodeId::new(0), "en", "Something new"))
        .await
        .unwrap();

    // The edit itself is committed; the old tag survives and is flagged stale
    assert_eq!(snapshot.primary_text(NodeId::new(0)), "Something new");
    let node = snapshot.node(NodeId::new(0)).unwrap();
    assert_eq!(node.effective_emotion().map(|t| t.category), Some(EmotionCategory::Sadness));
    assert_eq!(snapshot.stale_emotions(), vec![NodeId::new(0)]);

    let _text = events.next().await.unwrap();
    let failure = events.next().await.unwrap();
    assert!(matches!(failure, ChangeEvent::ClassificationFailed { .. }));

    scorer.failing.store(false, Ordering::SeqCst);
    assert_eq!(store.reclassify_stale().await, 1);
    // Refreshing tags is not a mutation
    assert_eq!(store.snapshot().schema_version(), snapshot.schema_version());
    let node = store.snapshot().node(NodeId::new(0)).cloned().unwrap();
    assert_eq!(node.effective_emotion().map(|t| t.category), Some(EmotionCategory::Neutral));
    assert!(store.snapshot().stale_emotions().is_empty());
}

#[tokio::test]
async fn test_manual_override_wins_and_survives_text_edits() {
    let store = classified_store(Arc::new(sad_scorer())).await;
    store
        .apply(line(0, NodeKind::Dialogue, "I failed everything"))
        .await
        .unwrap();
    store
        .apply(Mutation::SetManualEmotionOverride {
            node: NodeId::new(0),
            tag: Some(vnova::EmotionTag::new(EmotionCategory::Anger, 1.0)),
        })
        .await
        .unwrap();
    let snapshot = store
        .apply(Mutation::update_text(NodeId::new(0), "en", "Whatever."))
        .await
        .unwrap();

    let node = snapshot.node(NodeId::new(0)).unwrap();
    assert_eq!(node.effective_emotion().map(|t| t.category), Some(EmotionCategory::Anger));
    assert_eq!(
        node.emotion.as_ref().map(|d| d.tag.category),
        Some(EmotionCategory::Neutral)
    );
}

#[tokio::test]
async fn test_jump_back_to_label_is_allowed() {
    let store = GraphStore::new(Project::new("loop")).unwrap();
    store
        .apply(Mutation::batch([
            line(0, NodeKind::Label, "Morning"),
            line(1, NodeKind::Narration, "Another day."),
            line(2, NodeKind::Jump, ""),
            link(0, 1, 0),
            link(1, 2, 0),
            link(2, 0, 0),
        ]))
        .await
        .unwrap();

    // A plain edge closing the same loop is not
    let err = store.apply(link(1, 0, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        GraphError::OutDegreeExceeded { .. } | GraphError::IllegalCycle { .. }
    ));
}
