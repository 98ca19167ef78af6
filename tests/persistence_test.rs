//! Crash-recovery tests: project file plus mutation journal

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use vnova::emotion::{
    ClassificationError, ClassificationResult, ClassifierConfig, EmotionClassifier, EmotionScorer,
    ScoreVector,
};
use vnova::graph::{Edge, GraphStore, Mutation, Node, NodeId, NodeKind, Project};
use vnova::persistence::{self, Journal};
use vnova::EmotionCategory;

fn narration(id: u64, text: &str) -> Mutation {
    Mutation::create_node(Node::new(NodeId::new(id), NodeKind::Narration).with_text("en", text))
}

/// Apply and journal, the way an editor session would
async fn commit(store: &GraphStore, journal: &mut Journal, mutation: Mutation) {
    let snapshot = store.apply(mutation.clone()).await.unwrap();
    journal.append(&mutation, &snapshot).unwrap();
}

#[tokio::test]
async fn test_recover_from_save_plus_journal() {
    let dir = TempDir::new().unwrap();
    let project_path = dir.path().join("story.vnova.json");
    let journal_path = dir.path().join("story.journal");

    let store = GraphStore::new(Project::new("Recovery")).unwrap();
    let mut journal = Journal::open(&journal_path).unwrap();

    commit(&store, &mut journal, narration(0, "Rain.")).await;
    persistence::save(store.snapshot().project(), &project_path).unwrap();
    journal.truncate().unwrap();

    commit(&store, &mut journal, narration(1, "Thunder.")).await;
    commit(&store, &mut journal, Mutation::add_edge(Edge::new(NodeId::new(0), NodeId::new(1), 0))).await;
    commit(
        &store,
        &mut journal,
        Mutation::update_text(NodeId::new(1), "en", "Distant thunder."),
    )
    .await;
    let live = store.snapshot();
    drop(journal);

    // Restart
    let recovered = GraphStore::new(persistence::load(&project_path).unwrap()).unwrap();
    assert_eq!(recovered.snapshot().schema_version(), 1);
    let journal = Journal::open(&journal_path).unwrap();
    assert_eq!(journal.replay(&recovered).await.unwrap(), 3);

    let restored = recovered.snapshot();
    assert_eq!(restored.schema_version(), live.schema_version());
    assert_eq!(restored.content_hash(), live.content_hash());
    assert_eq!(restored.primary_text(NodeId::new(1)), "Distant thunder.");
}

#[tokio::test]
async fn test_replay_skips_entries_already_saved() {
    let dir = TempDir::new().unwrap();
    let project_path = dir.path().join("story.vnova.json");
    let journal_path = dir.path().join("story.journal");

    let store = GraphStore::new(Project::new("Recovery")).unwrap();
    let mut journal = Journal::open(&journal_path).unwrap();
    commit(&store, &mut journal, narration(0, "Rain.")).await;
    commit(&store, &mut journal, narration(1, "Thunder.")).await;

    // Saved without truncating the journal
    persistence::save(store.snapshot().project(), &project_path).unwrap();
    drop(journal);

    let recovered = GraphStore::new(persistence::load(&project_path).unwrap()).unwrap();
    let journal = Journal::open(&journal_path).unwrap();
    assert_eq!(journal.replay(&recovered).await.unwrap(), 0);
    assert_eq!(recovered.snapshot().content_hash(), store.snapshot().content_hash());
}

#[tokio::test]
async fn test_torn_final_entry_is_ignored() {
    let dir = TempDir::new().unwrap();
    let journal_path = dir.path().join("story.journal");

    let store = GraphStore::new(Project::new("Recovery")).unwrap();
    let mut journal = Journal::open(&journal_path).unwrap();
    commit(&store, &mut journal, narration(0, "Rain.")).await;
    drop(journal);

    // Simulate a crash halfway through writing the next record
    let mut file = OpenOptions::new().append(true).open(&journal_path).unwrap();
    file.write_all(b"{\"sequence\": 2, \"version\": 2, \"mutat").unwrap();
    drop(file);

    let fresh = GraphStore::new(Project::new("Recovery")).unwrap();
    let journal = Journal::open(&journal_path).unwrap();
    assert_eq!(journal.sequence(), 1);
    assert_eq!(journal.replay(&fresh).await.unwrap(), 1);
    assert_eq!(fresh.snapshot().node_count(), 1);
}

#[tokio::test]
async fn test_appends_after_torn_entry_survive_restarts() {
    let dir = TempDir::new().unwrap();
    let journal_path = dir.path().join("story.journal");

    let store = GraphStore::new(Project::new("Recovery")).unwrap();
    let mut journal = Journal::open(&journal_path).unwrap();
    commit(&store, &mut journal, narration(0, "Rain.")).await;
    drop(journal);

    let mut file = OpenOptions::new().append(true).open(&journal_path).unwrap();
    file.write_all(b"{\"sequence\": 2, \"vers").unwrap();
    drop(file);

    // The session carries on after recovery and keeps journaling
    let mut journal = Journal::open(&journal_path).unwrap();
    commit(&store, &mut journal, narration(1, "Thunder.")).await;
    commit(&store, &mut journal, Mutation::add_edge(Edge::new(NodeId::new(0), NodeId::new(1), 0))).await;
    drop(journal);

    let journal = Journal::open(&journal_path).unwrap();
    assert_eq!(journal.sequence(), 3);
    let fresh = GraphStore::new(Project::new("Recovery")).unwrap();
    assert_eq!(journal.replay(&fresh).await.unwrap(), 3);
    assert_eq!(fresh.snapshot().content_hash(), store.snapshot().content_hash());
}

/// Scorer that can be switched off to simulate an unreachable endpoint
#[derive(Default)]
struct SwitchableScorer {
    down: AtomicBool,
}

#[async_trait]
impl EmotionScorer for SwitchableScorer {
    async fn score(&self, _text: &str) -> ClassificationResult<ScoreVector> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ClassificationError::Network("connection refused".to_string()));
        }
        Ok([(EmotionCategory::Joy, 0.9)].into_iter().collect())
    }
}

#[tokio::test]
async fn test_reclassification_on_open_does_not_hide_journal_entries() {
    let dir = TempDir::new().unwrap();
    let project_path = dir.path().join("story.vnova.json");
    let journal_path = dir.path().join("story.journal");

    let scorer = Arc::new(SwitchableScorer::default());
    let classifier = Arc::new(EmotionClassifier::new(scorer.clone(), ClassifierConfig::default()));
    let store = GraphStore::with_classifier(Project::new("Recovery"), classifier)
        .await
        .unwrap();
    let mut journal = Journal::open(&journal_path).unwrap();

    // Saved while node 0 still carries no tag
    scorer.down.store(true, Ordering::SeqCst);
    commit(&store, &mut journal, narration(0, "Rain.")).await;
    assert!(store.snapshot().node(NodeId::new(0)).unwrap().emotion.is_none());
    persistence::save(store.snapshot().project(), &project_path).unwrap();
    journal.truncate().unwrap();
    commit(&store, &mut journal, narration(1, "Thunder.")).await;
    drop(journal);

    // Restart with the scorer reachable again
    scorer.down.store(false, Ordering::SeqCst);
    let classifier = Arc::new(EmotionClassifier::new(scorer, ClassifierConfig::default()));
    let recovered = GraphStore::with_classifier(persistence::load(&project_path).unwrap(), classifier)
        .await
        .unwrap();
    assert!(recovered.snapshot().node(NodeId::new(0)).unwrap().emotion.is_some());

    let journal = Journal::open(&journal_path).unwrap();
    assert_eq!(journal.replay(&recovered).await.unwrap(), 1);
    assert!(recovered.snapshot().has_node(NodeId::new(1)));
    assert_eq!(recovered.snapshot().schema_version(), store.snapshot().schema_version());
}
