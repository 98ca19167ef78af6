use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vnova::emotion::{ClassificationResult, EmotionScorer, ScoreVector};
use vnova::export::MapAssetResolver;
use vnova::graph::{Character, Edge, Mutation, Node, NodeId, NodeKind};
use vnova::{EmotionCategory, EmotionClassifier, EngineConfig, Exporter, GraphStore, Project};

/// Offline scorer for the demo: looks for a few tell-tale words
struct KeywordScorer;

#[async_trait]
impl EmotionScorer for KeywordScorer {
    async fn score(&self, text: &str) -> ClassificationResult<ScoreVector> {
        let lower = text.to_lowercase();
        let mut scores = ScoreVector::new();
        let hits = [
            (EmotionCategory::Joy, ["glad", "smile", "love"]),
            (EmotionCategory::Sadness, ["sorry", "alone", "tears"]),
            (EmotionCategory::Fear, ["dark", "afraid", "run"]),
        ];
        for (category, words) in hits {
            let count = words.iter().filter(|w| lower.contains(*w)).count();
            scores.insert(category, count as f32 / 2.0);
        }
        scores.insert(EmotionCategory::Neutral, 0.2);
        Ok(scores)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("vnova narrative engine v{}", vnova::version());
    println!("==========================================");
    println!();

    let config = EngineConfig::default();
    let classifier = Arc::new(EmotionClassifier::new(Arc::new(KeywordScorer), config.classifier));
    let store = GraphStore::with_classifier(Project::new("Rainy Cafe"), classifier).await?;

    demo_story(&store).await?;

    let snapshot = store.snapshot();
    println!("\nStory Statistics:");
    println!("  Nodes: {}", snapshot.node_count());
    println!("  Edges: {}", snapshot.edge_count());
    println!("  Version: {}", snapshot.schema_version());
    for node in snapshot.nodes.values() {
        if let Some(tag) = node.effective_emotion() {
            println!("  {} -> {}", node.id, tag);
        }
    }

    if let Some(target) = std::env::args().nth(1).map(PathBuf::from) {
        let manifest = Exporter::new(Arc::new(MapAssetResolver::new())).export(&snapshot, &target)?;
        println!("\nExported {} files to {}", manifest.files.len(), target.display());
    } else {
        println!("\nPass a directory to export the demo story as a Ren'Py project.");
    }
    Ok(())
}

async fn demo_story(store: &GraphStore) -> anyhow::Result<()> {
    println!("=== Building a branching story ===");
    store
        .apply(Mutation::set_character(
            Character::new("yuko", "Yuko").with_color("#ffaacc"),
        ))
        .await?;

    let lines = [
        (0, NodeKind::Narration, "Rain hammers the cafe window."),
        (1, NodeKind::Dialogue, "I'm glad you came. I was afraid you wouldn't."),
        (2, NodeKind::ChoicePoint, "What do you say?"),
        (3, NodeKind::Dialogue, "You smile back at her."),
        (4, NodeKind::Dialogue, "I'm sorry. I left you alone."),
    ];
    let mut batch = Vec::new();
    for (id, kind, text) in lines {
        let mut node = Node::new(NodeId::new(id), kind).with_text("en", text);
        if kind == NodeKind::Dialogue {
            node = node.with_speaker("yuko");
        }
        batch.push(Mutation::create_node(node));
    }
    batch.push(Mutation::add_edge(Edge::new(NodeId::new(0), NodeId::new(1), 0)));
    batch.push(Mutation::add_edge(Edge::new(NodeId::new(1), NodeId::new(2), 0)));
    batch.push(Mutation::add_edge(Edge::choice(NodeId::new(2), NodeId::new(3), "Smile", 0)));
    batch.push(Mutation::add_edge(Edge::choice(NodeId::new(2), NodeId::new(4), "Apologise", 1)));

    let snapshot = store.apply(Mutation::batch(batch)).await?;
    println!("✓ Committed {} nodes in one batch", snapshot.node_count());
    Ok(())
}
