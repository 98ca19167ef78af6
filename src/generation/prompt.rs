//! Prompt assembly and response parsing
//!
//! Context comes from the target node's ancestor chain: starting at the
//! target, follow the incoming edge with the smallest (source id, order)
//! until the start node, a node without predecessors, or a revisit.
//! Ancestors closest to the target are kept first until the character
//! budget is spent; the kept lines are then presented chronologically.
//! When even the nearest line does not fit, its ending is kept instead.

use super::{Draft, GenerationError, GenerationResult};
use crate::graph::{CharacterId, NodeId, NodeKind, Project};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const SYSTEM_PROMPT: &str =
    "You are the story-writing engine of a visual novel authoring assistant. \
     Write vivid, concise lines that fit the existing story.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    /// Ancestor nodes included as context, oldest first
    pub context: Vec<NodeId>,
}

/// Ancestors of `target` that fit into `window` characters, oldest first
pub fn ancestor_chain(project: &Project, target: NodeId, window: usize) -> Vec<NodeId> {
    let mut visited = BTreeSet::from([target]);
    let mut chain = Vec::new();
    let mut used = 0usize;
    let mut current = target;

    while project.start != Some(current) {
        let Some(edge) = project
            .incoming(current)
            .into_iter()
            .min_by_key(|e| (e.source, e.order))
        else {
            break;
        };
        let parent = edge.source;
        if !visited.insert(parent) {
            break;
        }

        let cost = render_line(project, parent).chars().count();
        if used + cost > window {
            if chain.is_empty() && window > 0 {
                chain.push(parent);
            }
            break;
        }
        used += cost;
        chain.push(parent);
        current = parent;
    }

    chain.reverse();
    chain
}

fn render_line(project: &Project, id: NodeId) -> String {
    let Some(node) = project.node(id) else {
        return String::new();
    };
    let text = node.text_for(&project.default_locale);
    match node.kind {
        NodeKind::Dialogue => {
            let name = node
                .speaker
                .as_ref()
                .and_then(|s| project.character(s))
                .map(|c| c.name.as_str())
                .unwrap_or("Narrator");
            format!("{}: \"{}\"", name, text)
        }
        NodeKind::ChoicePoint => {
            let options: Vec<&str> = node
                .edges
                .iter()
                .filter_map(|e| e.label.as_deref())
                .collect();
            format!("[Choice] {} ({})", text, options.join(" / "))
        }
        NodeKind::Label => format!("[Scene] {}", text),
        NodeKind::Jump => format!("[Jump] {}", text),
        NodeKind::Narration => text.to_string(),
    }
}

/// Keep the last `budget` characters of `line`
fn clip_front(line: &str, budget: usize) -> String {
    let len = line.chars().count();
    if len <= budget {
        return line.to_string();
    }
    let keep = budget.saturating_sub(3);
    let tail: String = line.chars().skip(len - keep).collect();
    format!("...{}", tail)
}

/// Assemble the prompt for generating text at `target`
pub fn build_prompt(project: &Project, target: NodeId, instruction: &str, window: usize) -> Prompt {
    let context = ancestor_chain(project, target, window);
    let mut user = String::new();

    if let Some(world) = project.world_info.as_deref().map(str::trim).filter(|w| !w.is_empty()) {
        user.push_str("## World\n");
        user.push_str(world);
        user.push_str("\n\n");
    }

    let target_node = project.node(target);
    let speaker = target_node
        .and_then(|n| n.speaker.as_ref())
        .and_then(|s| project.character(s));

    if let Some(character) = speaker {
        user.push_str("## Speaker\n");
        user.push_str(&format!("- {} ({})", character.name, character.id));
        let hints = &character.hints;
        for (key, value) in [("sprite", &hints.sprite), ("voice", &hints.voice), ("color", &hints.color)] {
            if let Some(v) = value {
                user.push_str(&format!(", {}: {}", key, v));
            }
        }
        if let Some(description) = &character.description {
            user.push_str(&format!("\n  {}", description.trim()));
        }
        user.push_str("\n\n");
    }

    // Everyone else who speaks in the included context
    let others: BTreeSet<&CharacterId> = context
        .iter()
        .filter_map(|id| project.node(*id)?.speaker.as_ref())
        .filter(|id| speaker.map_or(true, |s| s.id != **id))
        .collect();
    if !others.is_empty() {
        user.push_str("## Characters\n");
        for character in others.into_iter().filter_map(|id| project.character(id)) {
            match &character.description {
                Some(description) => {
                    user.push_str(&format!("- {}: {}\n", character.name, description.trim()))
                }
                None => user.push_str(&format!("- {}\n", character.name)),
            }
        }
        user.push('\n');
    }

    user.push_str("## Story so far\n");
    if context.is_empty() {
        user.push_str("(this is the beginning of the story)\n");
    }
    for id in &context {
        user.push_str(&clip_front(&render_line(project, *id), window));
        user.push('\n');
    }

    if let Some(node) = target_node {
        user.push_str(&format!("\n## Current line ({})\n", node.kind.as_str()));
        let current = node.text_for(&project.default_locale);
        if current.is_empty() {
            user.push_str("(empty)\n");
        } else {
            user.push_str(current);
            user.push('\n');
        }
    }

    user.push_str("\n## Instruction\n");
    user.push_str(instruction.trim());
    user.push_str(
        "\n\nReply strictly in this JSON format, with no commentary:\n\
         ```json\n{\"story_text\": \"<text for the current line>\", \"suggestions\": [\"<follow-up idea>\"]}\n```\n",
    );

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        context,
    }
}

#[derive(Deserialize)]
struct StoryResponse {
    story_text: String,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Extract a draft from raw model output.
///
/// Accepts a bare JSON object, JSON inside a markdown fence, or plain
/// prose. Output that looks like JSON but does not parse is malformed.
pub fn parse_story_response(raw: &str) -> GenerationResult<Draft> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::Permanent("empty response".to_string()));
    }

    let candidate = extract_fenced(trimmed).unwrap_or(trimmed);
    let draft = match serde_json::from_str::<StoryResponse>(candidate) {
        Ok(parsed) => Draft {
            text: parsed.story_text.trim().to_string(),
            suggestions: parsed.suggestions,
        },
        Err(e) if candidate.starts_with('{') || candidate.starts_with('[') => {
            return Err(GenerationError::Permanent(format!("malformed response: {}", e)));
        }
        Err(_) => Draft {
            text: candidate.to_string(),
            suggestions: Vec::new(),
        },
    };

    if draft.text.is_empty() {
        return Err(GenerationError::Permanent("response has no story text".to_string()));
    }
    Ok(draft)
}

/// Body of the first fenced code block, if any
fn extract_fenced(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip the language tag (e.g. "json\n")
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let end = after_fence[body_start..].find("```")?;
    Some(after_fence[body_start..body_start + end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Character, Edge, Node};
    use std::sync::Arc;

    fn line(project: &mut Project, id: u64, kind: NodeKind, text: &str) {
        let node = Node::new(NodeId::new(id), kind).with_text("en", text);
        project.nodes.insert(NodeId::new(id), Arc::new(node));
    }

    fn link(project: &mut Project, from: u64, to: u64, order: u32) {
        let node = project.nodes.get_mut(&NodeId::new(from)).unwrap();
        Arc::make_mut(node).insert_edge(Edge::new(NodeId::new(from), NodeId::new(to), order));
    }

    fn story() -> Project {
        let mut project = Project::new("story");
        line(&mut project, 0, NodeKind::Narration, "Rain hammers the cafe window.");
        line(&mut project, 1, NodeKind::Dialogue, "You came back.");
        line(&mut project, 2, NodeKind::Narration, "She does not look up.");
        line(&mut project, 3, NodeKind::Dialogue, "");
        link(&mut project, 0, 1, 0);
        link(&mut project, 1, 2, 0);
        link(&mut project, 2, 3, 0);
        project.characters.insert("yuko".into(), Character::new("yuko", "Yuko").with_sprite("yuko"));
        Arc::make_mut(project.nodes.get_mut(&NodeId::new(1)).unwrap()).speaker = Some("yuko".into());
        Arc::make_mut(project.nodes.get_mut(&NodeId::new(3)).unwrap()).speaker = Some("yuko".into());
        project.start = Some(NodeId::new(0));
        project
    }

    #[test]
    fn test_chain_is_chronological() {
        let chain = ancestor_chain(&story(), NodeId::new(3), 10_000);
        assert_eq!(chain, vec![NodeId::new(0), NodeId::new(1), NodeId::new(2)]);
    }

    #[test]
    fn test_window_keeps_nearest() {
        let project = story();
        let budget = render_line(&project, NodeId::new(2)).chars().count()
            + render_line(&project, NodeId::new(1)).chars().count();
        let chain = ancestor_chain(&project, NodeId::new(3), budget);
        assert_eq!(chain, vec![NodeId::new(1), NodeId::new(2)]);

        assert!(ancestor_chain(&project, NodeId::new(3), 0).is_empty());
    }

    #[test]
    fn test_oversized_nearest_line_is_clipped() {
        let project = story();
        assert_eq!(ancestor_chain(&project, NodeId::new(3), 12), vec![NodeId::new(2)]);

        let prompt = build_prompt(&project, NodeId::new(3), "x", 12);
        assert_eq!(prompt.context, vec![NodeId::new(2)]);
        assert!(prompt.user.contains("... look up.\n"));
        assert!(!prompt.user.contains("She does"));
        assert!(!prompt.user.contains("beginning of the story"));
    }

    #[test]
    fn test_prompt_includes_world_and_descriptions() {
        let mut project = story().with_world_info("A seaside town where it always rains.");
        project.characters.insert(
            "yuko".into(),
            Character::new("yuko", "Yuko")
                .with_sprite("yuko")
                .with_description("Quiet barista who keeps everyone at arm's length."),
        );
        project.characters.insert(
            "mc".into(),
            Character::new("mc", "Ren").with_description("Returned after five years away."),
        );
        Arc::make_mut(project.nodes.get_mut(&NodeId::new(1)).unwrap()).speaker = Some("mc".into());

        let prompt = build_prompt(&project, NodeId::new(3), "Continue", 10_000);
        assert!(prompt.user.contains("## World\nA seaside town where it always rains."));
        assert!(prompt.user.contains("Quiet barista who keeps everyone at arm's length."));
        assert!(prompt.user.contains("## Characters\n- Ren: Returned after five years away."));
        // The speaker is not repeated among the other characters
        assert!(!prompt.user.contains("- Yuko:"));
    }

    #[test]
    fn test_chain_picks_smallest_predecessor() {
        let mut project = story();
        line(&mut project, 9, NodeKind::Narration, "A side path.");
        link(&mut project, 9, 3, 0);
        let chain = ancestor_chain(&project, NodeId::new(3), 10_000);
        assert_eq!(chain.last(), Some(&NodeId::new(2)));
    }

    #[test]
    fn test_prompt_contents() {
        let prompt = build_prompt(&story(), NodeId::new(3), "Make her hesitant", 10_000);
        assert!(prompt.user.contains("Yuko (yuko), sprite: yuko"));
        assert!(prompt.user.contains("Yuko: \"You came back.\""));
        assert!(prompt.user.contains("Make her hesitant"));
        assert!(prompt.user.contains("story_text"));
        assert_eq!(prompt.context.len(), 3);
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let a = build_prompt(&story(), NodeId::new(3), "x", 100);
        let b = build_prompt(&story(), NodeId::new(3), "x", 100);
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_json_response() {
        let draft = parse_story_response(r#"{"story_text": "Hi.", "suggestions": ["Leave"]}"#).unwrap();
        assert_eq!(draft.text, "Hi.");
        assert_eq!(draft.suggestions, vec!["Leave".to_string()]);
    }

    #[test]
    fn test_parse_fenced_response() {
        let raw = "Sure!\n```json\n{\"story_text\": \"The bell rings.\"}\n```\nEnjoy.";
        assert_eq!(parse_story_response(raw).unwrap().text, "The bell rings.");
    }

    #[test]
    fn test_parse_plain_text() {
        assert_eq!(parse_story_response("  Just prose. ").unwrap().text, "Just prose.");
    }

    #[test]
    fn test_parse_rejects_empty_and_malformed() {
        assert!(matches!(parse_story_response("   "), Err(GenerationError::Permanent(_))));
        assert!(matches!(
            parse_story_response("{\"story_text\": "),
            Err(GenerationError::Permanent(_))
        ));
        assert!(matches!(
            parse_story_response("{\"story_text\": \"  \"}"),
            Err(GenerationError::Permanent(_))
        ));
    }
}
