//! Re-import of exported projects
//!
//! Reads the marker comments, say statements, menus and jumps the
//! export compiler writes and rebuilds the narrative graph. Edge order
//! indices are renumbered from 0, so relative order survives but the
//! original indices do not. Derived emotions are not carried over; they
//! are recomputed when the project is loaded into a store.

use super::renpy::{parse_asset_kind, parse_quoted, unescape_comment, DEFAULT_COLOR, MARKER};
use super::{ExportManifest, MANIFEST_FILE};
use crate::graph::{
    validate_project, AssetRef, Character, CharacterId, Edge, GraphError, Locale, Node, NodeId,
    NodeKind, Project,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("Imported graph is invalid: {0}")]
    Graph(#[from] GraphError),

    #[error("Invalid manifest: {0}")]
    Manifest(String),
}

pub type ImportResult<T> = Result<T, ImportError>;

fn parse_error(file: &str, line: usize, message: impl Into<String>) -> ImportError {
    ImportError::Parse {
        file: file.to_string(),
        line,
        message: message.into(),
    }
}

/// Rebuild a project from a directory written by the export compiler
pub fn import_project(dir: &Path) -> ImportResult<Project> {
    let game = dir.join("game");
    let script = fs::read_to_string(game.join("script.rpy"))?;
    let characters = fs::read_to_string(game.join("characters.rpy"))?;
    let options = fs::read_to_string(game.join("options.rpy"))?;

    let mut project = Project::new(parse_title(&options).unwrap_or_default());
    project.world_info = parse_world(&options);
    for character in parse_characters(&characters)? {
        project.characters.insert(character.id.clone(), character);
    }

    let reader = ScriptReader::default().read(&script)?;
    project.default_locale = reader.locale;
    project.start = reader.start;
    project.nodes = reader
        .nodes
        .into_iter()
        .map(|(id, node)| (id, Arc::new(node)))
        .collect();

    if dir.join(MANIFEST_FILE).exists() {
        let manifest =
            ExportManifest::load(dir).map_err(|e| ImportError::Manifest(e.to_string()))?;
        project.schema_version = manifest.schema_version;
    }

    validate_project(&project)?;
    info!(
        "Imported '{}' from {}: {} nodes, {} characters",
        project.title,
        dir.display(),
        project.node_count(),
        project.characters.len()
    );
    Ok(project)
}

fn parse_title(options: &str) -> Option<String> {
    options.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("define config.name = _(")?;
        parse_quoted(rest).map(|(title, _)| title)
    })
}

fn parse_world(options: &str) -> Option<String> {
    let prefix = format!("{}world ", MARKER);
    options
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(prefix.as_str()).map(unescape_comment))
}

fn parse_characters(source: &str) -> ImportResult<Vec<Character>> {
    const FILE: &str = "characters.rpy";
    let description_marker = format!("{}description ", MARKER);
    let mut characters = Vec::new();
    let mut description = None;

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        if let Some(text) = raw.trim_start().strip_prefix(description_marker.as_str()) {
            description = Some(unescape_comment(text));
            continue;
        }
        let Some(rest) = raw.trim().strip_prefix("define ") else {
            continue;
        };
        let Some((id, call)) = rest.split_once(" = Character(") else {
            continue;
        };
        if id == "narrator" {
            continue;
        }

        let (name, mut rest) =
            parse_quoted(call).ok_or_else(|| parse_error(FILE, line_no, "expected character name"))?;
        let mut character = Character::new(id.trim(), name);
        character.description = description.take();

        loop {
            rest = rest.trim_start();
            if rest.starts_with(')') {
                break;
            }
            let arg = rest
                .strip_prefix(',')
                .ok_or_else(|| parse_error(FILE, line_no, "expected ',' or ')'"))?
                .trim_start();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| parse_error(FILE, line_no, "expected keyword argument"))?;
            let (value, after) = parse_quoted(value.trim_start())
                .ok_or_else(|| parse_error(FILE, line_no, "expected string value"))?;
            match key.trim() {
                "color" if value != DEFAULT_COLOR => character.hints.color = Some(value),
                "image" => character.hints.sprite = Some(value),
                "voice_tag" => character.hints.voice = Some(value),
                _ => {}
            }
            rest = after;
        }
        characters.push(character);
    }
    Ok(characters)
}

#[derive(Default)]
struct MenuState {
    next_order: u32,
    /// Label of the option whose `jump` has not been read yet
    pending: Option<Option<String>>,
}

#[derive(Default)]
struct ScriptReader {
    locale: Locale,
    nodes: BTreeMap<NodeId, Node>,
    start: Option<NodeId>,
    in_start: bool,
    current: Option<NodeId>,
    /// Whether the current node falls through to the next node marker
    open: bool,
    menu: Option<MenuState>,
    line: usize,
}

impl ScriptReader {
    const FILE: &'static str = "script.rpy";

    fn error(&self, message: impl Into<String>) -> ImportError {
        parse_error(Self::FILE, self.line, message)
    }

    fn read(mut self, source: &str) -> ImportResult<Self> {
        for (idx, raw) in source.lines().enumerate() {
            self.line = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(marker) = line.strip_prefix(MARKER) {
                self.marker(marker)?;
            } else if line.starts_with('#') {
                continue;
            } else if let Some(label) = line.strip_prefix("label ").and_then(|l| l.strip_suffix(':')) {
                self.in_start = label == "start";
                self.current = None;
                self.open = false;
                self.menu = None;
            } else if let Some(target) = line.strip_prefix("jump ") {
                self.jump(target.trim())?;
            } else if line == "return" {
                self.open = false;
            } else if line == "menu:" {
                self.open = false;
                self.menu = Some(MenuState::default());
            } else if ["scene ", "show ", "play "].iter().any(|p| line.starts_with(p)) {
                // Regenerated from asset markers
                continue;
            } else {
                self.say_or_option(line)?;
            }
        }
        debug!("Read {} nodes from {}", self.nodes.len(), Self::FILE);
        Ok(self)
    }

    fn current_node(&mut self) -> ImportResult<&mut Node> {
        let id = self
            .current
            .ok_or_else(|| self.error("statement outside of a node"))?;
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| parse_error(Self::FILE, self.line, "statement outside of a node"))
    }

    fn marker(&mut self, marker: &str) -> ImportResult<()> {
        let (name, rest) = marker.split_once(' ').unwrap_or((marker, ""));
        match name {
            "locale" => self.locale = Locale::new(rest.trim()),
            "node" => {
                let (id, kind) = rest
                    .split_once(' ')
                    .ok_or_else(|| self.error("expected node id and kind"))?;
                let id = id
                    .parse::<u64>()
                    .map(NodeId::new)
                    .map_err(|_| self.error(format!("invalid node id '{}'", id)))?;
                let kind = NodeKind::parse(kind.trim())
                    .ok_or_else(|| self.error(format!("unknown node kind '{}'", kind)))?;
                if self.nodes.contains_key(&id) {
                    return Err(self.error(format!("{} defined twice", id)));
                }

                if let (true, Some(previous)) = (self.open, self.current) {
                    if let Some(node) = self.nodes.get_mut(&previous) {
                        node.insert_edge(Edge::new(previous, id, 0));
                    }
                }
                self.nodes.insert(id, Node::new(id, kind));
                self.current = Some(id);
                self.open = true;
                self.menu = None;
            }
            "text" => {
                let (locale, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let text = unescape_comment(text);
                self.current_node()?.text.insert(Locale::new(locale), text);
            }
            "title" => {
                let locale = self.locale.clone();
                let text = unescape_comment(rest);
                self.current_node()?.text.insert(locale, text);
            }
            "asset" => {
                let (kind, key) = rest
                    .split_once(' ')
                    .ok_or_else(|| self.error("expected asset kind and key"))?;
                let kind = parse_asset_kind(kind)
                    .ok_or_else(|| self.error(format!("unknown asset kind '{}'", kind)))?;
                let key = unescape_comment(key);
                self.current_node()?.assets.push(AssetRef::new(kind, key));
            }
            other => debug!("Ignoring unknown marker '{}' on line {}", other, self.line),
        }
        Ok(())
    }

    fn jump(&mut self, target: &str) -> ImportResult<()> {
        let target = target
            .strip_prefix("node_")
            .and_then(|id| id.parse::<u64>().ok())
            .map(NodeId::new)
            .ok_or_else(|| self.error(format!("unknown jump target '{}'", target)))?;

        if self.in_start {
            self.start = Some(target);
            return Ok(());
        }
        let source = self
            .current
            .ok_or_else(|| self.error("jump outside of a node"))?;

        let edge = match self.menu.as_mut() {
            Some(menu) => {
                let label = menu
                    .pending
                    .take()
                    .ok_or_else(|| parse_error(Self::FILE, self.line, "jump without a menu option"))?;
                let order = menu.next_order;
                menu.next_order += 1;
                Edge {
                    source,
                    target,
                    label,
                    order,
                }
            }
            None => {
                self.open = false;
                Edge::new(source, target, 0)
            }
        };
        self.current_node()?.insert_edge(edge);
        Ok(())
    }

    fn say_or_option(&mut self, line: &str) -> ImportResult<()> {
        let quote = line
            .find('"')
            .ok_or_else(|| self.error(format!("unrecognised statement '{}'", line)))?;
        let (text, rest) = parse_quoted(&line[quote..])
            .ok_or_else(|| self.error("unterminated string"))?;

        if quote == 0 {
            if let Some(after) = rest.trim_start().strip_prefix(':') {
                let unlabeled = after.contains("vnova:unlabeled");
                let menu = self
                    .menu
                    .as_mut()
                    .ok_or_else(|| parse_error(Self::FILE, self.line, "menu option outside a menu"))?;
                menu.pending = Some(if unlabeled { None } else { Some(text) });
                return Ok(());
            }
        }

        // Speaker first, then any image attributes
        let speaker = line[..quote]
            .split_whitespace()
            .next()
            .filter(|s| *s != "narrator")
            .map(CharacterId::new);
        let locale = self.locale.clone();
        let node = self.current_node()?;
        node.text.insert(locale, text);
        node.speaker = speaker;
        Ok(())
    }
}
