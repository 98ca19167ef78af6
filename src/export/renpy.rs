//! Ren'Py script emission
//!
//! Nodes are grouped into blocks, each opened by `label node_<id>:`. A
//! node is inlined into its predecessor's block when it is that node's
//! only successor, has no other reachable predecessor, and is not a
//! Label; everything else is reached with `jump`. Choice points become
//! `menu` statements with one option per edge, in edge order.
//!
//! Every emitted node carries a `# vnova:` marker comment so an exported
//! project can be read back.

use crate::emotion::EmotionCategory;
use crate::graph::{AssetKind, AssetRef, Node, NodeId, NodeKind, Project};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::PathBuf;

pub const MARKER: &str = "# vnova:";

/// Name colour used when a character has no colour hint
pub const DEFAULT_COLOR: &str = "#ffffff";

/// An asset reference resolved to a file and a script-side name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub source: PathBuf,
    /// Destination relative to the `game/` directory
    pub dest: String,
    /// Image name for images, quoted path for audio
    pub name: String,
}

/// Rendered text of every generated script file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenpyScripts {
    pub script: String,
    pub characters: String,
    pub images: String,
    pub options: String,
}

/// Image attribute used for an emotion category
pub fn mood(category: EmotionCategory) -> &'static str {
    match category {
        EmotionCategory::Joy => "happy",
        EmotionCategory::Sadness => "sad",
        EmotionCategory::Anger => "angry",
        EmotionCategory::Fear => "scared",
        EmotionCategory::Surprise => "surprised",
        EmotionCategory::Neutral => "neutral",
    }
}

pub fn asset_kind_name(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Background => "background",
        AssetKind::Sprite => "sprite",
        AssetKind::Music => "music",
        AssetKind::Sound => "sound",
    }
}

pub fn parse_asset_kind(s: &str) -> Option<AssetKind> {
    match s {
        "background" => Some(AssetKind::Background),
        "sprite" => Some(AssetKind::Sprite),
        "music" => Some(AssetKind::Music),
        "sound" => Some(AssetKind::Sound),
        _ => None,
    }
}

/// Escape text for a Ren'Py string literal
pub fn escape_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '[' => out.push_str("[["),
            '{' => out.push_str("{{"),
            c => out.push(c),
        }
    }
    out
}

/// Escape text for a single-line marker comment
pub fn escape_comment(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Reverse of [`escape_comment`]
pub fn unescape_comment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a string literal at the start of `input`.
///
/// Returns the unescaped text and the remainder after the closing quote.
pub fn parse_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut out = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, other)) => out.push(other),
                None => return None,
            },
            '"' => return Some((out, &body[i + 1..])),
            '[' | '{' => {
                if chars.peek().map(|(_, n)| *n) == Some(c) {
                    chars.next();
                }
                out.push(c);
            }
            c => out.push(c),
        }
    }
    None
}

/// Lower-case identifier derived from an asset key
pub fn sanitize_name(key: &str) -> String {
    let last = key.rsplit('/').next().unwrap_or(key);
    let stem = match last.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => {
            let dir_len = key.len() - last.len();
            format!("{}{}", &key[..dir_len], stem)
        }
        _ => key.to_string(),
    };
    let mut name: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "img_");
    }
    name
}

/// Plan destination paths and script names for resolved assets.
///
/// Image names share one namespace across backgrounds and sprites, and
/// destination files must not overlap; colliding assets get a numeric
/// suffix in key order.
pub fn plan_assets(resolved: BTreeMap<AssetRef, PathBuf>) -> BTreeMap<AssetRef, ResolvedAsset> {
    let mut used_dests = BTreeSet::new();
    let mut used_images = BTreeSet::new();
    let mut planned = BTreeMap::new();

    for (asset, source) in resolved {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        let is_image = matches!(asset.kind, AssetKind::Background | AssetKind::Sprite);

        let base = sanitize_name(&asset.key);
        let mut stem = base.clone();
        let mut n = 2;
        let (dest, name) = loop {
            let (dest, name) = asset_layout(asset.kind, &stem, &ext);
            if !used_dests.contains(&dest) && !(is_image && used_images.contains(&name)) {
                break (dest, name);
            }
            stem = format!("{}_{}", base, n);
            n += 1;
        };

        used_dests.insert(dest.clone());
        if is_image {
            used_images.insert(name.clone());
        }
        planned.insert(asset, ResolvedAsset { source, dest, name });
    }
    planned
}

/// Destination path and script name for an asset stored under `stem`
fn asset_layout(kind: AssetKind, stem: &str, ext: &str) -> (String, String) {
    match kind {
        AssetKind::Background => (format!("images/bg/{}{}", stem, ext), format!("bg_{}", stem)),
        AssetKind::Sprite => (format!("images/chara/{}{}", stem, ext), stem.to_string()),
        AssetKind::Music => {
            let dest = format!("audio/music/{}{}", stem, ext);
            (dest.clone(), format!("\"{}\"", dest))
        }
        AssetKind::Sound => {
            let dest = format!("audio/sfx/{}{}", stem, ext);
            (dest.clone(), format!("\"{}\"", dest))
        }
    }
}

/// Render all script files for the reachable part of a project
pub fn render(
    project: &Project,
    start: NodeId,
    reachable: &BTreeSet<NodeId>,
    assets: &BTreeMap<AssetRef, ResolvedAsset>,
) -> RenpyScripts {
    let mut writer = ScriptWriter::new(project, reachable, assets);
    writer.write_story(start);

    RenpyScripts {
        script: writer.out,
        characters: render_characters(project),
        images: render_images(assets),
        options: render_options(project),
    }
}

fn render_characters(project: &Project) -> String {
    let mut out = String::from("# Characters generated by vnova\n\ndefine narrator = Character(None)\n");
    for character in project.characters.values() {
        let hints = &character.hints;
        if let Some(description) = &character.description {
            let _ = writeln!(out, "{}description {}", MARKER, escape_comment(description));
        }
        let _ = write!(
            out,
            "define {} = Character(\"{}\", color=\"{}\"",
            character.id,
            escape_string(&character.name),
            escape_string(hints.color.as_deref().unwrap_or(DEFAULT_COLOR))
        );
        if let Some(sprite) = &hints.sprite {
            let _ = write!(out, ", image=\"{}\"", escape_string(sprite));
        }
        if let Some(voice) = &hints.voice {
            let _ = write!(out, ", voice_tag=\"{}\"", escape_string(voice));
        }
        out.push_str(")\n");
    }
    out
}

fn render_images(assets: &BTreeMap<AssetRef, ResolvedAsset>) -> String {
    let mut out = String::from("# Images generated by vnova\n\n");
    for (asset, resolved) in assets {
        if matches!(asset.kind, AssetKind::Background | AssetKind::Sprite) {
            let _ = writeln!(out, "image {} = \"{}\"", resolved.name, resolved.dest);
        }
    }
    out
}

fn render_options(project: &Project) -> String {
    let mut build_name = sanitize_name(&project.title);
    if build_name.starts_with("img_") {
        build_name = format!("vn_{}", &build_name[4..]);
    }
    let mut out = format!(
        "## Project options generated by vnova\n\n\
         define config.name = _(\"{}\")\n\
         define config.version = \"1.0\"\n\
         define build.name = \"{}\"\n",
        escape_string(&project.title),
        build_name
    );
    if let Some(world) = &project.world_info {
        let _ = writeln!(out, "\n{}world {}", MARKER, escape_comment(world));
    }
    out
}

struct ScriptWriter<'a> {
    project: &'a Project,
    reachable: &'a BTreeSet<NodeId>,
    assets: &'a BTreeMap<AssetRef, ResolvedAsset>,
    predecessors: BTreeMap<NodeId, usize>,
    emitted: BTreeSet<NodeId>,
    out: String,
}

impl<'a> ScriptWriter<'a> {
    fn new(
        project: &'a Project,
        reachable: &'a BTreeSet<NodeId>,
        assets: &'a BTreeMap<AssetRef, ResolvedAsset>,
    ) -> Self {
        let mut predecessors = BTreeMap::new();
        for id in reachable {
            if let Some(node) = project.node(*id) {
                for edge in &node.edges {
                    *predecessors.entry(edge.target).or_insert(0) += 1;
                }
            }
        }
        Self {
            project,
            reachable,
            assets,
            predecessors,
            emitted: BTreeSet::new(),
            out: String::new(),
        }
    }

    fn inlinable(&self, id: NodeId) -> bool {
        self.predecessors.get(&id) == Some(&1)
            && !self.emitted.contains(&id)
            && self
                .project
                .node(id)
                .map(|n| n.kind != NodeKind::Label)
                .unwrap_or(false)
    }

    fn write_story(&mut self, start: NodeId) {
        self.out.push_str("# Story generated by vnova. Edits are overwritten on the next export.\n");
        let _ = writeln!(self.out, "{}locale {}\n", MARKER, self.project.default_locale);
        let _ = writeln!(self.out, "label start:\n    jump {}", start.script_label());

        let mut stack = vec![start];
        while let Some(block) = stack.pop() {
            if self.emitted.contains(&block) || !self.reachable.contains(&block) {
                continue;
            }
            let _ = writeln!(self.out, "\nlabel {}:", block.script_label());

            let mut current = block;
            loop {
                self.emitted.insert(current);
                let Some(node) = self.project.node(current) else {
                    self.out.push_str("    return\n");
                    break;
                };
                self.write_node(node);

                if node.kind == NodeKind::ChoicePoint && !node.edges.is_empty() {
                    self.write_menu(node);
                    // Reverse so the first option's block is written first
                    stack.extend(node.edges.iter().rev().map(|e| e.target));
                    break;
                }

                match node.edges.first() {
                    None => {
                        self.out.push_str("    return\n");
                        break;
                    }
                    Some(edge) if node.kind != NodeKind::Jump && self.inlinable(edge.target) => {
                        current = edge.target;
                    }
                    Some(edge) => {
                        let _ = writeln!(self.out, "    jump {}", edge.target.script_label());
                        stack.push(edge.target);
                        break;
                    }
                }
            }
        }
    }

    fn write_node(&mut self, node: &Node) {
        let _ = writeln!(self.out, "    {}node {} {}", MARKER, node.id.as_u64(), node.kind.as_str());

        let primary = &self.project.default_locale;
        for (locale, text) in &node.text {
            if locale != primary {
                let _ = writeln!(self.out, "    {}text {} {}", MARKER, locale, escape_comment(text));
            }
        }

        for asset in &node.assets {
            let _ = writeln!(
                self.out,
                "    {}asset {} {}",
                MARKER,
                asset_kind_name(asset.kind),
                escape_comment(&asset.key)
            );
            if let Some(resolved) = self.assets.get(asset) {
                let statement = match asset.kind {
                    AssetKind::Background => "scene",
                    AssetKind::Sprite => "show",
                    AssetKind::Music => "play music",
                    AssetKind::Sound => "play sound",
                };
                let _ = writeln!(self.out, "    {} {}", statement, resolved.name);
            }
        }

        let text = node.text_for(primary);
        match node.kind {
            NodeKind::Label | NodeKind::Jump => {
                if !text.is_empty() {
                    let _ = writeln!(self.out, "    {}title {}", MARKER, escape_comment(text));
                }
            }
            NodeKind::Narration => {
                if !text.is_empty() || node.speaker.is_some() {
                    let line = self.say(node, text);
                    let _ = writeln!(self.out, "    {}", line);
                }
            }
            NodeKind::Dialogue => {
                let line = self.say(node, text);
                let _ = writeln!(self.out, "    {}", line);
            }
            NodeKind::ChoicePoint => {
                // A choice without options degrades to a plain line
                if node.edges.is_empty() && (!text.is_empty() || node.speaker.is_some()) {
                    let line = self.say(node, text);
                    let _ = writeln!(self.out, "    {}", line);
                }
            }
        }
    }

    fn write_menu(&mut self, node: &Node) {
        self.out.push_str("    menu:\n");
        let text = node.text_for(&self.project.default_locale);
        if !text.is_empty() || node.speaker.is_some() {
            let line = self.say(node, text);
            let _ = writeln!(self.out, "        {}", line);
        }
        for edge in &node.edges {
            match &edge.label {
                Some(label) => {
                    let _ = writeln!(self.out, "        \"{}\":", escape_string(label));
                }
                None => {
                    let _ = writeln!(self.out, "        \"Continue\":  {}unlabeled", MARKER);
                }
            }
            let _ = writeln!(self.out, "            jump {}", edge.target.script_label());
        }
    }

    /// A say statement, annotated with the node's emotion for dialogue
    fn say(&self, node: &Node, text: &str) -> String {
        let character = node.speaker.as_ref().and_then(|s| self.project.character(s));
        let mut line = String::new();
        match (&node.speaker, node.kind) {
            (Some(speaker), _) => {
                line.push_str(speaker.as_str());
                line.push(' ');
            }
            (None, NodeKind::Dialogue) => line.push_str("narrator "),
            (None, _) => {}
        }

        let emotion = (node.kind == NodeKind::Dialogue)
            .then(|| node.effective_emotion())
            .flatten();
        let has_sprite = character.map(|c| c.hints.sprite.is_some()).unwrap_or(false);

        if let (Some(tag), true) = (emotion, has_sprite) {
            line.push_str(mood(tag.category));
            line.push(' ');
        }
        let _ = write!(line, "\"{}\"", escape_string(text));
        if let (Some(tag), false) = (emotion, has_sprite) {
            let _ = write!(line, "  # emotion: {} {:.2}", mood(tag.category), tag.confidence);
        }
        line
    }
}
