//! Export compiler
//!
//! Compiles a graph snapshot into a Ren'Py project:
//!
//! ```text
//! <target>/
//!   manifest.json
//!   game/script.rpy
//!   game/characters.rpy
//!   game/images.rpy
//!   game/options.rpy
//!   game/images/bg/...     (copied assets)
//! ```
//!
//! Every asset of every reachable node is resolved before anything is
//! written. Files are written into a sibling staging directory and moved
//! into place only once all of them exist.

pub mod asset;
pub mod import;
pub mod renpy;

pub use asset::{category_dir, AssetError, AssetResolver, DirectoryAssetResolver, MapAssetResolver};
pub use import::{import_project, ImportError, ImportResult};
pub use renpy::{RenpyScripts, ResolvedAsset};

use crate::graph::{AssetRef, NodeId, Snapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Node {node} references unresolved asset '{asset}'")]
    UnresolvedAsset { node: NodeId, asset: AssetRef },

    #[error("Project has no start node")]
    NoStartNode,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Non-fatal findings reported with a successful export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportWarning {
    /// Node is not reachable from the start node and was not emitted
    UnreachableNode { node: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the export root, `/`-separated
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Description of an exported project, written as `manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub project_title: String,
    pub schema_version: u64,
    pub exported_at: DateTime<Utc>,
    pub start: NodeId,
    /// Emitted files sorted by path; the manifest itself is not listed
    pub files: Vec<ManifestEntry>,
    pub emitted_nodes: Vec<NodeId>,
    #[serde(default)]
    pub warnings: Vec<ExportWarning>,
}

impl ExportManifest {
    pub fn load(dir: &Path) -> ExportResult<Self> {
        let raw = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn file(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|f| f.path == path)
    }
}

pub struct Exporter {
    resolver: Arc<dyn AssetResolver>,
    timestamp: Option<DateTime<Utc>>,
}

impl Exporter {
    pub fn new(resolver: Arc<dyn AssetResolver>) -> Self {
        Self {
            resolver,
            timestamp: None,
        }
    }

    /// Pin the manifest timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Compile `snapshot` into a Ren'Py project at `target`
    pub fn export(&self, snapshot: &Snapshot, target: &Path) -> ExportResult<ExportManifest> {
        let project = snapshot.project();
        let start = project.start.ok_or(ExportError::NoStartNode)?;
        info!(
            "Exporting '{}' (version {}) to {}",
            project.title,
            project.schema_version,
            target.display()
        );

        let reachable = project.reachable_from_start();
        let warnings: Vec<ExportWarning> = project
            .unreachable_nodes()
            .into_iter()
            .map(|node| {
                warn!("Skipping {}: not reachable from the start node", node);
                ExportWarning::UnreachableNode { node }
            })
            .collect();

        let mut resolved = BTreeMap::new();
        for id in &reachable {
            let Some(node) = project.node(*id) else { continue };
            for asset in &node.assets {
                if resolved.contains_key(asset) {
                    continue;
                }
                let path = self.resolver.resolve(asset).map_err(|_| ExportError::UnresolvedAsset {
                    node: *id,
                    asset: asset.clone(),
                })?;
                resolved.insert(asset.clone(), path);
            }
        }
        let assets = renpy::plan_assets(resolved);
        let scripts = renpy::render(project, start, &reachable, &assets);

        let mut outputs: Vec<(String, Output)> = vec![
            ("game/script.rpy".to_string(), Output::Text(scripts.script)),
            ("game/characters.rpy".to_string(), Output::Text(scripts.characters)),
            ("game/images.rpy".to_string(), Output::Text(scripts.images)),
            ("game/options.rpy".to_string(), Output::Text(scripts.options)),
        ];
        for planned in assets.values() {
            outputs.push((format!("game/{}", planned.dest), Output::Copy(planned.source.clone())));
        }
        outputs.sort_by(|a, b| a.0.cmp(&b.0));

        let staging = staging_dir(target);
        let result = self.write_staged(&staging, outputs).and_then(|files| {
            let manifest = ExportManifest {
                project_title: project.title.clone(),
                schema_version: project.schema_version,
                exported_at: self.timestamp.unwrap_or_else(Utc::now),
                start,
                files,
                emitted_nodes: reachable.iter().copied().collect(),
                warnings,
            };
            fs::write(staging.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
            swap_into_place(&staging, target, &manifest)?;
            Ok(manifest)
        });

        if staging.exists() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                warn!("Failed to remove staging directory {}: {}", staging.display(), e);
            }
        }

        let manifest = result?;
        info!(
            "Exported {} nodes into {} files ({} warnings)",
            manifest.emitted_nodes.len(),
            manifest.files.len(),
            manifest.warnings.len()
        );
        Ok(manifest)
    }

    fn write_staged(
        &self,
        staging: &Path,
        outputs: Vec<(String, Output)>,
    ) -> ExportResult<Vec<ManifestEntry>> {
        fs::create_dir_all(staging)?;
        let mut entries = Vec::with_capacity(outputs.len());

        for (path, output) in outputs {
            let dest = staging.join(&path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = match output {
                Output::Text(text) => text.into_bytes(),
                Output::Copy(source) => fs::read(&source)?,
            };
            fs::write(&dest, &bytes)?;
            debug!("Staged {} ({} bytes)", path, bytes.len());

            entries.push(ManifestEntry {
                path,
                sha256: hex_digest(&bytes),
                bytes: bytes.len() as u64,
            });
        }
        Ok(entries)
    }
}

enum Output {
    Text(String),
    Copy(PathBuf),
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{:02x}", b)).collect()
}

fn staging_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    let staging = format!(".{}.staging-{}", name, uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(staging),
        _ => PathBuf::from(staging),
    }
}

/// Move staged files to `target`.
///
/// A fresh target takes the whole staging directory in one rename; an
/// existing one receives file-by-file renames, leaving unrelated files alone.
fn swap_into_place(staging: &Path, target: &Path, manifest: &ExportManifest) -> ExportResult<()> {
    if !target.exists() {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::rename(staging, target)?;
        return Ok(());
    }

    let paths = manifest
        .files
        .iter()
        .map(|f| f.path.as_str())
        .chain(std::iter::once(MANIFEST_FILE));
    for path in paths {
        let dest = target.join(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(staging.join(path), &dest)?;
    }
    Ok(())
}
