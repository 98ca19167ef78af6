//! Asset resolution
//!
//! Nodes only hold weak asset references. The export compiler resolves
//! them to files through an [`AssetResolver`] before anything is written.

use crate::graph::{AssetKind, AssetRef};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("Asset '{0}' not found")]
    NotFound(AssetRef),
}

/// Read-only lookup from asset references to files
pub trait AssetResolver: Send + Sync {
    fn resolve(&self, asset: &AssetRef) -> Result<PathBuf, AssetError>;
}

/// Conventional sub-directory for each asset kind
pub fn category_dir(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Background => "backgrounds",
        AssetKind::Sprite => "characters",
        AssetKind::Music => "music",
        AssetKind::Sound => "sounds",
    }
}

/// Resolves assets to files under a root directory.
///
/// A key is looked up as `<root>/<category>/<key>`, then `<root>/<key>`.
/// Keys without an extension match the first file (by name) with that stem.
pub struct DirectoryAssetResolver {
    root: PathBuf,
}

impl DirectoryAssetResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn find_in(dir: &Path, key: &str) -> Option<PathBuf> {
        let exact = dir.join(key);
        if exact.is_file() {
            return Some(exact);
        }
        if Path::new(key).extension().is_some() {
            return None;
        }

        let (parent, stem) = match key.rsplit_once('/') {
            Some((parent, stem)) => (dir.join(parent), stem),
            None => (dir.to_path_buf(), key),
        };
        let mut matches: Vec<PathBuf> = std::fs::read_dir(&parent)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.file_stem().and_then(|s| s.to_str()) == Some(stem))
            .collect();
        matches.sort();
        matches.into_iter().next()
    }
}

impl AssetResolver for DirectoryAssetResolver {
    fn resolve(&self, asset: &AssetRef) -> Result<PathBuf, AssetError> {
        if asset.key.is_empty() || asset.key.split('/').any(|part| part == "..") {
            return Err(AssetError::NotFound(asset.clone()));
        }
        Self::find_in(&self.root.join(category_dir(asset.kind)), &asset.key)
            .or_else(|| Self::find_in(&self.root, &asset.key))
            .ok_or_else(|| AssetError::NotFound(asset.clone()))
    }
}

/// Resolves assets from an explicit table
#[derive(Debug, Clone, Default)]
pub struct MapAssetResolver {
    entries: BTreeMap<AssetRef, PathBuf>,
}

impl MapAssetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset: AssetRef, path: impl Into<PathBuf>) {
        self.entries.insert(asset, path.into());
    }

    pub fn with(mut self, asset: AssetRef, path: impl Into<PathBuf>) -> Self {
        self.insert(asset, path);
        self
    }
}

impl AssetResolver for MapAssetResolver {
    fn resolve(&self, asset: &AssetRef) -> Result<PathBuf, AssetError> {
        self.entries
            .get(asset)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(asset.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_resolver_categories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("backgrounds")).unwrap();
        std::fs::write(dir.path().join("backgrounds/cafe.png"), b"png").unwrap();
        std::fs::write(dir.path().join("theme.ogg"), b"ogg").unwrap();

        let resolver = DirectoryAssetResolver::new(dir.path());
        assert_eq!(
            resolver.resolve(&AssetRef::background("cafe")).unwrap(),
            dir.path().join("backgrounds/cafe.png")
        );
        assert_eq!(
            resolver.resolve(&AssetRef::music("theme.ogg")).unwrap(),
            dir.path().join("theme.ogg")
        );
        assert!(resolver.resolve(&AssetRef::sprite("ghost")).is_err());
        assert!(resolver.resolve(&AssetRef::sprite("../escape")).is_err());
    }

    #[test]
    fn test_map_resolver() {
        let resolver = MapAssetResolver::new().with(AssetRef::sound("door"), "/tmp/door.wav");
        assert_eq!(
            resolver.resolve(&AssetRef::sound("door")).unwrap(),
            PathBuf::from("/tmp/door.wav")
        );
        assert_eq!(
            resolver.resolve(&AssetRef::music("door")),
            Err(AssetError::NotFound(AssetRef::music("door")))
        );
    }
}
