//! Persisted project format
//!
//! Projects are stored as JSON wrapped in a [`ProjectFile`] envelope that
//! records the file schema. Older schemas are migrated on load; newer ones
//! are rejected rather than guessed at.
//!
//! Schema history:
//! - 1: node `text` was a single string
//! - 2: node `text` is keyed by locale, nodes may carry a manual emotion override

pub mod journal;

pub use journal::{Journal, JournalError, JournalRecord, JournalResult};

use crate::graph::Project;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub const CURRENT_SCHEMA: u32 = 2;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported project schema {found} (this build reads up to {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Invalid project file: {0}")]
    Format(String),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub schema: u32,
    pub project: Project,
}

/// Write `project` to `path`, replacing any existing file
pub fn save(project: &Project, path: &Path) -> PersistenceResult<()> {
    let file = ProjectFile {
        schema: CURRENT_SCHEMA,
        project: project.clone(),
    };
    let data = serde_json::to_vec_pretty(&file)?;

    // Write next to the target and rename so readers never see half a file
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;

    info!(
        "Saved project '{}' (version {}) to {:?}",
        project.title, project.schema_version, path
    );
    Ok(())
}

/// Read a project file, migrating older schemas
pub fn load(path: &Path) -> PersistenceResult<Project> {
    let raw = fs::read_to_string(path)?;
    let project = from_json(&raw)?;
    info!(
        "Loaded project '{}' with {} nodes from {:?}",
        project.title,
        project.node_count(),
        path
    );
    Ok(project)
}

/// Parse a project file body
pub fn from_json(raw: &str) -> PersistenceResult<Project> {
    let value: Value = serde_json::from_str(raw)?;
    let schema = value
        .get("schema")
        .and_then(Value::as_u64)
        .ok_or_else(|| PersistenceError::Format("missing schema number".to_string()))?;
    let schema = u32::try_from(schema).unwrap_or(u32::MAX);

    let file = migrate(value, schema)?;
    let file: ProjectFile = serde_json::from_value(file)?;
    Ok(file.project)
}

/// Bring a project file value up to [`CURRENT_SCHEMA`]
pub fn migrate(mut value: Value, schema: u32) -> PersistenceResult<Value> {
    if schema > CURRENT_SCHEMA {
        return Err(PersistenceError::UnsupportedSchema {
            found: schema,
            supported: CURRENT_SCHEMA,
        });
    }
    if schema == 0 {
        return Err(PersistenceError::Format("schema 0 does not exist".to_string()));
    }

    if schema < 2 {
        migrate_v1(&mut value)?;
        info!("Migrated project file from schema 1 to 2");
    }
    value["schema"] = Value::from(CURRENT_SCHEMA);
    Ok(value)
}

/// Schema 1 stored one text per node; move it under the default locale
fn migrate_v1(value: &mut Value) -> PersistenceResult<()> {
    let project = value
        .get_mut("project")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| PersistenceError::Format("missing project".to_string()))?;
    let locale = project
        .get("default_locale")
        .and_then(Value::as_str)
        .unwrap_or("en")
        .to_string();

    let Some(nodes) = project.get_mut("nodes").and_then(Value::as_object_mut) else {
        return Ok(());
    };
    for (id, node) in nodes.iter_mut() {
        let node = node
            .as_object_mut()
            .ok_or_else(|| PersistenceError::Format(format!("node {} is not an object", id)))?;
        let text = match node.remove("text") {
            Some(Value::String(text)) => text,
            Some(Value::Null) | None => String::new(),
            Some(_) => {
                return Err(PersistenceError::Format(format!(
                    "node {} has non-string text in a schema 1 file",
                    id
                )))
            }
        };
        let mut by_locale = serde_json::Map::new();
        by_locale.insert(locale.clone(), Value::String(text));
        node.insert("text".to_string(), Value::Object(by_locale));
        node.remove("manual_override");
    }
    Ok(())
}
