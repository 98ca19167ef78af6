//! AI-assisted text generation
//!
//! Builds prompts from graph context, runs requests against an external
//! text-generation service on a bounded pool of tokio tasks, and surfaces
//! results as reviewable drafts. Drafts never touch the graph on their
//! own; the caller accepts one by applying the mutation returned from
//! [`GenerationJob::accept`].

pub mod client;
pub mod orchestrator;
pub mod prompt;

pub use crate::config::{GenerationConfig, LlmConfig, LlmProvider};
pub use client::{LlmClient, TextGenerator};
pub use orchestrator::GenerationOrchestrator;
pub use prompt::{ancestor_chain, build_prompt, parse_story_response, Prompt};

use crate::graph::{Locale, Mutation, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// Worth retrying: timeouts, refused connections, throttling, server errors
    #[error("Transient generation failure: {0}")]
    Transient(String),

    /// Retrying would not help: bad request, malformed or empty output, refusals
    #[error("Permanent generation failure: {0}")]
    Permanent(String),

    #[error("Generation job was cancelled")]
    Cancelled,

    #[error("Node {0} not found")]
    UnknownNode(NodeId),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerationError::Transient(_))
    }
}

pub type GenerationResult<T> = Result<T, GenerationError>;

/// Unique identifier of a generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generated text awaiting the author's review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub text: String,
    /// Follow-up ideas offered by the model
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { draft: Draft },
    Failed { error: String },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded { .. } => "succeeded",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time record of a generation job
#[derive(Debug, Clone, Serialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub node: NodeId,
    pub instruction: String,
    /// Prompt assembled from the snapshot current at request time
    pub prompt: Prompt,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn draft(&self) -> Option<&Draft> {
        match &self.status {
            JobStatus::Succeeded { draft } => Some(draft),
            _ => None,
        }
    }

    /// Mutation that writes the draft into the node's text for `locale`
    pub fn accept(&self, locale: impl Into<Locale>) -> Option<Mutation> {
        self.draft()
            .map(|d| Mutation::update_text(self.node, locale, d.text.clone()))
    }
}
