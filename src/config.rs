//! Engine configuration
//!
//! Typed configuration values handed to each component's constructor.
//! Binaries may load them from YAML; the library never reads files on
//! its own.

use crate::emotion::EmotionCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted when no API key is configured
pub const API_KEY_ENV: &str = "VNOVA_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Supported text-generation providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    OpenAI,
    Gemini,
}

/// Configuration of the external text-generation capability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Model name (e.g. "llama3", "gpt-4o")
    pub model: String,
    /// API key; falls back to `VNOVA_API_KEY`
    pub api_key: Option<String>,
    /// Base URL; each provider has its own default
    pub api_base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask Ollama for a streamed response
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            provider: LlmProvider::Ollama,
            model: "llama3".to_string(),
            api_key: None,
            api_base_url: None,
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 2048,
            stream: false,
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()))
    }

    pub fn base_url(&self) -> String {
        self.api_base_url.clone().unwrap_or_else(|| match self.provider {
            LlmProvider::Ollama => "http://localhost:11434".to_string(),
            LlmProvider::OpenAI => "https://api.openai.com/v1".to_string(),
            LlmProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        })
    }
}

/// Response shape of the sentiment endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreFormat {
    /// `{"scores": {"joy": 0.8, ...}}`
    Categories,
    /// `{"polarity": 0.73}`, a single positivity score in [0, 1]
    Polarity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub endpoint: String,
    pub format: ScoreFormat,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        ScorerConfig {
            endpoint: "http://localhost:5000/score".to_string(),
            format: ScoreFormat::Categories,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Per-category minimum winning score
    pub thresholds: BTreeMap<EmotionCategory, f32>,
    /// Threshold for categories missing from `thresholds`
    pub default_threshold: f32,
    pub cache_capacity: usize,
    /// Concurrent calls to the scorer
    pub pool_size: usize,
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            thresholds: BTreeMap::new(),
            default_threshold: 0.30,
            cache_capacity: 1024,
            pool_size: 2,
            timeout_ms: 10_000,
        }
    }
}

impl ClassifierConfig {
    pub fn threshold(&self, category: EmotionCategory) -> f32 {
        self.thresholds
            .get(&category)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Concurrently running generation jobs
    pub worker_pool_size: usize,
    /// Maximum attempts per job, including the first
    pub retry_ceiling: u32,
    pub backoff_base_ms: u64,
    /// Characters of ancestor text included in the prompt
    pub context_window_size: usize,
    pub request_timeout_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            worker_pool_size: 3,
            retry_ceiling: 3,
            backoff_base_ms: 500,
            context_window_size: 2000,
            request_timeout_ms: 60_000,
        }
    }
}

impl GenerationConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before retry `n` (1-based): `base * 2^(n-1)`
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.backoff_base().saturating_mul(1u32 << shift)
    }
}

/// Aggregate configuration for the whole engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub generation: GenerationConfig,
    pub classifier: ClassifierConfig,
    pub llm: LlmConfig,
    pub scorer: ScorerConfig,
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.generation.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker_pool_size must be at least 1".into()));
        }
        if self.generation.retry_ceiling == 0 {
            return Err(ConfigError::Invalid("retry_ceiling must be at least 1".into()));
        }
        if self.classifier.pool_size == 0 {
            return Err(ConfigError::Invalid("classifier pool_size must be at least 1".into()));
        }
        if self.classifier.cache_capacity == 0 {
            return Err(ConfigError::Invalid("classifier cache_capacity must be at least 1".into()));
        }
        let thresholds = self
            .classifier
            .thresholds
            .values()
            .chain(std::iter::once(&self.classifier.default_threshold));
        for t in thresholds {
            if !(0.0..=1.0).contains(t) {
                return Err(ConfigError::Invalid(format!("threshold {} outside [0, 1]", t)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.generation.worker_pool_size, 3);
        assert_eq!(config.generation.retry_ceiling, 3);
        assert_eq!(config.generation.context_window_size, 2000);
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.model, "llama3");
        assert_eq!(config.classifier.threshold(EmotionCategory::Joy), 0.30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles() {
        let config = GenerationConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(500));
        assert_eq!(config.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
generation:
  worker_pool_size: 5
classifier:
  thresholds:
    fear: 0.5
llm:
  provider: openai
  model: gpt-4o
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.generation.worker_pool_size, 5);
        assert_eq!(config.generation.retry_ceiling, 3);
        assert_eq!(config.classifier.threshold(EmotionCategory::Fear), 0.5);
        assert_eq!(config.classifier.threshold(EmotionCategory::Anger), 0.30);
        assert_eq!(config.llm.provider, LlmProvider::OpenAI);
        assert_eq!(config.llm.base_url(), "https://api.openai.com/v1");
    }

    #[test]
    fn test_rejects_invalid() {
        let err = EngineConfig::from_yaml_str("generation:\n  worker_pool_size: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_yaml_str("classifier:\n  default_threshold: 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "llm:\n  model: mistral\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.llm.model, "mistral");
    }
}
