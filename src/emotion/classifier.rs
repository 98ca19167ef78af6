//! Cached, bounded emotion classifier
//!
//! Wraps an [`EmotionScorer`] with an LRU cache keyed by the SHA-256 of
//! the text, a semaphore limiting concurrent external calls, and a
//! per-call timeout.

use super::{map_scores, ClassificationError, ClassificationResult, EmotionScorer, EmotionTag};
use crate::config::ClassifierConfig;
use crate::graph::text_digest;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Cache and call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub scorer_calls: u64,
    pub failures: u64,
}

pub struct EmotionClassifier {
    scorer: Arc<dyn EmotionScorer>,
    config: ClassifierConfig,
    cache: Mutex<LruCache<String, EmotionTag>>,
    permits: Semaphore,
    hits: AtomicU64,
    misses: AtomicU64,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl EmotionClassifier {
    pub fn new(scorer: Arc<dyn EmotionScorer>, config: ClassifierConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let permits = Semaphore::new(config.pool_size.max(1));
        Self {
            scorer,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            permits,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify `text`. Empty text is Neutral without calling the scorer.
    pub async fn classify(&self, text: &str) -> ClassificationResult<EmotionTag> {
        if text.trim().is_empty() {
            return Ok(EmotionTag::neutral());
        }

        let key = text_digest(text);
        if let Some(tag) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Classifier cache hit for {}", &key[..12]);
            return Ok(tag);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ClassificationError::Network(e.to_string()))?;

        // Another caller may have filled the entry while we waited for a permit
        if let Some(tag) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(tag);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);

        let timeout = self.config.timeout();
        let scores = match tokio::time::timeout(timeout, self.scorer.score(text)).await {
            Ok(Ok(scores)) => scores,
            Ok(Err(ClassificationError::Timeout(_))) | Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Emotion scorer timed out after {:?}", timeout);
                return Err(ClassificationError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Emotion scorer failed: {}", e);
                return Err(e);
            }
        };

        let tag = map_scores(&scores, &self.config);
        debug!("Classified {} as {}", &key[..12], tag);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, tag);
        Ok(tag)
    }

    fn cached(&self, key: &str) -> Option<EmotionTag> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }

    pub fn stats(&self) -> ClassifierStats {
        ClassifierStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            scorer_calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
