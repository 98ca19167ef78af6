//! Emotion classification
//!
//! Maps node text to an [`EmotionTag`] using an external sentiment
//! capability. The external call is abstracted behind [`EmotionScorer`];
//! [`EmotionClassifier`] adds caching, bounded concurrency and the
//! deterministic mapping from raw scores to a tag.

pub mod classifier;
pub mod scorer;

pub use crate::config::{ClassifierConfig, ScoreFormat, ScorerConfig};
pub use classifier::{ClassifierStats, EmotionClassifier};
pub use scorer::{EmotionScorer, HttpEmotionScorer};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassificationError {
    #[error("Classification timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Scorer API error: {0}")]
    Api(String),

    #[error("Malformed scorer response: {0}")]
    Malformed(String),
}

pub type ClassificationResult<T> = Result<T, ClassificationError>;

/// Closed set of emotion categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionCategory {
    Joy,
    Sadness,
    Anger,
    Fear,
    Surprise,
    Neutral,
}

impl EmotionCategory {
    pub const ALL: [EmotionCategory; 6] = [
        EmotionCategory::Joy,
        EmotionCategory::Sadness,
        EmotionCategory::Anger,
        EmotionCategory::Fear,
        EmotionCategory::Surprise,
        EmotionCategory::Neutral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionCategory::Joy => "joy",
            EmotionCategory::Sadness => "sadness",
            EmotionCategory::Anger => "anger",
            EmotionCategory::Fear => "fear",
            EmotionCategory::Surprise => "surprise",
            EmotionCategory::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|c| c.as_str() == lower)
    }
}

impl fmt::Display for EmotionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category plus confidence in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionTag {
    pub category: EmotionCategory,
    pub confidence: f32,
}

impl EmotionTag {
    /// Create a tag; confidence is clamped into [0, 1]
    pub fn new(category: EmotionCategory, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        EmotionTag {
            category,
            confidence,
        }
    }

    /// Tag assigned to empty text
    pub fn neutral() -> Self {
        EmotionTag::new(EmotionCategory::Neutral, 1.0)
    }
}

impl fmt::Display for EmotionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.category, self.confidence)
    }
}

/// Raw per-category scores returned by a scorer
pub type ScoreVector = BTreeMap<EmotionCategory, f32>;

/// Map a score vector to a tag.
///
/// The highest score wins. An exact tie for the highest score, or a winner
/// below its category threshold, resolves to Neutral.
pub fn map_scores(scores: &ScoreVector, config: &ClassifierConfig) -> EmotionTag {
    let usable = scores.iter().filter(|(_, s)| !s.is_nan());
    let top = usable.clone().map(|(_, s)| *s).fold(f32::NEG_INFINITY, f32::max);
    if top == f32::NEG_INFINITY {
        return EmotionTag::neutral();
    }

    let mut leaders = usable.filter(|(_, s)| **s == top).map(|(c, _)| *c);
    let winner = leaders.next();
    let tied = leaders.next().is_some();

    let neutral_fallback = || {
        let confidence = scores
            .get(&EmotionCategory::Neutral)
            .copied()
            .filter(|s| !s.is_nan())
            .unwrap_or(1.0 - top);
        EmotionTag::new(EmotionCategory::Neutral, confidence)
    };

    match winner {
        Some(category) if !tied && top >= config.threshold(category) => EmotionTag::new(category, top),
        _ => neutral_fallback(),
    }
}

/// Expand a single positivity score into a score vector.
///
/// Above 0.6 reads as Joy, below 0.4 as Sadness, anything between as Neutral.
pub fn polarity_scores(polarity: f32) -> ScoreVector {
    let p = polarity.clamp(0.0, 1.0);
    let mut scores = ScoreVector::new();
    if p > 0.6 {
        scores.insert(EmotionCategory::Joy, p);
        scores.insert(EmotionCategory::Neutral, 1.0 - p);
    } else if p < 0.4 {
        scores.insert(EmotionCategory::Sadness, 1.0 - p);
        scores.insert(EmotionCategory::Neutral, p);
    } else {
        scores.insert(EmotionCategory::Neutral, 1.0 - (p - 0.5).abs() * 2.0);
    }
    scores
}
