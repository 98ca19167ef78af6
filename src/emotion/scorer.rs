//! Sentiment scorer seam and its HTTP implementation

use super::{polarity_scores, ClassificationError, ClassificationResult, EmotionCategory, ScoreVector};
use crate::config::{ScoreFormat, ScorerConfig};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// External sentiment capability
#[async_trait]
pub trait EmotionScorer: Send + Sync {
    /// Raw per-category scores for `text`
    async fn score(&self, text: &str) -> ClassificationResult<ScoreVector>;
}

/// Scorer backed by an HTTP sentiment endpoint
pub struct HttpEmotionScorer {
    client: Client,
    endpoint: String,
    format: ScoreFormat,
}

impl HttpEmotionScorer {
    pub fn new(config: &ScorerConfig, timeout: Duration) -> ClassificationResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassificationError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            format: config.format,
        })
    }
}

#[async_trait]
impl EmotionScorer for HttpEmotionScorer {
    async fn score(&self, text: &str) -> ClassificationResult<ScoreVector> {
        #[derive(Serialize)]
        struct Request<'a> {
            text: &'a str,
        }

        #[derive(Deserialize)]
        struct CategoriesResponse {
            scores: HashMap<String, f32>,
        }

        #[derive(Deserialize)]
        struct PolarityResponse {
            polarity: f32,
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&Request { text })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassificationError::Timeout(Duration::ZERO)
                } else {
                    ClassificationError::Network(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClassificationError::Api(format!("{}: {}", status, body)));
        }

        match self.format {
            ScoreFormat::Categories => {
                let result: CategoriesResponse = resp
                    .json()
                    .await
                    .map_err(|e| ClassificationError::Malformed(e.to_string()))?;
                let scores: ScoreVector = result
                    .scores
                    .into_iter()
                    .filter_map(|(name, score)| EmotionCategory::parse(&name).map(|c| (c, score)))
                    .collect();
                if scores.is_empty() {
                    return Err(ClassificationError::Malformed(
                        "response carried no known categories".to_string(),
                    ));
                }
                Ok(scores)
            }
            ScoreFormat::Polarity => {
                let result: PolarityResponse = resp
                    .json()
                    .await
                    .map_err(|e| ClassificationError::Malformed(e.to_string()))?;
                Ok(polarity_scores(result.polarity))
            }
        }
    }
}
