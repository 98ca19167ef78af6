//! Client for text-generation providers
//!
//! Errors are sorted into transient ones (timeouts, refused connections,
//! HTTP 429 and 5xx) and permanent ones (other HTTP errors, unparseable
//! bodies, content-policy refusals) so the orchestrator knows what to retry.

use super::{GenerationError, GenerationResult, Prompt};
use crate::config::{LlmConfig, LlmProvider};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// External text-generation capability
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Raw model output for a prompt
    async fn generate(&self, prompt: &Prompt) -> GenerationResult<String>;
}

pub struct LlmClient {
    client: Client,
    config: LlmConfig,
    api_base_url: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig, timeout: Duration) -> GenerationResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Config(e.to_string()))?;

        Ok(Self {
            client,
            config: config.clone(),
            api_base_url: config.base_url().trim_end_matches('/').to_string(),
        })
    }

    fn system_prompt<'a>(&'a self, prompt: &'a Prompt) -> &'a str {
        self.config.system_prompt.as_deref().unwrap_or(&prompt.system)
    }

    async fn ollama_generate(&self, prompt: &Prompt) -> GenerationResult<String> {
        #[derive(Serialize)]
        struct Options {
            temperature: f32,
            num_predict: u32,
        }

        #[derive(Serialize)]
        struct Request<'a> {
            model: &'a str,
            prompt: &'a str,
            system: &'a str,
            stream: bool,
            format: &'a str,
            options: Options,
        }

        #[derive(Deserialize)]
        struct Response {
            response: String,
        }

        let url = format!("{}/api/generate", self.api_base_url);
        let resp = self
            .client
            .post(&url)
            .json(&Request {
                model: &self.config.model,
                prompt: &prompt.user,
                system: self.system_prompt(prompt),
                stream: self.config.stream,
                format: "json",
                options: Options {
                    temperature: self.config.temperature,
                    num_predict: self.config.max_tokens,
                },
            })
            .send()
            .await
            .map_err(request_error)?;
        let resp = check_status(resp, "Ollama").await?;

        if self.config.stream {
            return read_ollama_stream(resp).await;
        }
        let result: Response = resp
            .json()
            .await
            .map_err(|e| GenerationError::Permanent(format!("malformed Ollama response: {}", e)))?;
        Ok(result.response)
    }

    async fn openai_chat(&self, prompt: &Prompt) -> GenerationResult<String> {
        #[derive(Serialize)]
        struct Message<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct Request<'a> {
            model: &'a str,
            messages: Vec<Message<'a>>,
            temperature: f32,
            max_tokens: u32,
        }

        #[derive(Deserialize)]
        struct Response {
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: MessageContent,
            finish_reason: Option<String>,
        }

        #[derive(Deserialize)]
        struct MessageContent {
            content: Option<String>,
        }

        let api_key = self
            .config
            .resolved_api_key()
            .ok_or_else(|| GenerationError::Config("OpenAI requires API key".to_string()))?;

        let url = format!("{}/chat/completions", self.api_base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&Request {
                model: &self.config.model,
                messages: vec![
                    Message {
                        role: "system",
                        content: self.system_prompt(prompt),
                    },
                    Message {
                        role: "user",
                        content: &prompt.user,
                    },
                ],
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            })
            .send()
            .await
            .map_err(request_error)?;
        let resp = check_status(resp, "OpenAI").await?;

        let result: Response = resp
            .json()
            .await
            .map_err(|e| GenerationError::Permanent(format!("malformed OpenAI response: {}", e)))?;
        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::Permanent("OpenAI returned no choices".to_string()))?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(GenerationError::Permanent("content policy refusal".to_string()));
        }
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn gemini_generate(&self, prompt: &Prompt) -> GenerationResult<String> {
        #[derive(Serialize)]
        struct Request {
            contents: Vec<Content>,
            #[serde(rename = "generationConfig")]
            generation_config: GenerationConfig,
        }

        #[derive(Serialize, Deserialize)]
        struct Content {
            role: Option<String>,
            parts: Vec<Part>,
        }

        #[derive(Serialize, Deserialize)]
        struct Part {
            text: String,
        }

        #[derive(Serialize)]
        struct GenerationConfig {
            temperature: f32,
            #[serde(rename = "maxOutputTokens")]
            max_output_tokens: u32,
        }

        #[derive(Deserialize)]
        struct Response {
            candidates: Option<Vec<Candidate>>,
            #[serde(rename = "promptFeedback")]
            prompt_feedback: Option<PromptFeedback>,
        }

        #[derive(Deserialize)]
        struct Candidate {
            content: Option<Content>,
            #[serde(rename = "finishReason")]
            finish_reason: Option<String>,
        }

        #[derive(Deserialize)]
        struct PromptFeedback {
            #[serde(rename = "blockReason")]
            block_reason: Option<String>,
        }

        let api_key = self
            .config
            .resolved_api_key()
            .ok_or_else(|| GenerationError::Config("Gemini requires API key".to_string()))?;

        // Gemini has no separate system turn on this endpoint
        let full_prompt = format!("{}\n\n{}", self.system_prompt(prompt), prompt.user);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base_url, self.config.model, api_key
        );

        let resp = self
            .client
            .post(&url)
            .json(&Request {
                contents: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![Part { text: full_prompt }],
                }],
                generation_config: GenerationConfig {
                    temperature: self.config.temperature,
                    max_output_tokens: self.config.max_tokens,
                },
            })
            .send()
            .await
            .map_err(request_error)?;
        let resp = check_status(resp, "Gemini").await?;

        let result: Response = resp
            .json()
            .await
            .map_err(|e| GenerationError::Permanent(format!("malformed Gemini response: {}", e)))?;

        if let Some(reason) = result.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(GenerationError::Permanent(format!("content policy refusal: {}", reason)));
        }
        let candidate = result
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| GenerationError::Permanent("Gemini returned no candidates".to_string()))?;
        if matches!(candidate.finish_reason.as_deref(), Some("SAFETY") | Some("PROHIBITED_CONTENT")) {
            return Err(GenerationError::Permanent("content policy refusal".to_string()));
        }
        Ok(candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect::<String>())
            .unwrap_or_default())
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &Prompt) -> GenerationResult<String> {
        debug!(
            "Sending prompt ({} chars) to {:?} model {}",
            prompt.user.len(),
            self.config.provider,
            self.config.model
        );
        match self.config.provider {
            LlmProvider::Ollama => self.ollama_generate(prompt).await,
            LlmProvider::OpenAI => self.openai_chat(prompt).await,
            LlmProvider::Gemini => self.gemini_generate(prompt).await,
        }
    }
}

fn request_error(e: reqwest::Error) -> GenerationError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        GenerationError::Transient(e.to_string())
    } else {
        GenerationError::Permanent(e.to_string())
    }
}

/// Classify a non-success HTTP status
pub fn status_error(status: StatusCode, body: &str) -> GenerationError {
    let message = format!("{} returned {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GenerationError::Transient(message)
    } else {
        GenerationError::Permanent(message)
    }
}

async fn check_status(resp: Response, provider: &str) -> GenerationResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status_error(status, &body) {
        GenerationError::Transient(m) => GenerationError::Transient(format!("{}: {}", provider, m)),
        GenerationError::Permanent(m) => GenerationError::Permanent(format!("{}: {}", provider, m)),
        other => other,
    })
}

/// Buffer an Ollama NDJSON stream into the final text
async fn read_ollama_stream(resp: Response) -> GenerationResult<String> {
    #[derive(Deserialize)]
    struct Chunk {
        #[serde(default)]
        response: String,
        #[serde(default)]
        done: bool,
        error: Option<String>,
    }

    let mut stream = resp.bytes_stream();
    let mut buffer = BytesMut::new();
    let mut text = String::new();

    fn handle_line(line: &[u8], text: &mut String) -> GenerationResult<bool> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(false);
        }
        let chunk: Chunk = serde_json::from_slice(line)
            .map_err(|e| GenerationError::Permanent(format!("malformed stream chunk: {}", e)))?;
        if let Some(error) = chunk.error {
            return Err(GenerationError::Transient(format!("Ollama stream error: {}", error)));
        }
        text.push_str(&chunk.response);
        Ok(chunk.done)
    }

    while let Some(item) = stream.next().await {
        let bytes = item.map_err(request_error)?;
        buffer.extend_from_slice(&bytes);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line = buffer.split_to(pos + 1);
            if handle_line(&line[..pos], &mut text)? {
                return Ok(text);
            }
        }
    }

    // Final line without a trailing newline
    if !buffer.is_empty() {
        handle_line(&buffer[..], &mut text)?;
    }
    Ok(text)
}
