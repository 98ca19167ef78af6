//! HTTP client tests against a local axum server playing the external
//! language-model and sentiment endpoints.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::time::Duration;
use vnova::config::{LlmConfig, LlmProvider, ScoreFormat, ScorerConfig};
use vnova::emotion::{ClassificationError, EmotionScorer, HttpEmotionScorer};
use vnova::generation::{GenerationError, LlmClient, Prompt, TextGenerator};
use vnova::EmotionCategory;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn prompt() -> Prompt {
    Prompt {
        system: "You write stories.".to_string(),
        user: "Continue the scene.".to_string(),
        context: Vec::new(),
    }
}

fn llm(provider: LlmProvider, base: &str) -> LlmClient {
    let config = LlmConfig {
        provider,
        model: "test-model".to_string(),
        api_key: Some("secret".to_string()),
        api_base_url: Some(base.to_string()),
        ..LlmConfig::default()
    };
    LlmClient::new(&config, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_ollama_generate() {
    let app = Router::new().route(
        "/api/generate",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["model"], "test-model");
            assert_eq!(body["format"], "json");
            assert_eq!(body["stream"], false);
            assert_eq!(body["system"], "You write stories.");
            Json(json!({"response": "{\"story_text\": \"Hi.\"}", "done": true}))
        }),
    );
    let base = serve(app).await;

    let raw = llm(LlmProvider::Ollama, &base).generate(&prompt()).await.unwrap();
    assert_eq!(raw, "{\"story_text\": \"Hi.\"}");
}

#[tokio::test]
async fn test_ollama_stream_is_buffered() {
    let app = Router::new().route(
        "/api/generate",
        post(|| async {
            // Chunk boundaries deliberately split a line
            let chunks: Vec<Result<&'static str, std::io::Error>> = vec![
                Ok("{\"response\": \"The rain \", \"done\": false}\n{\"resp"),
                Ok("onse\": \"stops.\", \"done\": false}\n"),
                Ok("{\"response\": \"\", \"done\": true}"),
            ];
            Body::from_stream(futures::stream::iter(chunks))
        }),
    );
    let base = serve(app).await;

    let config = LlmConfig {
        api_base_url: Some(base),
        stream: true,
        ..LlmConfig::default()
    };
    let client = LlmClient::new(&config, Duration::from_secs(5)).unwrap();
    assert_eq!(client.generate(&prompt()).await.unwrap(), "The rain stops.");
}

#[tokio::test]
async fn test_openai_chat() {
    let app = Router::new().route(
        "/chat/completions",
        post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            assert_eq!(headers["authorization"], "Bearer secret");
            assert_eq!(body["messages"][0]["role"], "system");
            assert_eq!(body["messages"][1]["content"], "Continue the scene.");
            Json(json!({
                "choices": [{"message": {"content": "She laughs."}, "finish_reason": "stop"}]
            }))
        }),
    );
    let base = serve(app).await;

    let raw = llm(LlmProvider::OpenAI, &base).generate(&prompt()).await.unwrap();
    assert_eq!(raw, "She laughs.");
}

#[tokio::test]
async fn test_openai_status_classification() {
    let app = Router::new()
        .route(
            "/throttled/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response() }),
        )
        .route(
            "/forbidden/chat/completions",
            post(|| async { (StatusCode::FORBIDDEN, "no").into_response() }),
        )
        .route(
            "/filtered/chat/completions",
            post(|| async {
                Json(json!({
                    "choices": [{"message": {"content": null}, "finish_reason": "content_filter"}]
                }))
            }),
        );
    let base = serve(app).await;

    let throttled = llm(LlmProvider::OpenAI, &format!("{}/throttled", base))
        .generate(&prompt())
        .await
        .unwrap_err();
    assert!(throttled.is_transient(), "{}", throttled);

    let forbidden = llm(LlmProvider::OpenAI, &format!("{}/forbidden", base))
        .generate(&prompt())
        .await
        .unwrap_err();
    assert!(matches!(forbidden, GenerationError::Permanent(_)));

    let filtered = llm(LlmProvider::OpenAI, &format!("{}/filtered", base))
        .generate(&prompt())
        .await
        .unwrap_err();
    assert!(matches!(filtered, GenerationError::Permanent(ref m) if m.contains("refusal")));
}

#[tokio::test]
async fn test_gemini_generate_and_block() {
    let app = Router::new()
        .route(
            "/ok/models/*rest",
            post(|Json(body): Json<Value>| async move {
                let text = body["contents"][0]["parts"][0]["text"].as_str().unwrap_or_default();
                assert!(text.starts_with("You write stories."));
                Json(json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": "A bell "}, {"text": "rings."}]},
                        "finishReason": "STOP"
                    }]
                }))
            }),
        )
        .route(
            "/blocked/models/*rest",
            post(|| async { Json(json!({"promptFeedback": {"blockReason": "SAFETY"}})) }),
        );
    let base = serve(app).await;

    let raw = llm(LlmProvider::Gemini, &format!("{}/ok", base))
        .generate(&prompt())
        .await
        .unwrap();
    assert_eq!(raw, "A bell rings.");

    let blocked = llm(LlmProvider::Gemini, &format!("{}/blocked", base))
        .generate(&prompt())
        .await
        .unwrap_err();
    assert!(matches!(blocked, GenerationError::Permanent(_)));
}

#[tokio::test]
async fn test_refused_connection_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = llm(LlmProvider::Ollama, &base).generate(&prompt()).await.unwrap_err();
    assert!(err.is_transient(), "{}", err);
}

#[tokio::test]
async fn test_http_scorer_formats() {
    let app = Router::new()
        .route(
            "/categories",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["text"], "I failed everything");
                Json(json!({"scores": {"sadness": 0.81, "anger": 0.1, "confusion": 0.5}}))
            }),
        )
        .route("/polarity", post(|| async { Json(json!({"polarity": 0.9})) }))
        .route(
            "/broken",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response() }),
        );
    let base = serve(app).await;
    let scorer = |path: &str, format| {
        let config = ScorerConfig {
            endpoint: format!("{}/{}", base, path),
            format,
        };
        HttpEmotionScorer::new(&config, Duration::from_secs(5)).unwrap()
    };

    let scores = scorer("categories", ScoreFormat::Categories)
        .score("I failed everything")
        .await
        .unwrap();
    assert_eq!(scores.get(&EmotionCategory::Sadness), Some(&0.81));
    assert_eq!(scores.len(), 2);

    let scores = scorer("polarity", ScoreFormat::Polarity).score("Yay").await.unwrap();
    let top = scores
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(c, _)| *c);
    assert_eq!(top, Some(EmotionCategory::Joy));

    let err = scorer("broken", ScoreFormat::Categories).score("x").await.unwrap_err();
    assert!(matches!(err, ClassificationError::Api(_)));
}
