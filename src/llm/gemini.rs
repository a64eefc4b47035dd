//! Gemini API inference backend
//!
//! Uses a long-lived reqwest::Client for connection pooling. The rendered
//! prompt goes out as a single user turn; stop sequences are passed through
//! `generationConfig` so the model halts before inventing an observation.

use super::{truncate_at_stop, InferenceEngine};
use crate::error::AgentError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini accepts at most five stop sequences.
const MAX_STOP_SEQUENCES: usize = 5;

/// Reusable Gemini client (connection-pooled)
pub struct GeminiEngine {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiEngine {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self {
            client,
            api_key,
            model,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Point the engine at another `generateContent` host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request(prompt: &str, stop: &[String]) -> GeminiRequest {
        GeminiRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 1024,
                stop_sequences: stop.iter().take(MAX_STOP_SEQUENCES).cloned().collect(),
            },
        }
    }
}

#[async_trait]
impl InferenceEngine for GeminiEngine {
    async fn complete(&self, prompt: &str, stop: &[String]) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(AgentError::EngineUnavailable(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        // Key goes in a header, never in the URL.
        let url = format!("{}/{}:generateContent", self.base_url, self.model);

        info!(model = %self.model, prompt_chars = prompt.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&Self::request(prompt, stop))
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                error!("Gemini API request failed: {}", e);
                AgentError::EngineUnavailable(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(AgentError::EngineUnavailable(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            let e = e.without_url();
            error!("Failed to parse Gemini response: {}", e);
            AgentError::EngineUnavailable(format!("Gemini parse error: {}", e))
        })?;

        let candidate = gemini_response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::EngineUnavailable("No response from Gemini API".to_string()))?;

        let text: String = candidate
            .content
            .parts
            .into_iter()
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        info!(
            finish_reason = candidate.finish_reason.as_deref().unwrap_or("unknown"),
            chars = text.len(),
            "Gemini response received"
        );

        Ok(truncate_at_stop(&text, stop))
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::default_stop_sequences;

    #[test]
    fn test_request_serialization() {
        let request = GeminiEngine::request("What is AAPL trading at?", &default_stop_sequences());
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["contents"][0]["parts"][0]["text"], "What is AAPL trading at?");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(json["generationConfig"]["stopSequences"][0], "\nObservation:");
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Final Answer: hi"}]},"finishReason":"STOP"}]}"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.candidates[0].content.parts[0].text, "Final Answer: hi");
        assert_eq!(parsed.candidates[0].finish_reason.as_deref(), Some("STOP"));
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let engine = GeminiEngine::new(String::new(), "gemini-2.0-flash".into(), Duration::from_secs(1));
        let result = engine.complete("hello", &[]).await;
        assert!(matches!(result, Err(AgentError::EngineUnavailable(_))));
    }

    #[tokio::test]
    async fn test_transport_error_does_not_expose_key() {
        // Nothing listens on port 1, so the request fails before any response.
        let engine = GeminiEngine::new(
            "SECRETKEY123".into(),
            "gemini-2.0-flash".into(),
            Duration::from_millis(200),
        )
        .with_base_url("http://127.0.0.1:1/v1beta/models");

        let err = engine.complete("hi", &[]).await.unwrap_err();
        assert!(matches!(err, AgentError::EngineUnavailable(_)));
        assert!(!err.to_string().contains("SECRETKEY123"));
    }
}
