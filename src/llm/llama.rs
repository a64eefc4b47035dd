//! llama.cpp server backend (`POST /completion`).

use super::{truncate_at_stop, InferenceEngine};
use crate::error::AgentError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

const N_PREDICT: u32 = 512;
const TEMPERATURE: f32 = 0.7;
const TOP_P: f32 = 0.95;

pub struct LlamaServerEngine {
    client: Client,
    base_url: String,
}

impl LlamaServerEngine {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    stop: &'a [String],
    n_predict: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
}

#[async_trait]
impl InferenceEngine for LlamaServerEngine {
    async fn complete(&self, prompt: &str, stop: &[String]) -> Result<String> {
        let url = format!("{}/completion", self.base_url);
        let request = CompletionRequest {
            prompt,
            stop,
            n_predict: N_PREDICT,
            temperature: TEMPERATURE,
            top_p: TOP_P,
        };

        info!(%url, prompt_chars = prompt.len(), "Calling llama.cpp server");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("llama.cpp request failed: {}", e);
                AgentError::EngineUnavailable(format!("llama.cpp server error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::EngineUnavailable(format!(
                "llama.cpp server returned {}: {}",
                status, body
            )));
        }

        let completion: CompletionResponse = response.json().await.map_err(|e| {
            AgentError::EngineUnavailable(format!("llama.cpp parse error: {}", e))
        })?;

        Ok(truncate_at_stop(&completion.content, stop))
    }

    fn name(&self) -> &str {
        "llama.cpp"
    }
}
