//! Inference engines
//!
//! The graph runtime only needs "prompt in, text out". Backends live behind
//! [`InferenceEngine`] so tests can script the model.

pub mod gemini;
pub mod llama;
pub mod prompt;

pub use gemini::GeminiEngine;
pub use llama::LlamaServerEngine;
pub use prompt::{PromptBuilder, ScratchEntry};

use crate::config::{InferenceBackend, Settings};
use crate::error::AgentError;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Stop sequences sent with every completion request.
pub const DEFAULT_STOP_SEQUENCES: &[&str] = &["\nObservation:", "</s>", "User:"];

pub fn default_stop_sequences() -> Vec<String> {
    DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect()
}

/// Text completion backend.
///
/// Failures are reported as [`AgentError::EngineUnavailable`].
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn complete(&self, prompt: &str, stop: &[String]) -> Result<String>;

    fn name(&self) -> &str;
}

/// Build the engine selected by `FENNY_INFERENCE_BACKEND`.
pub fn create_engine(settings: &Settings) -> Arc<dyn InferenceEngine> {
    match settings.inference_backend {
        InferenceBackend::Gemini => {
            info!(model = %settings.gemini_model, "Using Gemini inference backend");
            Arc::new(GeminiEngine::new(
                settings.gemini_api_key.clone(),
                settings.gemini_model.clone(),
                settings.inference_timeout,
            ))
        }
        InferenceBackend::Llama => {
            info!(url = %settings.llama_server_url, "Using llama.cpp inference backend");
            Arc::new(LlamaServerEngine::new(
                settings.llama_server_url.clone(),
                settings.inference_timeout,
            ))
        }
    }
}

/// Cut a completion at the first stop sequence, for backends that echo it.
pub(crate) fn truncate_at_stop(text: &str, stop: &[String]) -> String {
    let cut = stop
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
        .unwrap_or(text.len());
    text[..cut].to_string()
}

//
// ================= Scripted engine =================
//

enum Scripted {
    Reply(String),
    Fail(String),
}

/// Replays canned completions in order and records every prompt it sees.
/// Once the script runs out it reports the engine as unavailable.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Scripted>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let engine = Self::default();
        for reply in replies {
            engine.push_reply(reply);
        }
        engine
    }

    /// Wait this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Scripted::Reply(reply.into()));
        }
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Scripted::Fail(message.into()));
        }
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn complete(&self, prompt: &str, _stop: &[String]) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Reply(text)) => Ok(text),
            Some(Scripted::Fail(message)) => Err(AgentError::EngineUnavailable(message)),
            None => Err(AgentError::EngineUnavailable(
                "scripted engine has no more replies".to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_engine_replays_then_fails() {
        let engine = ScriptedEngine::new(["first", "second"]);
        engine.push_failure("backend down");

        assert_eq!(engine.complete("p1", &[]).await.unwrap(), "first");
        assert_eq!(engine.complete("p2", &[]).await.unwrap(), "second");
        assert!(matches!(
            engine.complete("p3", &[]).await,
            Err(AgentError::EngineUnavailable(m)) if m == "backend down"
        ));
        assert!(matches!(
            engine.complete("p4", &[]).await,
            Err(AgentError::EngineUnavailable(_))
        ));
        assert_eq!(engine.prompts(), vec!["p1", "p2", "p3", "p4"]);
    }

    #[test]
    fn test_truncate_at_stop() {
        let stop = default_stop_sequences();
        let text = "Action: stock_price\nAction Input: AAPL\nObservation: made up";
        assert_eq!(
            truncate_at_stop(text, &stop),
            "Action: stock_price\nAction Input: AAPL"
        );
        assert_eq!(truncate_at_stop("no stop here", &stop), "no stop here");
    }
}
