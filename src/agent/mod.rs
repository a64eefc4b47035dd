//! Assistant - one entry point per user turn
//!
//! INPUT → (UPLOAD) → START → REASON ⇄ ACT → DONE | ABORTED → APPEND

use crate::config::Settings;
use crate::error::AgentError;
use crate::graph::{GraphConfig, GraphRuntime, TurnInput};
use crate::llm::{create_engine, InferenceEngine};
use crate::models::{Turn, TurnReply, UploadedFile};
use crate::retrieval::{Embedder, HashingEmbedder, Retriever};
use crate::session::{SessionId, SessionStore};
use crate::tools::{create_default_registry, ToolRegistry};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wires the session store to the graph runtime.
pub struct Assistant {
    sessions: Arc<SessionStore>,
    runtime: GraphRuntime,
}

impl Assistant {
    pub fn new(sessions: Arc<SessionStore>, runtime: GraphRuntime) -> Self {
        Self { sessions, runtime }
    }

    /// Production wiring: configured inference backend and HTTP tools.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_components(
            settings,
            create_engine(settings),
            Arc::new(create_default_registry(settings)),
        )
    }

    /// Wiring with an explicit engine and registry.
    pub fn with_components(
        settings: &Settings,
        engine: Arc<dyn InferenceEngine>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        let sessions = Arc::new(SessionStore::from_settings(settings, Arc::clone(&embedder)));
        let retriever = Retriever::new(embedder, settings.retrieval_top_k);
        let runtime = GraphRuntime::new(
            engine,
            tools,
            retriever,
            settings.history_turns,
            GraphConfig::from_settings(settings),
        );
        Self::new(sessions, runtime)
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.runtime.tools().names()
    }

    /// Handle one user message, with any files sent alongside it.
    ///
    /// The user and assistant turns are appended together once the run
    /// reaches DONE or ABORTED. Engine failures and cancellation leave the
    /// transcript untouched.
    pub async fn handle_turn(
        &self,
        session_id: SessionId,
        message: &str,
        files: Vec<UploadedFile>,
        cancel: &CancellationToken,
    ) -> Result<TurnReply> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AgentError::InvalidRequest("message must not be empty".to_string()));
        }

        let start = Instant::now();
        let guard = self.sessions.begin_turn(&session_id).await?;

        info!(
            session_id = %session_id,
            files = files.len(),
            "Assistant: starting turn"
        );

        // === UPLOAD === must finish before the first REASON
        let files_attached = !files.is_empty();
        let chunks_added = if files_attached {
            self.sessions.attach_documents(&guard, files).await?
        } else {
            0
        };

        let history = guard.transcript().await;
        let index = guard.index().await;

        // === RUN ===
        let outcome = self
            .runtime
            .run(
                TurnInput {
                    history: &history,
                    message,
                    index,
                    files_attached,
                },
                cancel,
            )
            .await
            .map_err(|e| {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Turn failed; transcript left unchanged"
                );
                e
            })?;

        // === APPEND ===
        guard
            .append_turns([Turn::user(message), Turn::assistant(&outcome)])
            .await;
        let file_count = guard.file_count().await;

        info!(
            session_id = %session_id,
            status = %outcome.status,
            iterations = outcome.iterations,
            tool_calls = outcome.tool_trace.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Assistant: turn complete"
        );

        Ok(TurnReply {
            session_id: session_id.to_string(),
            outcome,
            file_count,
            chunks_added,
        })
    }

    /// Forget a session. Returns whether it existed.
    pub async fn clear(&self, session_id: &SessionId) -> bool {
        self.sessions.clear(session_id).await
    }
}
