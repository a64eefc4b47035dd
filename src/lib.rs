//! Fenny financial assistant
//!
//! Answers finance questions by alternating between model reasoning and
//! deterministic tool calls (stock quotes, currency conversion), grounded in
//! documents the user uploads to their session.
//!
//! TURN LOOP:
//! INPUT → UPLOAD → START → REASON ⇄ ACT → DONE | ABORTED → APPEND

pub mod agent;
pub mod api;
pub mod classifier;
pub mod config;
pub mod documents;
pub mod error;
pub mod graph;
pub mod llm;
pub mod models;
pub mod parser;
pub mod retrieval;
pub mod session;
pub mod tools;

pub use error::{AgentError, Result};

// Re-export common types
pub use agent::Assistant;
pub use classifier::{QueryClassifier, QueryKind};
pub use config::Settings;
pub use models::*;
pub use session::{SessionId, SessionStore};
