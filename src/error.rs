//! Error types for the financial assistant

use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Failures that cross a component boundary.
///
/// Parser and tool failures never show up here: the graph runtime turns them
/// into observations inside the loop. What remains is what the caller has to
/// deal with.
#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Turn-level failures
    // =============================

    #[error("Inference engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Session {0} already has a turn in progress")]
    SessionBusy(String),

    #[error("Turn cancelled before completion")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =============================
    // Upload failures
    // =============================

    #[error("Cannot upload more than {limit} files in a conversation ({current} already uploaded, {requested} requested)")]
    QuotaExceeded {
        limit: usize,
        current: usize,
        requested: usize,
    },

    #[error("File {name} is not supported: {reason}")]
    UnsupportedFile { name: String, reason: String },

    #[error("File {name} exceeds size limit ({size} bytes > {limit} bytes)")]
    FileTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("Document error: {0}")]
    Document(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    // =============================
    // Setup
    // =============================

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the caller sent something we refuse, as opposed to us failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidRequest(_)
                | AgentError::QuotaExceeded { .. }
                | AgentError::UnsupportedFile { .. }
                | AgentError::FileTooLarge { .. }
                | AgentError::Document(_)
        )
    }
}
