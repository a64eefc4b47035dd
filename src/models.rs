//! Core data models for the assistant

use crate::tools::ToolError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// How a graph run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Done,
    Aborted,
}

//
// ================= Tool trace =================
//

/// One tool call made while producing a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub raw_input: String,
    /// Arguments after binding against the tool schema; `None` when binding failed.
    pub parsed_arguments: Option<serde_json::Value>,
    pub result: ToolResult,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolResult {
    Success { output: String },
    Error { error: ToolError },
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success { .. })
    }
}

impl From<std::result::Result<String, ToolError>> for ToolResult {
    fn from(result: std::result::Result<String, ToolError>) -> Self {
        match result {
            Ok(output) => ToolResult::Success { output },
            Err(error) => ToolResult::Error { error },
        }
    }
}

/// One REASON (and optional ACT) cycle of the graph runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub iteration: u32,
    /// Raw model output for this cycle.
    pub reasoning: String,
    pub decision: StepDecision,
    /// Text fed back into the prompt, if the loop continued.
    pub observation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDecision {
    ToolCall { tool_name: String },
    FinalAnswer,
    Malformed { reason: String, fragment: String },
}

//
// ================= Transcript =================
//

/// One transcript entry. Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub tool_trace: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<TraceStep>,
    /// Set when the loop hit its iteration bound before a final answer.
    #[serde(default)]
    pub truncated: bool,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_trace: Vec::new(),
            steps: Vec::new(),
            truncated: false,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(outcome: &TurnOutcome) -> Self {
        Self {
            role: Role::Assistant,
            content: outcome.answer.clone(),
            tool_trace: outcome.tool_trace.clone(),
            steps: outcome.steps.clone(),
            truncated: outcome.truncated,
            timestamp: Utc::now(),
        }
    }
}

//
// ================= Run result =================
//

/// Result of one graph runtime invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub answer: String,
    pub status: RunStatus,
    pub truncated: bool,
    pub iterations: u32,
    pub tool_trace: Vec<ToolInvocation>,
    pub steps: Vec<TraceStep>,
}

/// What the transport gets back for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReply {
    pub session_id: String,
    pub outcome: TurnOutcome,
    pub file_count: usize,
    pub chunks_added: usize,
}

//
// ================= Uploads =================
//

/// A file as delivered by the transport layer.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type,
            bytes,
        }
    }

    pub fn text(name: impl Into<String>, text: &str) -> Self {
        Self::new(name, Some("text/plain".to_string()), text.as_bytes().to_vec())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Done => "done",
            RunStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}
