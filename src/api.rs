//! REST API Server for the financial assistant
//!
//! Exposes chat, clear and health endpoints over HTTP.
//! Chat requests are multipart so documents can ride along with a message.

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::Assistant;
use crate::config::Settings;
use crate::error::AgentError;
use crate::models::{ToolResult, TurnReply, UploadedFile};
use crate::session::SessionId;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Default)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Deserialize)]
pub struct ClearRequest {
    pub session_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Condensed tool call for clients.
#[derive(Debug, Serialize)]
pub struct ToolTraceSummary {
    pub tool: String,
    pub input: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ChatResponseData {
    pub session_id: String,
    pub response: String,
    pub status: String,
    pub truncated: bool,
    pub iterations: u32,
    pub tool_trace: Vec<ToolTraceSummary>,
    pub file_count: usize,
}

impl From<TurnReply> for ChatResponseData {
    fn from(reply: TurnReply) -> Self {
        let tool_trace = reply
            .outcome
            .tool_trace
            .iter()
            .map(|call| {
                let (output, error) = match &call.result {
                    ToolResult::Success { output } => (Some(output.clone()), None),
                    ToolResult::Error { error } => (None, Some(error.to_string())),
                };
                ToolTraceSummary {
                    tool: call.tool_name.clone(),
                    input: call.raw_input.clone(),
                    success: call.result.is_success(),
                    output,
                    error,
                    duration_ms: call.duration_ms,
                }
            })
            .collect();

        Self {
            session_id: reply.session_id,
            response: reply.outcome.answer,
            status: reply.outcome.status.to_string(),
            truncated: reply.outcome.truncated,
            iterations: reply.outcome.iterations,
            tool_trace,
            file_count: reply.file_count,
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub assistant: Arc<Assistant>,
    pub settings: Arc<Settings>,
}

/// =============================
/// Error Mapping
/// =============================

pub fn status_for(err: &AgentError) -> StatusCode {
    match err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        AgentError::SessionBusy(_) => StatusCode::CONFLICT,
        AgentError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Server-side failure details are only exposed in debug mode.
fn error_response(err: &AgentError, debug: bool) -> (StatusCode, Json<ApiResponse>) {
    let status = status_for(err);
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    } else {
        warn!(error = %err, "Request rejected");
    }

    let message = match err {
        _ if debug || !status.is_server_error() => err.to_string(),
        AgentError::EngineUnavailable(_) => {
            "The language model is unavailable right now; please try again".to_string()
        }
        _ => "Internal server error".to_string(),
    };
    (status, Json(ApiResponse::error(message)))
}

async fn read_chat_form(mut multipart: Multipart) -> Result<ChatRequest, AgentError> {
    let mut request = ChatRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AgentError::InvalidRequest(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "message" => {
                request.message = field
                    .text()
                    .await
                    .map_err(|e| AgentError::InvalidRequest(e.to_string()))?;
            }
            "session_id" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AgentError::InvalidRequest(e.to_string()))?;
                request.session_id = Some(value).filter(|v| !v.trim().is_empty());
            }
            "files" | "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AgentError::InvalidRequest(format!("{}: {}", file_name, e)))?;
                // Browsers send an empty part when no file was picked.
                if !bytes.is_empty() {
                    request
                        .files
                        .push(UploadedFile::new(file_name, content_type, bytes.to_vec()));
                }
            }
            other => warn!(field = %other, "Ignoring unknown form field"),
        }
    }

    if request.message.trim().is_empty() {
        return Err(AgentError::InvalidRequest("message is required".to_string()));
    }
    Ok(request)
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.assistant.sessions().session_count().await,
        "max_files_per_conversation": state.settings.max_files_per_session,
        "app_name": state.settings.app_name,
        "tools": state.assistant.tool_names(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> (StatusCode, Json<ApiResponse>) {
    let request = match read_chat_form(multipart).await {
        Ok(request) => request,
        Err(e) => return error_response(&e, state.settings.debug),
    };

    let session_id = SessionId::resolve(request.session_id.as_deref());
    info!(
        session_id = %session_id,
        files = request.files.len(),
        "Received chat request"
    );

    // The turn runs on its own task. If the client goes away this handler
    // is dropped, the guard fires and the loop stops at its next check.
    let cancel = CancellationToken::new();
    let disconnect = cancel.clone().drop_guard();

    let assistant = Arc::clone(&state.assistant);
    let task = tokio::spawn(async move {
        assistant
            .handle_turn(session_id, &request.message, request.files, &cancel)
            .await
    });

    let result = task.await;
    disconnect.disarm();

    match result {
        Ok(Ok(reply)) => (
            StatusCode::OK,
            Json(ApiResponse::success(ChatResponseData::from(reply))),
        ),
        Ok(Err(e)) => error_response(&e, state.settings.debug),
        Err(join_error) => {
            error!(error = %join_error, "Turn task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("Internal error while processing the turn".into())),
            )
        }
    }
}

/// =============================
/// Clear Endpoint
/// =============================

async fn clear_handler(
    State(state): State<ApiState>,
    Form(req): Form<ClearRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(id) = req.session_id.filter(|id| !id.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "status": "error",
                "message": "session_id is required"
            })),
        );
    };

    let existed = state.assistant.clear(&SessionId::resolve(Some(&id))).await;
    info!(session_id = %id, existed, "Clear requested");

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "success",
            "message": "Conversation cleared"
        })),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(assistant: Arc<Assistant>, settings: Arc<Settings>) -> Router {
    let prefix = settings.api_prefix.trim_end_matches('/').to_string();
    // Room for a full quota of files plus the text fields.
    let body_limit = settings
        .max_file_size
        .saturating_mul(settings.max_files_per_session.max(1))
        .saturating_add(1024 * 1024);

    let state = ApiState {
        assistant,
        settings,
    };

    Router::new()
        .route(&format!("{}/health", prefix), get(health))
        .route(&format!("{}/chat", prefix), post(chat_handler))
        .route(&format!("{}/clear", prefix), post(clear_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    assistant: Arc<Assistant>,
    settings: Arc<Settings>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let port = settings.api_port;
    let router = create_router(assistant, settings);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
