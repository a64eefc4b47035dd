use fenny_assistant::config::InferenceBackend;
use fenny_assistant::{api::start_server, Assistant, Settings};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    let settings = Arc::new(Settings::from_env()?);

    // Initialize tracing
    let default_filter = if settings.debug {
        "debug,tower_http=debug"
    } else {
        "info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if settings.inference_backend == InferenceBackend::Gemini && settings.gemini_api_key.is_empty() {
        eprintln!("⚠️  GEMINI_API_KEY not set in .env");
        eprintln!("📌 Set FENNY_INFERENCE_BACKEND=llama to use a local llama.cpp server instead");
    }

    info!("🚀 {} - API Server", settings.app_name);
    info!("📍 Port: {}", settings.api_port);

    let assistant = Arc::new(Assistant::from_settings(&settings));

    // Idle session sweep
    let sessions = Arc::clone(assistant.sessions());
    let sweep_every = settings.session_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sessions.evict_expired().await;
        }
    });

    info!("✅ Assistant initialized");
    info!("📡 Starting API server...");

    start_server(assistant, settings).await?;

    Ok(())
}
