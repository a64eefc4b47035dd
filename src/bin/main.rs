use fenny_assistant::{Assistant, RunStatus, SessionId, Settings, ToolResult, UploadedFile};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ask one question from the command line.
///
/// Usage: `fenny "<question>" [file ...]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(question) = args.next() else {
        eprintln!("usage: fenny \"<question>\" [file ...]");
        std::process::exit(2);
    };

    let mut files = Vec::new();
    for path in args {
        let bytes = tokio::fs::read(&path).await?;
        let name = std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(path);
        files.push(UploadedFile::new(name, None, bytes));
    }

    let settings = Settings::from_env()?;
    let assistant = Assistant::from_settings(&settings);

    info!(question = %question, files = files.len(), "Running one-shot turn");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let reply = assistant
        .handle_turn(SessionId::generate(), &question, files, &cancel)
        .await?;

    if !reply.outcome.tool_trace.is_empty() {
        println!("=== TOOL CALLS ===");
        for (i, call) in reply.outcome.tool_trace.iter().enumerate() {
            let result = match &call.result {
                ToolResult::Success { output } => output.clone(),
                ToolResult::Error { error } => format!("error: {}", error),
            };
            println!(
                "  {}: {}({}) [{} ms] -> {}",
                i + 1,
                call.tool_name,
                call.raw_input,
                call.duration_ms,
                result
            );
        }
        println!();
    }

    println!("=== ANSWER ===");
    println!("{}", reply.outcome.answer);
    if reply.outcome.status == RunStatus::Aborted {
        println!("\n(truncated after {} iterations)", reply.outcome.iterations);
    }

    Ok(())
}
