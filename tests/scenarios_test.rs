//! End-to-end turns through the assistant with a scripted model and an
//! in-process quote backend.

use async_trait::async_trait;
use fenny_assistant::llm::ScriptedEngine;
use fenny_assistant::retrieval::{HashingEmbedder, Retriever};
use fenny_assistant::tools::{
    stocks, QuoteBackend, StockPriceTool, StockQuote, ToolError, ToolErrorKind, ToolRegistry,
};
use fenny_assistant::{
    AgentError, Assistant, RunStatus, SessionId, Settings, ToolResult, UploadedFile,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

struct Quotes {
    delay: Duration,
    finished: Arc<AtomicBool>,
}

impl Quotes {
    fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl QuoteBackend for Quotes {
    async fn quote(&self, ticker: &str) -> Result<StockQuote, ToolError> {
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        match ticker {
            "AAPL" => Ok(StockQuote {
                ticker: "AAPL".into(),
                name: Some("Apple Inc.".into()),
                price: Some(190.12),
                currency: Some("USD".into()),
                day_low: None,
                day_high: None,
                volume: None,
                market_cap: None,
            }),
            other => Err(ToolError::not_found(format!("no quote for {}", other))),
        }
    }
}

fn settings() -> Settings {
    Settings {
        max_iterations: 4,
        ..Settings::default()
    }
}

fn assistant_with(engine: Arc<ScriptedEngine>, quotes: Quotes) -> Arc<Assistant> {
    let settings = settings();
    let mut registry = ToolRegistry::new(Duration::from_secs(2));
    registry.register(
        stocks::TOOL_NAME,
        StockPriceTool::schema(),
        Arc::new(StockPriceTool::new(Arc::new(quotes))),
    );
    Arc::new(Assistant::with_components(&settings, engine, Arc::new(registry)))
}

fn report(name: &str, body: &str) -> UploadedFile {
    UploadedFile::text(name, body)
}

#[tokio::test]
async fn scenario_a_tool_call_then_answer() {
    let engine = Arc::new(ScriptedEngine::new([
        "Action: stock_price\nAction Input: AAPL\n",
        "Thought: I have the quote.\nFinal Answer: Apple is trading at $190.12.",
    ]));
    let assistant = assistant_with(engine.clone(), Quotes::instant());

    let reply = assert_ok!(
        assistant
            .handle_turn(
                SessionId::from("a"),
                "What is Apple trading at?",
                vec![],
                &CancellationToken::new()
            )
            .await
    );

    assert_eq!(reply.outcome.status, RunStatus::Done);
    assert_eq!(reply.outcome.tool_trace.len(), 1);
    let call = &reply.outcome.tool_trace[0];
    assert_eq!(call.tool_name, "stock_price");
    assert_eq!(call.raw_input, "AAPL");
    assert_eq!(
        call.parsed_arguments.as_ref().map(|v| v["ticker"].clone()),
        Some(serde_json::json!("AAPL"))
    );
    assert!(engine.prompts()[1].contains("Observation: Apple Inc. (AAPL): 190.12 USD"));
}

#[tokio::test]
async fn scenario_b_immediate_answer() {
    let engine = Arc::new(ScriptedEngine::new(["Final Answer: The price is $190.12"]));
    let assistant = assistant_with(engine, Quotes::instant());

    let reply = assert_ok!(
        assistant
            .handle_turn(SessionId::from("b"), "AAPL price?", vec![], &CancellationToken::new())
            .await
    );

    assert_eq!(reply.outcome.iterations, 1);
    assert!(reply.outcome.tool_trace.is_empty());
    assert_eq!(reply.outcome.answer, "The price is $190.12");
}

#[tokio::test]
async fn scenario_c_not_found_until_bound() {
    let call = "Thought: maybe the ticker is right this time\nAction: stock_price\nAction Input: NOPE";
    let engine = Arc::new(ScriptedEngine::new([call; 8]));
    let assistant = assistant_with(engine, Quotes::instant());
    let id = SessionId::from("c");

    let reply = assert_ok!(
        assistant
            .handle_turn(id.clone(), "Price of NOPE?", vec![], &CancellationToken::new())
            .await
    );

    assert_eq!(reply.outcome.status, RunStatus::Aborted);
    assert!(reply.outcome.truncated);
    assert_eq!(reply.outcome.iterations, 4);
    assert!(reply.outcome.tool_trace.iter().all(|c| matches!(
        &c.result,
        ToolResult::Error { error } if error.kind == ToolErrorKind::NotFound
    )));

    // Aborted turns are still recorded, with the flag.
    let snapshot = assistant.sessions().snapshot(&id).await.unwrap();
    assert_eq!(snapshot.transcript.len(), 2);
    assert!(snapshot.transcript[1].truncated);
}

#[tokio::test]
async fn scenario_d_fourth_upload_rejected() {
    let engine = Arc::new(ScriptedEngine::new([
        "Final Answer: Got your reports.",
        "Final Answer: unused",
    ]));
    let assistant = assistant_with(engine.clone(), Quotes::instant());
    let id = SessionId::from("d");

    let files = vec![
        report("q1.txt", "First quarter revenue was 3.1 billion."),
        report("q2.txt", "Second quarter revenue was 3.6 billion."),
        report("q3.txt", "Third quarter revenue was 4.2 billion."),
    ];
    let reply = assert_ok!(
        assistant
            .handle_turn(id.clone(), "Here are my reports", files, &CancellationToken::new())
            .await
    );
    assert_eq!(reply.file_count, 3);

    let err = assert_err!(
        assistant
            .handle_turn(
                id.clone(),
                "One more",
                vec![report("q4.txt", "Fourth quarter revenue was 5.0 billion.")],
                &CancellationToken::new()
            )
            .await
    );
    assert!(matches!(err, AgentError::QuotaExceeded { limit: 3, current: 3, requested: 1 }));

    let snapshot = assistant.sessions().snapshot(&id).await.unwrap();
    assert_eq!(snapshot.file_count, 3);
    assert_eq!(snapshot.transcript.len(), 2);

    let index = assistant.sessions().index(&id).await.unwrap();
    let retriever = Retriever::new(Arc::new(HashingEmbedder::default()), 5);
    let hits = retriever.retrieve(&index, "third quarter revenue", 3).unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].chunk.source_name, "q3.txt");
}

#[tokio::test]
async fn engine_failure_leaves_transcript_untouched() {
    let engine = Arc::new(ScriptedEngine::new(["Final Answer: first"]));
    engine.push_failure("backend crashed");
    let assistant = assistant_with(engine, Quotes::instant());
    let id = SessionId::from("e");

    assert_ok!(
        assistant
            .handle_turn(id.clone(), "hello", vec![], &CancellationToken::new())
            .await
    );
    let err = assert_err!(
        assistant
            .handle_turn(id.clone(), "hello again", vec![], &CancellationToken::new())
            .await
    );
    assert!(matches!(err, AgentError::EngineUnavailable(_)));

    let snapshot = assistant.sessions().snapshot(&id).await.unwrap();
    assert_eq!(snapshot.transcript.len(), 2);
    assert_eq!(snapshot.transcript[0].content, "hello");
}

#[tokio::test]
async fn history_is_rendered_on_the_next_turn() {
    let engine = Arc::new(ScriptedEngine::new([
        "Final Answer: Apple closed at 190.12.",
        "Final Answer: That was Apple.",
    ]));
    let assistant = assistant_with(engine.clone(), Quotes::instant());
    let id = SessionId::from("h");

    for message in ["How did Apple close?", "Which company was that?"] {
        assert_ok!(
            assistant
                .handle_turn(id.clone(), message, vec![], &CancellationToken::new())
                .await
        );
    }

    let second_prompt = &engine.prompts()[1];
    assert!(second_prompt.contains("How did Apple close? [/INST]"));
    assert!(second_prompt.contains("Apple closed at 190.12. </s><s>[INST]"));
}

#[tokio::test]
async fn busy_session_rejects_second_request() {
    let engine = Arc::new(
        ScriptedEngine::new(["Final Answer: slow", "Final Answer: other"])
            .with_delay(Duration::from_millis(300)),
    );
    let assistant = assistant_with(engine, Quotes::instant());

    let first = {
        let assistant = Arc::clone(&assistant);
        tokio::spawn(async move {
            assistant
                .handle_turn(SessionId::from("busy"), "first", vec![], &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = assistant
        .handle_turn(SessionId::from("busy"), "second", vec![], &CancellationToken::new())
        .await;
    assert!(matches!(second, Err(AgentError::SessionBusy(_))));

    // Another session is unaffected.
    assert_ok!(
        assistant
            .handle_turn(SessionId::from("other"), "hi", vec![], &CancellationToken::new())
            .await
    );

    assert_ok!(first.await.unwrap());
}

#[tokio::test]
async fn cancellation_discards_in_flight_tool_result() {
    let engine = Arc::new(ScriptedEngine::new([
        "Action: stock_price\nAction Input: AAPL",
        "Final Answer: never reached",
    ]));
    let quotes = Quotes {
        delay: Duration::from_millis(200),
        finished: Arc::new(AtomicBool::new(false)),
    };
    let finished = Arc::clone(&quotes.finished);
    let assistant = assistant_with(engine.clone(), quotes);
    let id = SessionId::from("cancel");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = assistant.handle_turn(id.clone(), "AAPL?", vec![], &cancel).await;

    assert!(matches!(result, Err(AgentError::Cancelled)));
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(engine.prompts().len(), 1);
    assert!(assistant.sessions().snapshot(&id).await.unwrap().transcript.is_empty());
}

#[tokio::test]
async fn follow_up_metric_question_retrieves_uploaded_context() {
    let engine = Arc::new(ScriptedEngine::new([
        "Final Answer: Noted.",
        "Final Answer: Net revenue was 4.2 billion.",
    ]));
    let assistant = assistant_with(engine.clone(), Quotes::instant());
    let id = SessionId::from("f");

    assert_ok!(
        assistant
            .handle_turn(
                id.clone(),
                "Here you go",
                vec![report("q3.txt", "Net revenue for the third quarter was 4.2 billion.")],
                &CancellationToken::new()
            )
            .await
    );
    assert_ok!(
        assistant
            .handle_turn(id, "What was net revenue?", vec![], &CancellationToken::new())
            .await
    );

    assert!(engine.prompts()[1].contains("[Document excerpt 1 | doc=q3.txt #0"));
}
