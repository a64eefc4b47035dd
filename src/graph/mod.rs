//! Graph runtime
//!
//! Drives one turn through the REASON/ACT loop as an explicit state machine:
//!
//! ```text
//! START -> REASON -> { ACT, DONE, ABORTED }
//! ACT   -> REASON
//! ```
//!
//! Parser and tool failures stay inside the loop as observations. Only
//! engine failures and cancellation leave it as errors.

use crate::classifier::QueryClassifier;
use crate::config::Settings;
use crate::error::AgentError;
use crate::llm::{default_stop_sequences, InferenceEngine, PromptBuilder, ScratchEntry};
use crate::models::{
    RunStatus, StepDecision, ToolInvocation, ToolResult, TraceStep, Turn, TurnOutcome,
};
use crate::parser::{ActionParser, ParsedAction};
use crate::retrieval::{DocumentIndex, Retriever, ScoredChunk};
use crate::tools::ToolRegistry;
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub max_iterations: u32,
    pub max_parse_retries: u32,
    pub inference_timeout: Duration,
    pub stop_sequences: Vec<String>,
}

impl GraphConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_iterations: settings.max_iterations.max(1),
            max_parse_retries: settings.max_parse_retries,
            inference_timeout: settings.inference_timeout,
            stop_sequences: default_stop_sequences(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Start,
    Reason,
    Act,
    Done,
    Aborted,
}

impl Node {
    pub fn is_terminal(self) -> bool {
        matches!(self, Node::Done | Node::Aborted)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Node::Start => "START",
            Node::Reason => "REASON",
            Node::Act => "ACT",
            Node::Done => "DONE",
            Node::Aborted => "ABORTED",
        };
        write!(f, "{}", s)
    }
}

/// Per-invocation loop state. Discarded when the run ends.
#[derive(Debug, Clone)]
pub struct GraphState {
    pub iteration_count: u32,
    pub pending_prompt: String,
    pub last_observation: Option<String>,
    pub status: Node,
}

impl GraphState {
    fn new() -> Self {
        Self {
            iteration_count: 0,
            pending_prompt: String::new(),
            last_observation: None,
            status: Node::Start,
        }
    }
}

/// Everything one run needs from the session.
pub struct TurnInput<'a> {
    pub history: &'a [Turn],
    pub message: &'a str,
    /// Snapshot of the session's index taken after this turn's uploads.
    pub index: Arc<DocumentIndex>,
    pub files_attached: bool,
}

pub struct GraphRuntime {
    engine: Arc<dyn InferenceEngine>,
    tools: Arc<ToolRegistry>,
    retriever: Retriever,
    parser: ActionParser,
    prompts: PromptBuilder,
    config: GraphConfig,
}

impl GraphRuntime {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        tools: Arc<ToolRegistry>,
        retriever: Retriever,
        history_turns: usize,
        config: GraphConfig,
    ) -> Self {
        let parser = ActionParser::new(tools.names());
        let prompts = PromptBuilder::new(&tools.list(), history_turns);
        Self {
            engine,
            tools,
            retriever,
            parser,
            prompts,
            config,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Run the loop to a terminal node.
    pub async fn run(&self, input: TurnInput<'_>, cancel: &CancellationToken) -> Result<TurnOutcome> {
        let mut state = GraphState::new();
        let mut context: Vec<ScoredChunk> = Vec::new();
        let mut scratchpad: Vec<ScratchEntry> = Vec::new();
        let mut tool_trace: Vec<ToolInvocation> = Vec::new();
        let mut steps: Vec<TraceStep> = Vec::new();

        let mut pending_call: Option<(String, String)> = None;
        let mut last_reasoning = String::new();
        let mut consecutive_malformed = 0u32;
        let mut answer = String::new();

        loop {
            debug!(node = %state.status, iteration = state.iteration_count, "Graph transition");

            match state.status {
                // -------------------------------------------------
                // START: retrieval + initial prompt
                // -------------------------------------------------
                Node::Start => {
                    if QueryClassifier::should_retrieve(
                        input.message,
                        input.index.is_empty(),
                        input.files_attached,
                    ) {
                        context = self.retriever.retrieve_default(&input.index, input.message)?;
                        info!(excerpts = context.len(), "Injected document context");
                    }
                    state.pending_prompt =
                        self.prompts
                            .render(input.history, input.message, &context, &scratchpad);
                    state.status = Node::Reason;
                }

                // -------------------------------------------------
                // REASON: one inference call, routed by the parser
                // -------------------------------------------------
                Node::Reason => {
                    if cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    if state.iteration_count >= self.config.max_iterations {
                        warn!(
                            iterations = state.iteration_count,
                            "Iteration bound reached without a final answer"
                        );
                        state.status = Node::Aborted;
                        continue;
                    }
                    state.iteration_count += 1;

                    let output = self.infer(&state.pending_prompt, cancel).await?;
                    last_reasoning = output.clone();

                    match self.parser.parse(&output) {
                        ParsedAction::FinalAnswer { text } => {
                            steps.push(TraceStep {
                                iteration: state.iteration_count,
                                reasoning: output,
                                decision: StepDecision::FinalAnswer,
                                observation: None,
                            });
                            answer = text;
                            state.status = Node::Done;
                        }
                        ParsedAction::ToolCall {
                            name,
                            argument_text,
                        } => {
                            consecutive_malformed = 0;
                            steps.push(TraceStep {
                                iteration: state.iteration_count,
                                reasoning: output,
                                decision: StepDecision::ToolCall {
                                    tool_name: name.clone(),
                                },
                                observation: None,
                            });
                            pending_call = Some((name, argument_text));
                            state.status = Node::Act;
                        }
                        ParsedAction::Malformed { reason, fragment } => {
                            consecutive_malformed += 1;
                            warn!(
                                %reason,
                                attempt = consecutive_malformed,
                                "Model output did not parse"
                            );

                            let observation = self.corrective_observation(&reason.to_string());
                            steps.push(TraceStep {
                                iteration: state.iteration_count,
                                reasoning: output.clone(),
                                decision: StepDecision::Malformed {
                                    reason: reason.to_string(),
                                    fragment,
                                },
                                observation: Some(observation.clone()),
                            });

                            if consecutive_malformed > self.config.max_parse_retries {
                                state.status = Node::Aborted;
                                continue;
                            }

                            scratchpad.push(ScratchEntry {
                                reasoning: output,
                                observation: observation.clone(),
                            });
                            state.last_observation = Some(observation);
                            state.pending_prompt = self.prompts.render(
                                input.history,
                                input.message,
                                &context,
                                &scratchpad,
                            );
                        }
                    }
                }

                // -------------------------------------------------
                // ACT: the tool call runs to completion even if the
                // caller has gone; its result is then discarded
                // -------------------------------------------------
                Node::Act => {
                    let Some((name, argument_text)) = pending_call.take() else {
                        state.status = Node::Reason;
                        continue;
                    };

                    let invocation = self.tools.invoke_traced(&name, &argument_text).await;

                    if cancel.is_cancelled() {
                        info!(tool = %name, "Discarding tool result for cancelled turn");
                        return Err(AgentError::Cancelled);
                    }

                    let observation = match &invocation.result {
                        ToolResult::Success { output } => output.clone(),
                        ToolResult::Error { error } => format!("tool unavailable: {}", error),
                    };
                    info!(
                        tool = %name,
                        success = invocation.result.is_success(),
                        duration_ms = invocation.duration_ms,
                        "Tool step finished"
                    );

                    if let Some(step) = steps.last_mut() {
                        step.observation = Some(observation.clone());
                    }
                    tool_trace.push(invocation);
                    scratchpad.push(ScratchEntry {
                        reasoning: last_reasoning.clone(),
                        observation: observation.clone(),
                    });
                    state.last_observation = Some(observation);
                    state.pending_prompt =
                        self.prompts
                            .render(input.history, input.message, &context, &scratchpad);
                    state.status = Node::Reason;
                }

                Node::Done | Node::Aborted => break,
            }
        }

        let status = if state.status == Node::Done {
            RunStatus::Done
        } else {
            answer = best_effort_answer(
                &last_reasoning,
                state.last_observation.as_deref(),
                state.iteration_count,
            );
            RunStatus::Aborted
        };

        info!(
            %status,
            iterations = state.iteration_count,
            tool_calls = tool_trace.len(),
            "Graph run finished"
        );

        Ok(TurnOutcome {
            answer,
            status,
            truncated: status == RunStatus::Aborted,
            iterations: state.iteration_count,
            tool_trace,
            steps,
        })
    }

    /// One time-boxed inference call. Cancellation wins over a pending call.
    async fn infer(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let call = tokio::time::timeout(
            self.config.inference_timeout,
            self.engine.complete(prompt, &self.config.stop_sequences),
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = call => match result {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => {
                    warn!(engine = self.engine.name(), error = %e, "Inference failed");
                    Err(match e {
                        AgentError::EngineUnavailable(_) => e,
                        other => AgentError::EngineUnavailable(other.to_string()),
                    })
                }
                Err(_) => {
                    warn!(
                        engine = self.engine.name(),
                        timeout_secs = self.config.inference_timeout.as_secs(),
                        "Inference timed out"
                    );
                    Err(AgentError::EngineUnavailable(format!(
                        "{} did not respond within {}s",
                        self.engine.name(),
                        self.config.inference_timeout.as_secs()
                    )))
                }
            },
        }
    }

    fn corrective_observation(&self, reason: &str) -> String {
        format!(
            "invalid format ({}). Reply with either 'Action: <one of {}>' followed by \
             'Action Input: <arguments>', or with 'Final Answer: <answer>'.",
            reason,
            self.tools.names().join(", ")
        )
    }
}

/// Answer for a run that hit a bound: the model's last reasoning with the
/// directive lines removed, falling back to the last observation.
fn best_effort_answer(last_reasoning: &str, last_observation: Option<&str>, iterations: u32) -> String {
    let thought: String = last_reasoning
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            !(lower.starts_with("action:")
                || lower.starts_with("action input:")
                || lower.starts_with("observation:"))
        })
        .map(|line| match line.get(..8) {
            Some(head) if head.eq_ignore_ascii_case("thought:") => line[8..].trim(),
            _ => line,
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let body = if !thought.is_empty() {
        thought
    } else if let Some(observation) = last_observation {
        format!("The last result I obtained was: {}", observation)
    } else {
        "I wasn't able to work out an answer to this request.".to_string()
    };

    format!(
        "{}\n\n(Stopped after {} reasoning steps without reaching a final answer.)",
        body, iterations
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedEngine;
    use crate::retrieval::{HashingEmbedder, EMBEDDING_DIM};
    use crate::tools::{ParamKind, ParamSpec, ToolArgs, ToolError, ToolErrorKind, ToolHandler, ToolSchema};
    use async_trait::async_trait;

    struct EchoPrice;

    #[async_trait]
    impl ToolHandler for EchoPrice {
        async fn call(&self, args: &ToolArgs) -> std::result::Result<String, ToolError> {
            match args.str("ticker") {
                Some("AAPL") => Ok("Apple Inc. (AAPL): 190.12 USD".to_string()),
                Some(other) => Err(ToolError::not_found(format!("no quote for {}", other))),
                None => Err(ToolError::invalid_argument("ticker is required")),
            }
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register(
            "stock_price",
            ToolSchema::new(
                "Latest quote",
                vec![ParamSpec::required("ticker", ParamKind::String, "Ticker")],
            ),
            Arc::new(EchoPrice),
        );
        Arc::new(registry)
    }

    fn runtime(engine: Arc<ScriptedEngine>, config: GraphConfig) -> GraphRuntime {
        let retriever = Retriever::new(Arc::new(HashingEmbedder::default()), 3);
        GraphRuntime::new(engine, registry(), retriever, 6, config)
    }

    fn input(message: &str) -> TurnInput<'_> {
        TurnInput {
            history: &[],
            message,
            index: Arc::new(DocumentIndex::new(EMBEDDING_DIM)),
            files_attached: false,
        }
    }

    #[tokio::test]
    async fn test_tool_call_then_final_answer() {
        let engine = Arc::new(ScriptedEngine::new([
            "Thought: look it up\nAction: stock_price\nAction Input: AAPL\n",
            "Thought: got it\nFinal Answer: Apple trades at 190.12 USD.",
        ]));
        let rt = runtime(engine.clone(), GraphConfig::default());

        let outcome = rt
            .run(input("What is Apple trading at?"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Done);
        assert!(!outcome.truncated);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.answer, "Apple trades at 190.12 USD.");
        assert_eq!(outcome.tool_trace.len(), 1);
        assert_eq!(outcome.tool_trace[0].raw_input, "AAPL");
        assert!(outcome.tool_trace[0].result.is_success());

        let prompts = engine.prompts();
        assert!(prompts[1].contains("Observation: Apple Inc. (AAPL): 190.12 USD"));
    }

    #[tokio::test]
    async fn test_immediate_final_answer() {
        let engine = Arc::new(ScriptedEngine::new(["Final Answer: The price is $190.12"]));
        let outcome = runtime(engine, GraphConfig::default())
            .run(input("price?"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 1);
        assert!(outcome.tool_trace.is_empty());
        assert_eq!(outcome.answer, "The price is $190.12");
    }

    #[tokio::test]
    async fn test_tool_error_becomes_observation_and_bound_aborts() {
        let config = GraphConfig {
            max_iterations: 3,
            ..GraphConfig::default()
        };
        let call = "Thought: try again\nAction: stock_price\nAction Input: ZZZZ";
        let engine = Arc::new(ScriptedEngine::new([call, call, call, call]));

        let outcome = runtime(engine.clone(), config)
            .run(input("price of ZZZZ"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert!(outcome.truncated);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.tool_trace.len(), 3);
        assert!(matches!(
            &outcome.tool_trace[0].result,
            ToolResult::Error { error } if error.kind == ToolErrorKind::NotFound
        ));
        assert!(engine.prompts()[1].contains("Observation: tool unavailable: not found"));
        assert!(outcome.answer.contains("try again"));
        assert_eq!(engine.remaining(), 1);
    }

    #[tokio::test]
    async fn test_malformed_output_is_corrected() {
        let engine = Arc::new(ScriptedEngine::new([
            "I think the answer is obvious.",
            "Final Answer: 42",
        ]));
        let outcome = runtime(engine.clone(), GraphConfig::default())
            .run(input("question"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 2);
        assert!(matches!(outcome.steps[0].decision, StepDecision::Malformed { .. }));
        assert!(engine.prompts()[1].contains("Observation: invalid format"));
    }

    #[tokio::test]
    async fn test_consecutive_malformed_outputs_abort() {
        let config = GraphConfig {
            max_parse_retries: 1,
            ..GraphConfig::default()
        };
        let engine = Arc::new(ScriptedEngine::new(["nonsense", "more nonsense", "Final Answer: late"]));
        let outcome = runtime(engine, config)
            .run(input("question"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert!(outcome.truncated);
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn test_engine_failure_is_fatal() {
        let engine = Arc::new(ScriptedEngine::new(Vec::<String>::new()));
        let result = runtime(engine, GraphConfig::default())
            .run(input("question"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AgentError::EngineUnavailable(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_reason() {
        let engine = Arc::new(ScriptedEngine::new(["Final Answer: unused"]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runtime(engine.clone(), GraphConfig::default())
            .run(input("question"), &cancel)
            .await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert!(engine.prompts().is_empty());
    }

    #[test]
    fn test_best_effort_answer_strips_directives() {
        let answer = best_effort_answer(
            "Thought: The quote service is down.\nAction: stock_price\nAction Input: AAPL",
            None,
            6,
        );
        assert!(answer.starts_with("The quote service is down."));
        assert!(answer.contains("Stopped after 6 reasoning steps"));
    }
}
