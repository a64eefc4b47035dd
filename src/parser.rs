//! Action parser
//!
//! Turns raw model text into a tool call, a final answer, or a diagnosable
//! malformed result. Line-oriented, whitespace tolerant, no side effects.
//! `Final Answer` wins over `Action` when both appear.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

const ACTION: &str = "action:";
const ACTION_INPUT: &str = "action input:";
const FINAL_ANSWER: &str = "final answer:";
const THOUGHT: &str = "thought:";
const OBSERVATION: &str = "observation:";

/// Longest fragment kept for diagnostics.
const MAX_FRAGMENT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParsedAction {
    ToolCall { name: String, argument_text: String },
    FinalAnswer { text: String },
    Malformed { reason: MalformedReason, fragment: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MalformedReason {
    /// Neither an `Action` nor a `Final Answer` line.
    NoDirective,
    /// `Action` without a following `Action Input`.
    MissingActionInput,
    /// `Action Input` with no `Action` before it.
    MissingAction,
    /// `Action` names a tool that is not registered.
    UnknownTool(String),
    /// `Final Answer:` with nothing after it.
    EmptyFinalAnswer,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::NoDirective => {
                write!(f, "no 'Action:' or 'Final Answer:' line found")
            }
            MalformedReason::MissingActionInput => {
                write!(f, "'Action:' line is not followed by an 'Action Input:' line")
            }
            MalformedReason::MissingAction => {
                write!(f, "'Action Input:' line has no preceding 'Action:' line")
            }
            MalformedReason::UnknownTool(name) => write!(f, "unknown tool '{}'", name),
            MalformedReason::EmptyFinalAnswer => write!(f, "'Final Answer:' is empty"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Thought,
    Action,
    ActionInput,
    FinalAnswer,
    Observation,
}

/// Split a line into its directive and the text after the colon.
fn directive(line: &str) -> Option<(Directive, &str)> {
    let trimmed = line.trim_start();
    // `Action Input:` must be tested before `Action:`.
    let table = [
        (ACTION_INPUT, Directive::ActionInput),
        (ACTION, Directive::Action),
        (FINAL_ANSWER, Directive::FinalAnswer),
        (THOUGHT, Directive::Thought),
        (OBSERVATION, Directive::Observation),
    ];
    table.iter().find_map(|(prefix, kind)| {
        let head = trimmed.get(..prefix.len())?;
        head.eq_ignore_ascii_case(prefix)
            .then(|| (*kind, trimmed[prefix.len()..].trim()))
    })
}

/// Parser bound to the set of registered tool names.
#[derive(Debug, Clone)]
pub struct ActionParser {
    tools: HashSet<String>,
}

impl ActionParser {
    pub fn new<I, S>(tool_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tool_names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn parse(&self, output: &str) -> ParsedAction {
        let lines: Vec<&str> = output.lines().collect();

        if let Some(idx) = find(&lines, 0, Directive::FinalAnswer) {
            let text = collect_block(&lines, idx);
            if text.is_empty() {
                return malformed(MalformedReason::EmptyFinalAnswer, lines[idx]);
            }
            return ParsedAction::FinalAnswer { text };
        }

        let Some(action_idx) = find(&lines, 0, Directive::Action) else {
            return match find(&lines, 0, Directive::ActionInput) {
                Some(idx) => malformed(MalformedReason::MissingAction, lines[idx]),
                None => malformed(MalformedReason::NoDirective, output),
            };
        };

        let name = directive(lines[action_idx])
            .map(|(_, rest)| clean_tool_name(rest))
            .unwrap_or_default();

        if !self.tools.contains(&name) {
            return malformed(MalformedReason::UnknownTool(name), lines[action_idx]);
        }

        // The input must belong to this action, not to a later one.
        let next_action = find(&lines, action_idx + 1, Directive::Action).unwrap_or(lines.len());
        match find(&lines[..next_action], action_idx + 1, Directive::ActionInput) {
            Some(input_idx) => ParsedAction::ToolCall {
                name,
                argument_text: collect_block(&lines, input_idx),
            },
            None => malformed(MalformedReason::MissingActionInput, lines[action_idx]),
        }
    }
}

fn find(lines: &[&str], from: usize, wanted: Directive) -> Option<usize> {
    (from..lines.len()).find(|&i| matches!(directive(lines[i]), Some((kind, _)) if kind == wanted))
}

/// Text after the directive on `idx`, continued over following lines until
/// the next directive.
fn collect_block(lines: &[&str], idx: usize) -> String {
    let first = directive(lines[idx]).map(|(_, rest)| rest).unwrap_or_default();
    let mut block = vec![first];
    block.extend(
        lines[idx + 1..]
            .iter()
            .take_while(|line| directive(line).is_none())
            .map(|line| line.trim_end()),
    );
    block.join("\n").trim().to_string()
}

fn clean_tool_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| matches!(c, '`' | '"' | '\'' | '[' | ']' | '*'))
        .trim()
        .to_string()
}

fn malformed(reason: MalformedReason, fragment: &str) -> ParsedAction {
    ParsedAction::Malformed {
        reason,
        fragment: fragment.trim().chars().take(MAX_FRAGMENT_CHARS).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ActionParser {
        ActionParser::new(["stock_price", "currency_exchange"])
    }

    #[test]
    fn test_tool_call() {
        let parsed = parser().parse("Action: stock_price\nAction Input: AAPL\n");
        assert_eq!(
            parsed,
            ParsedAction::ToolCall {
                name: "stock_price".into(),
                argument_text: "AAPL".into()
            }
        );
    }

    #[test]
    fn test_tolerates_whitespace_case_and_thoughts() {
        let output = "Thought: I need a rate.\n   ACTION:   `currency_exchange`  \n  action input:  USD, EUR, 5  \n";
        assert_eq!(
            parser().parse(output),
            ParsedAction::ToolCall {
                name: "currency_exchange".into(),
                argument_text: "USD, EUR, 5".into()
            }
        );
    }

    #[test]
    fn test_final_answer_spans_lines() {
        let parsed = parser().parse("Thought: done\nFinal Answer: The price is $190.12\nper share.");
        assert_eq!(
            parsed,
            ParsedAction::FinalAnswer {
                text: "The price is $190.12\nper share.".into()
            }
        );
    }

    #[test]
    fn test_final_answer_wins_over_action() {
        let output = "Action: stock_price\nAction Input: AAPL\nFinal Answer: No lookup needed.";
        assert_eq!(
            parser().parse(output),
            ParsedAction::FinalAnswer {
                text: "No lookup needed.".into()
            }
        );
    }

    #[test]
    fn test_action_without_input_is_malformed() {
        match parser().parse("Action: stock_price\nThought: hmm") {
            ParsedAction::Malformed { reason, fragment } => {
                assert_eq!(reason, MalformedReason::MissingActionInput);
                assert_eq!(fragment, "Action: stock_price");
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_input_belongs_to_first_action_only() {
        let output = "Action: stock_price\nAction: currency_exchange\nAction Input: USD";
        assert!(matches!(
            parser().parse(output),
            ParsedAction::Malformed {
                reason: MalformedReason::MissingActionInput,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_tool_is_not_guessed() {
        match parser().parse("Action: stock_prices\nAction Input: AAPL") {
            ParsedAction::Malformed { reason, .. } => {
                assert_eq!(reason, MalformedReason::UnknownTool("stock_prices".into()))
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_other_malformed_shapes() {
        assert!(matches!(
            parser().parse("I think Apple is doing fine."),
            ParsedAction::Malformed {
                reason: MalformedReason::NoDirective,
                ..
            }
        ));
        assert!(matches!(
            parser().parse("Action Input: AAPL"),
            ParsedAction::Malformed {
                reason: MalformedReason::MissingAction,
                ..
            }
        ));
        assert!(matches!(
            parser().parse("Final Answer:   "),
            ParsedAction::Malformed {
                reason: MalformedReason::EmptyFinalAnswer,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_is_deterministic() {
        let output = "Action: stock_price\nAction Input: MSFT";
        let p = parser();
        assert_eq!(p.parse(output), p.parse(output));
    }

    #[test]
    fn test_fragment_is_bounded() {
        let long = "x".repeat(1000);
        match parser().parse(&long) {
            ParsedAction::Malformed { fragment, .. } => {
                assert_eq!(fragment.chars().count(), MAX_FRAGMENT_CHARS)
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }
}
