//! Prompt rendering
//!
//! Llama-2 chat framing: the system block carries the persona, the tool
//! catalogue and the directive format; recent turns follow; the current
//! question is preceded by any retrieved excerpts; completed REASON/ACT
//! cycles are replayed after `[/INST]` so the model continues from them.

use crate::models::{Role, Turn};
use crate::retrieval::ScoredChunk;
use crate::tools::ToolDescriptor;
use std::fmt::Write;

const PERSONA: &str = "You are a financial expert assistant named Fenny. You provide accurate, \
helpful information about finance, investing, and financial documents. Be concise and professional.";

const FORMAT_INSTRUCTIONS: &str = "To use a tool, reply in exactly this format and stop:
Thought: <what you need and why>
Action: <tool name>
Action Input: <arguments, comma separated, or a JSON object>

You will then receive an Observation with the tool result. When you can answer the user, reply:
Thought: <your reasoning>
Final Answer: <the answer for the user>

Never write an Observation yourself. Use document excerpts only when they are relevant.";

/// A completed cycle: what the model said and what it was told back.
#[derive(Debug, Clone)]
pub struct ScratchEntry {
    pub reasoning: String,
    pub observation: String,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system: String,
    history_turns: usize,
}

impl PromptBuilder {
    pub fn new(tools: &[ToolDescriptor], history_turns: usize) -> Self {
        Self {
            system: system_block(tools),
            history_turns,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn render(
        &self,
        history: &[Turn],
        question: &str,
        context: &[ScoredChunk],
        scratchpad: &[ScratchEntry],
    ) -> String {
        let mut prompt = format!("[INST] <<SYS>>\n{}\n<</SYS>>\n\n", self.system);

        // Start the window on a user turn so the [INST] pairs line up.
        let start = history.len().saturating_sub(self.history_turns);
        let window = history[start..]
            .iter()
            .skip_while(|t| t.role == Role::Assistant);

        for turn in window {
            match turn.role {
                Role::User => {
                    let _ = write!(prompt, "{} [/INST]\n", turn.content.trim());
                }
                Role::Assistant => {
                    let _ = write!(prompt, "{} </s><s>[INST] ", turn.content.trim());
                }
            }
        }

        if !context.is_empty() {
            prompt.push_str("Relevant excerpts from the user's uploaded documents:\n");
            for (i, scored) in context.iter().enumerate() {
                let _ = write!(
                    prompt,
                    "[Document excerpt {} | doc={} #{} | score={:.3}]\n{}\n\n",
                    i + 1,
                    scored.chunk.source_name,
                    scored.chunk.sequence_index,
                    scored.score,
                    scored.chunk.text.trim()
                );
            }
        }

        let _ = write!(prompt, "Question: {} [/INST]\n", question.trim());

        for entry in scratchpad {
            let _ = write!(
                prompt,
                "{}\nObservation: {}\n",
                entry.reasoning.trim_end(),
                entry.observation
            );
        }

        prompt
    }
}

fn system_block(tools: &[ToolDescriptor]) -> String {
    let mut block = format!("{}\n\n", PERSONA);

    if tools.is_empty() {
        block.push_str("No tools are available; answer directly.\n\n");
    } else {
        block.push_str("You have access to the following tools:\n");
        for tool in tools {
            let _ = writeln!(
                block,
                "- {}({}): {}",
                tool.name,
                tool.schema.usage(),
                tool.schema.description
            );
        }
        block.push('\n');
    }

    block.push_str(FORMAT_INSTRUCTIONS);
    block
}
