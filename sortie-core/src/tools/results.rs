//! Formatting tool results back into the conversation

use crate::providers::{ChatMessage, ToolCall};

/// Results longer than this are cut before they reach the model
pub const MAX_RESULT_CHARS: usize = 20_000;

/// Result of one executed call
#[derive(Debug, Clone)]
pub struct CallResult {
    pub call: ToolCall,
    pub output: String,
}

impl CallResult {
    pub fn new(call: ToolCall, output: impl Into<String>) -> Self {
        Self {
            call,
            output: truncate(&output.into(), MAX_RESULT_CHARS),
        }
    }
}

/// Structured per-call results need an id on every call of the turn and a
/// model that accepts them.
pub fn can_use_native(calls: &[ToolCall], supports_tools: bool) -> bool {
    supports_tools && !calls.is_empty() && calls.iter().all(|c| c.id.as_deref().is_some_and(|id| !id.is_empty()))
}

/// Render a tool's JSON result as text
pub fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Append one turn's results to `history`
pub fn append_results(history: &mut Vec<ChatMessage>, results: Vec<CallResult>, native: bool) {
    if results.is_empty() {
        return;
    }
    if native {
        for result in results {
            let id = result.call.id.unwrap_or_default();
            history.push(ChatMessage::tool_result(id, result.call.name, result.output));
        }
        return;
    }

    let block = results
        .iter()
        .map(|r| {
            format!(
                "<tool_result>\n<tool_name>{}</tool_name>\n<result>{}</result>\n</tool_result>",
                r.call.name, r.output
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    history.push(ChatMessage::user(block));
}

/// Keep the head and tail of `text`, marking the cut
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let mut head_end = half;
    while !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - half;
    while !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n...[truncated]...\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}
