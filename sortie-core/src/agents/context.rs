//! Parent history handed to a child agent on its first turn
//!
//! Short histories are replayed as-is. Longer ones are condensed: everything
//! but the most recent messages becomes a brief summary block, and the recent
//! tail is rendered in full below it.

use crate::providers::{ChatMessage, Role};
use crate::tools::results::truncate;

/// Per-message limit inside `<earlier_context_summary>`
const SUMMARY_MESSAGE_CHARS: usize = 300;

/// Per-message limit inside `<recent_parent_activity>`
const RECENT_MESSAGE_CHARS: usize = 4_000;

/// Build the inherited portion of a child's history.
///
/// `threshold` is the largest history replayed verbatim; above it, all but the
/// last `recent` messages are summarized.
pub fn inherit_context(history: &[ChatMessage], threshold: usize, recent: usize) -> Vec<ChatMessage> {
    let history: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| m.role != Role::System && !is_empty(m))
        .collect();

    if history.len() <= threshold {
        return history.into_iter().map(sanitize).collect();
    }

    let split = history.len().saturating_sub(recent);
    let (earlier, latest) = history.split_at(split);

    let mut block = format!(
        "<inherited_context_from_parent>\n<earlier_context_summary messages=\"{}\">\n",
        earlier.len()
    );
    for message in earlier {
        block.push_str(&render_line(message, SUMMARY_MESSAGE_CHARS));
        block.push('\n');
    }
    block.push_str("</earlier_context_summary>\n<recent_parent_activity>\n");
    for message in latest {
        block.push_str(&render_line(message, RECENT_MESSAGE_CHARS));
        block.push('\n');
    }
    block.push_str("</recent_parent_activity>\n</inherited_context_from_parent>");

    vec![ChatMessage::user(block)]
}

fn is_empty(message: &ChatMessage) -> bool {
    message.content.trim().is_empty() && message.tool_calls.is_empty()
}

/// Tool results without a call id cannot be replayed as native tool messages
fn sanitize(message: &ChatMessage) -> ChatMessage {
    if message.role == Role::Tool && message.tool_call_id.is_none() {
        let name = message.name.as_deref().unwrap_or("unknown tool");
        return ChatMessage::user(format!(
            "[Result of {name} from the parent agent; tool metadata was incomplete]\n{}",
            message.content
        ));
    }
    message.clone()
}

fn render_line(message: &ChatMessage, max_chars: usize) -> String {
    let label = match message.role {
        Role::Assistant if !message.tool_calls.is_empty() => {
            let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
            format!("assistant [called: {}]", names.join(", "))
        }
        Role::Tool => format!(
            "tool_result({})",
            message
                .tool_call_id
                .as_deref()
                .or(message.name.as_deref())
                .unwrap_or("unknown")
        ),
        role => role.as_str().to_string(),
    };
    let content = truncate(message.content.trim(), max_chars);
    if content.is_empty() {
        label
    } else {
        format!("{label}: {content}")
    }
}
