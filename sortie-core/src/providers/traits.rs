//! Model client trait and conversation types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::retry;
use crate::Error;
use crate::tools::ToolDefinition;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id; absent for text-parsed calls
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A message in an agent's conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Request passed to the model layer
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// One model turn: optional text plus requested tool calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: vec![],
        }
    }

    pub fn with_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// Failure reported by the model layer
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ModelError {
    /// HTTP status if the provider reported one
    pub status: Option<u16>,
    pub message: String,
}

impl ModelError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Status reported by the provider, or one found in the message text
    pub fn effective_status(&self) -> Option<u16> {
        self.status
            .or_else(|| retry::extract_status_code(&self.message))
    }

    pub fn is_retryable(&self) -> bool {
        retry::is_retryable_status(self.effective_status())
    }
}

impl From<ModelError> for Error {
    fn from(err: ModelError) -> Self {
        if err.is_retryable() {
            Error::TransientModel {
                status: err.effective_status(),
                message: err.message,
            }
        } else {
            Error::Model(err.message)
        }
    }
}

/// LLM layer collaborator
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Get client name
    fn name(&self) -> &str;

    /// Whether the model accepts native tool schemas and returns call ids
    fn supports_tools(&self) -> bool;

    /// Request the next turn
    async fn complete(&self, request: ModelRequest) -> std::result::Result<ModelTurn, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let user = ChatMessage::user("Hello");
        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "Hello");

        let tool = ChatMessage::tool_result("call_1", "terminal_execute", "ok");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool.name.as_deref(), Some("terminal_execute"));
    }

    #[test]
    fn test_model_error_status_from_text() {
        let err = ModelError::new(None, "provider said HTTP 401 Unauthorized");
        assert_eq!(err.effective_status(), Some(401));
        assert!(!err.is_retryable());

        let err = ModelError::new(None, "connection reset by peer");
        assert_eq!(err.effective_status(), None);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_model_error_into_error() {
        let transient: Error = ModelError::new(Some(429), "slow down").into();
        assert!(matches!(
            transient,
            Error::TransientModel {
                status: Some(429),
                ..
            }
        ));

        let terminal: Error = ModelError::new(Some(400), "bad request").into();
        assert!(matches!(terminal, Error::Model(_)));
    }
}
