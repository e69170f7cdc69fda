//! Model layer interface

pub mod retry;
pub mod traits;

pub use retry::{RetryConfig, build_backoff, extract_status_code, is_retryable_status};
pub use traits::{ChatMessage, ModelClient, ModelError, ModelRequest, ModelTurn, Role, ToolCall};
