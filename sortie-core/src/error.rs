//! Error types for sortie-core

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using sortie Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for sortie
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Agent limit reached: {active} active agents (max {max})")]
    #[diagnostic(
        code(sortie::capacity),
        help("wait for running agents to finish before creating new ones")
    )]
    CapacityExceeded { active: usize, max: usize },

    #[error("Unknown agent: {0}")]
    #[diagnostic(code(sortie::unknown_agent))]
    UnknownAgent(String),

    #[error("Invalid request: {0}")]
    #[diagnostic(code(sortie::invalid_request))]
    InvalidRequest(String),

    #[error("Transient model error (status {status:?}): {message}")]
    #[diagnostic(code(sortie::model::transient))]
    TransientModel { status: Option<u16>, message: String },

    #[error("Model request failed: {0}")]
    #[diagnostic(code(sortie::model::terminal))]
    Model(String),

    #[error("Tool '{tool}' timed out in the sandbox after {timeout_s}s")]
    #[diagnostic(code(sortie::tool::timeout))]
    ToolExecutionTimeout { tool: String, timeout_s: u64 },

    #[error("Tool execution error: {0}")]
    #[diagnostic(code(sortie::tool))]
    Tool(String),

    #[error("Watchdog recovery budget exhausted for {agent_id}: {diagnostic}")]
    #[diagnostic(
        code(sortie::watchdog::exhausted),
        help("the agent is waiting for external input; send it a message to resume")
    )]
    WatchdogExhausted { agent_id: String, diagnostic: String },

    #[error("Finish rejected: {reason}")]
    #[diagnostic(code(sortie::finish_rejected))]
    FinishRejected { code: String, reason: String },

    #[error("Agent {0} was stopped")]
    #[diagnostic(code(sortie::stopped))]
    Stopped(String),

    #[error("Sandbox error: {0}")]
    #[diagnostic(code(sortie::sandbox))]
    Sandbox(String),

    #[error("Sandbox unreachable after {attempts} attempts: {message}")]
    #[diagnostic(code(sortie::sandbox::unreachable))]
    SandboxUnreachable { attempts: usize, message: String },

    #[error("Configuration error: {0}")]
    #[diagnostic(code(sortie::config))]
    Config(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(sortie::database))]
    Database(#[from] rusqlite::Error),

    #[error("Docker error: {0}")]
    #[diagnostic(code(sortie::docker))]
    Docker(#[from] bollard::errors::Error),

    #[error("HTTP error: {0}")]
    #[diagnostic(code(sortie::http))]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(sortie::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(sortie::serde))]
    Serde(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    #[diagnostic(code(sortie::toml))]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the caller may retry the same request later without changes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. }
                | Error::TransientModel { .. }
                | Error::SandboxUnreachable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_retryable() {
        let err = Error::CapacityExceeded { active: 10, max: 10 };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("max 10"));
    }

    #[test]
    fn test_unknown_agent_is_not_retryable() {
        assert!(!Error::UnknownAgent("agent_x".to_string()).is_retryable());
    }

    #[test]
    fn test_diagnostic_codes() {
        let err = Error::FinishRejected {
            code: "agents_still_active".to_string(),
            reason: "2 agents running".to_string(),
        };
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("sortie::finish_rejected"));
    }
}
