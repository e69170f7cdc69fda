//! Agent graph, worker loop and supervision

pub mod context;
pub mod finish;
pub mod graph;
pub mod mailbox;
pub mod prompts;
pub mod watchdog;
pub mod worker;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use finish::{FinishOutcome, ScanReport};
pub use graph::{AgentGraph, AgentNode, CreateAgentRequest, GraphSnapshot, WaitOptions, WaitOutcome};
pub use mailbox::{Message, MessagePriority, MessageSender, MessageType, should_resume};
pub use prompts::{PromptContext, PromptSource, StaticPrompts};
pub use watchdog::{StallPolicy, Watchdog, WatchdogConfig};
pub use worker::{Agent, AgentDeps, AgentOutcome};

/// Agent identifier, `agent_` followed by eight hex digits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn generate() -> Self {
        let short: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        Self(format!("agent_{short}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = AgentId::generate();
        let b = AgentId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("agent_"));
        assert_eq!(a.as_str().len(), "agent_".len() + 8);
    }
}
