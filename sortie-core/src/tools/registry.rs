//! Local tool trait and the context handed to it
//!
//! Local tools run in the agent's own process against the shared agent graph.
//! Sandboxed tools only need a [`ToolDefinition`]; their implementation lives
//! in the tool server inside the container.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::agents::{AgentGraph, AgentId, CreateAgentRequest};
use crate::providers::ChatMessage;
use crate::{Error, Result};

/// Schema advertised to the model for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Which agents are offered a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAudience {
    All,
    RootOnly,
    SubAgentOnly,
}

impl ToolAudience {
    pub fn allows(self, is_root: bool) -> bool {
        match self {
            ToolAudience::All => true,
            ToolAudience::RootOnly => is_root,
            ToolAudience::SubAgentOnly => !is_root,
        }
    }
}

/// Side effect a tool call has on the calling agent's loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopControl {
    /// Park the agent until a message arrives
    Wait {
        reason: String,
        timeout: Option<Duration>,
    },
    /// The sub-agent finished and its report reached the parent
    AgentFinished,
    /// The root's `finish_scan` was accepted
    ScanFinished,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: serde_json::Value,
    pub control: Option<LoopControl>,
}

impl ToolOutcome {
    pub fn value(result: serde_json::Value) -> Self {
        Self {
            result,
            control: None,
        }
    }

    pub fn serialize<T: Serialize>(output: &T) -> Result<Self> {
        Ok(Self::value(serde_json::to_value(output)?))
    }

    pub fn with_control(mut self, control: LoopControl) -> Self {
        self.control = Some(control);
        self
    }
}

/// Starts the worker for a freshly registered agent
pub trait AgentSpawner: Send + Sync {
    /// Register the agent in the graph and start its loop. `inherited` is the
    /// creator's history, used when the request asks to inherit context.
    fn spawn_agent(&self, request: CreateAgentRequest, inherited: &[ChatMessage]) -> Result<AgentId>;
}

/// Everything a local tool may touch
pub struct ToolContext<'a> {
    pub agent_id: &'a AgentId,
    pub parent_id: Option<&'a AgentId>,
    pub history: &'a [ChatMessage],
    pub graph: &'a AgentGraph,
    pub spawner: &'a dyn AgentSpawner,
}

impl ToolContext<'_> {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[async_trait]
pub trait LocalTool: Send + Sync {
    fn name(&self) -> &'static str;

    fn definition(&self) -> ToolDefinition;

    fn audience(&self) -> ToolAudience {
        ToolAudience::All
    }

    async fn call(&self, args: serde_json::Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome>;
}

/// Tool run by the tool server inside the sandbox container
#[async_trait]
pub trait SandboxedTool: Send + Sync {
    fn name(&self) -> &'static str;

    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// Deserialize tool arguments; a missing argument object counts as `{}`
pub fn parse_args<T: DeserializeOwned>(tool: &str, args: serde_json::Value) -> Result<T> {
    let args = if args.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| Error::InvalidRequest(format!("invalid arguments for {tool}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Args {
        #[serde(default)]
        limit: Option<u32>,
    }

    #[test]
    fn test_parse_args_treats_null_as_empty() {
        let args: Args = parse_args("t", serde_json::Value::Null).unwrap();
        assert!(args.limit.is_none());
    }

    #[test]
    fn test_parse_args_reports_tool_name() {
        let err = parse_args::<Args>("view", serde_json::json!({"limit": "x"})).unwrap_err();
        assert!(err.to_string().contains("invalid arguments for view"));
    }

    #[test]
    fn test_audience() {
        assert!(ToolAudience::RootOnly.allows(true));
        assert!(!ToolAudience::RootOnly.allows(false));
        assert!(ToolAudience::SubAgentOnly.allows(false));
        assert!(ToolAudience::All.allows(false));
    }
}
