//! Routing tool calls to in-process or sandboxed execution
//!
//! The target is a static property of the tool name: graph and reporting tools
//! run locally, everything else goes to the scan's sandbox container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::graph_tools::graph_tools;
use super::registry::{LocalTool, SandboxedTool, ToolContext, ToolDefinition, ToolOutcome};
use super::reporting::CreateVulnerabilityReportTool;
use super::shell::TerminalTool;
use crate::providers::ToolCall;
use crate::sandbox::{ExecuteStatus, SandboxRuntime};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Local,
    Sandbox,
}

pub struct ToolExecutionRouter {
    scan_id: String,
    local: Vec<Box<dyn LocalTool>>,
    local_index: HashMap<&'static str, usize>,
    sandboxed: Vec<ToolDefinition>,
    sandbox: Option<Arc<SandboxRuntime>>,
}

impl ToolExecutionRouter {
    pub fn new(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            local: vec![],
            local_index: HashMap::new(),
            sandboxed: vec![],
            sandbox: None,
        }
    }

    /// Graph and reporting tools locally, the shell in the sandbox
    pub fn standard(scan_id: impl Into<String>, wait_timeout: Duration, sandbox: Option<Arc<SandboxRuntime>>) -> Self {
        let mut router = Self::new(scan_id);
        for tool in graph_tools(wait_timeout) {
            router = router.with_local_tool(tool);
        }
        router = router.with_local_tool(Box::new(CreateVulnerabilityReportTool));
        if let Some(runtime) = sandbox {
            let shell = TerminalTool::new(
                runtime.config().workspace_dir.clone(),
                Duration::from_secs(runtime.config().execution_timeout_s),
            );
            router = router
                .with_sandboxed_definition(shell.definition())
                .with_sandbox(runtime);
        }
        router
    }

    pub fn with_local_tool(mut self, tool: Box<dyn LocalTool>) -> Self {
        self.local_index.insert(tool.name(), self.local.len());
        self.local.push(tool);
        self
    }

    pub fn with_sandboxed_definition(mut self, definition: ToolDefinition) -> Self {
        self.sandboxed.push(definition);
        self
    }

    pub fn with_sandbox(mut self, runtime: Arc<SandboxRuntime>) -> Self {
        self.sandbox = Some(runtime);
        self
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn sandbox(&self) -> Option<&Arc<SandboxRuntime>> {
        self.sandbox.as_ref()
    }

    pub fn target_for(&self, tool_name: &str) -> Option<ExecutionTarget> {
        if self.local_index.contains_key(tool_name) {
            Some(ExecutionTarget::Local)
        } else if self.sandboxed.iter().any(|d| d.name == tool_name) {
            Some(ExecutionTarget::Sandbox)
        } else {
            None
        }
    }

    /// Schemas offered to an agent
    pub fn definitions(&self, is_root: bool) -> Vec<ToolDefinition> {
        self.local
            .iter()
            .filter(|t| t.audience().allows(is_root))
            .map(|t| t.definition())
            .chain(self.sandboxed.iter().cloned())
            .collect()
    }

    /// Execute one call and record it
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let target = self
            .target_for(&call.name)
            .ok_or_else(|| Error::Tool(format!("Unknown tool: {}", call.name)))?;
        debug!(agent_id = %ctx.agent_id, tool = %call.name, ?target, "Executing tool");

        let started = Instant::now();
        let result = match target {
            ExecutionTarget::Local => self.execute_local(call, ctx).await,
            ExecutionTarget::Sandbox => self.execute_sandboxed(call, ctx).await,
        };

        ctx.graph.record_tool_execution(
            ctx.agent_id,
            &call.name,
            target == ExecutionTarget::Sandbox,
            started.elapsed(),
            result.is_ok(),
        );
        if let Err(e) = &result {
            warn!(agent_id = %ctx.agent_id, tool = %call.name, "Tool failed: {}", e);
        }
        result
    }

    async fn execute_local(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let tool = self
            .local_index
            .get(call.name.as_str())
            .and_then(|&i| self.local.get(i))
            .ok_or_else(|| Error::Tool(format!("Unknown tool: {}", call.name)))?;
        if !tool.audience().allows(ctx.is_root()) {
            return Err(Error::InvalidRequest(format!(
                "{} is not available to this agent",
                call.name
            )));
        }
        tool.call(call.arguments.clone(), ctx).await
    }

    async fn execute_sandboxed(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let runtime = self
            .sandbox
            .as_ref()
            .ok_or_else(|| Error::Sandbox("no sandbox configured for this scan".into()))?;
        let handle = runtime.ensure_sandbox(&self.scan_id, ctx.agent_id).await?;
        let response = handle
            .execute(ctx.agent_id, &call.name, call.arguments.clone())
            .await?;

        match response.status {
            ExecuteStatus::Ok => Ok(ToolOutcome::value(response.result.unwrap_or_default())),
            ExecuteStatus::Timeout => Err(Error::ToolExecutionTimeout {
                tool: call.name.clone(),
                timeout_s: runtime.config().execution_timeout_s,
            }),
            ExecuteStatus::Cancelled => Err(Error::Tool(format!(
                "{} was cancelled by a newer request",
                call.name
            ))),
            ExecuteStatus::Error => Err(Error::Tool(
                response
                    .error
                    .unwrap_or_else(|| format!("{} failed in the sandbox", call.name)),
            )),
        }
    }
}
