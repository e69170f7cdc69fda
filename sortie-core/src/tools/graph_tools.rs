//! Agent-graph tools executed in-process
//!
//! These are the tools through which agents create sub-agents, talk to each
//! other, wait, and finish. They never touch the sandbox.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::registry::{
    LocalTool, LoopControl, ToolAudience, ToolContext, ToolDefinition, ToolOutcome, parse_args,
};
use crate::agents::finish::{AgentReport, FinishRequest};
use crate::agents::{
    AgentId, CreateAgentRequest, FinishOutcome, Message, MessagePriority, MessageSender,
    MessageType, ScanReport,
};
use crate::{Error, Result};

// ============================================================================
// CreateAgentTool
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateAgentArgs {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default = "default_true")]
    pub inherit_context: bool,
    /// Report ids this agent should remediate
    #[serde(default)]
    pub fixes: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct CreateAgentOutput {
    pub success: bool,
    pub agent_id: String,
    pub message: String,
}

pub struct CreateAgentTool;

#[async_trait]
impl LocalTool for CreateAgentTool {
    fn name(&self) -> &'static str {
        "create_agent"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Create a sub-agent that works on a task in parallel. It reports back with an agent_completion_report message when it finishes. Fails when the active-agent limit is reached; wait for agents to finish and retry."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Short descriptive name, e.g. 'SQLi Validation Agent'"},
                    "task": {"type": "string", "description": "Specific, self-contained task"},
                    "skills": {"type": "array", "items": {"type": "string"}, "description": "Up to 5 skill names to load into the agent's prompt"},
                    "inherit_context": {"type": "boolean", "description": "Give the agent a summary of your conversation so far (default true)"},
                    "fixes": {"type": "array", "items": {"type": "string"}, "description": "Vulnerability report ids (vuln-0001, ...) this agent is meant to fix"}
                },
                "required": ["name", "task"]
            }),
        }
    }

    async fn call(&self, args: serde_json::Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: CreateAgentArgs = parse_args(self.name(), args)?;
        let request = CreateAgentRequest::child(ctx.agent_id.clone(), args.name.clone(), args.task)
            .with_skills(args.skills)
            .with_inherited_context(args.inherit_context)
            .with_fixes(args.fixes);

        let agent_id = ctx.spawner.spawn_agent(request, ctx.history)?;
        info!(parent = %ctx.agent_id, agent_id = %agent_id, name = %args.name, "Sub-agent created");

        ToolOutcome::serialize(&CreateAgentOutput {
            success: true,
            message: format!("Agent '{}' started as {agent_id}", args.name),
            agent_id: agent_id.to_string(),
        })
    }
}

// ============================================================================
// SendMessageTool
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendMessageArgs {
    pub target_agent_id: String,
    pub message: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

pub struct SendMessageTool;

#[async_trait]
impl LocalTool for SendMessageTool {
    fn name(&self) -> &'static str {
        "send_message_to_agent"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Send a message to another agent. Delivery is in order per recipient; a waiting recipient is woken."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "target_agent_id": {"type": "string"},
                    "message": {"type": "string"},
                    "message_type": {"type": "string", "enum": ["query", "instruction", "information"]},
                    "priority": {"type": "string", "enum": ["low", "normal", "high", "urgent"]}
                },
                "required": ["target_agent_id", "message"]
            }),
        }
    }

    async fn call(&self, args: serde_json::Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: SendMessageArgs = parse_args(self.name(), args)?;
        let target = AgentId::from(args.target_agent_id);
        if &target == ctx.agent_id {
            return Err(Error::InvalidRequest("cannot send a message to yourself".into()));
        }

        let message_type = match args.message_type.as_deref() {
            None => MessageType::default(),
            Some(s) => MessageType::parse(s)
                .ok_or_else(|| Error::InvalidRequest(format!("unknown message_type: {s}")))?,
        };
        let priority = match args.priority.as_deref() {
            None => MessagePriority::default(),
            Some(s) => MessagePriority::parse(s)
                .ok_or_else(|| Error::InvalidRequest(format!("unknown priority: {s}")))?,
        };

        let message = Message::new(MessageSender::Agent(ctx.agent_id.clone()), target.clone(), args.message)
            .with_type(message_type)
            .with_priority(priority);
        let message_id = message.id.clone();
        ctx.graph.send_message(message)?;

        Ok(ToolOutcome::value(json!({
            "success": true,
            "message_id": message_id,
            "delivered_to": target.to_string(),
        })))
    }
}

// ============================================================================
// WaitForMessageTool
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WaitArgs {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

pub struct WaitForMessageTool {
    default_timeout: Duration,
}

impl WaitForMessageTool {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

#[async_trait]
impl LocalTool for WaitForMessageTool {
    fn name(&self) -> &'static str {
        "wait_for_message"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: format!(
                "Pause until a message arrives (for example a sub-agent's completion report). Times out after timeout_s seconds (default {}).",
                self.default_timeout.as_secs()
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "What you are waiting for"},
                    "timeout_s": {"type": "integer", "minimum": 1}
                }
            }),
        }
    }

    async fn call(&self, args: serde_json::Value, _ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: WaitArgs = parse_args(self.name(), args)?;
        let reason = args
            .reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "waiting for messages".to_string());
        let timeout = args
            .timeout_s
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or(self.default_timeout);

        Ok(ToolOutcome::value(json!({
            "success": true,
            "status": "waiting",
            "reason": reason,
        }))
        .with_control(LoopControl::Wait {
            reason,
            timeout: Some(timeout),
        }))
    }
}

// ============================================================================
// AgentFinishTool
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AgentFinishArgs {
    pub result_summary: String,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub final_recommendations: Vec<String>,
}

pub struct AgentFinishTool;

#[async_trait]
impl LocalTool for AgentFinishTool {
    fn name(&self) -> &'static str {
        "agent_finish"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Finish your task and send a completion report to your parent agent. Ends your loop."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "result_summary": {"type": "string"},
                    "findings": {"type": "array", "items": {"type": "string"}},
                    "success": {"type": "boolean"},
                    "final_recommendations": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["result_summary"]
            }),
        }
    }

    fn audience(&self) -> ToolAudience {
        ToolAudience::SubAgentOnly
    }

    async fn call(&self, args: serde_json::Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: AgentFinishArgs = parse_args(self.name(), args)?;
        let report = AgentReport {
            success: args.success,
            summary: args.result_summary,
            findings: args.findings,
            recommendations: args.final_recommendations,
        };
        match ctx.graph.request_finish(ctx.agent_id, FinishRequest::Agent(report)) {
            Ok(_) => Ok(ToolOutcome::value(json!({
                "success": true,
                "message": "Completion report sent to parent",
            }))
            .with_control(LoopControl::AgentFinished)),
            Err(Error::FinishRejected { code, reason }) => Ok(rejected(&code, &reason)),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// FinishScanTool
// ============================================================================

pub struct FinishScanTool;

#[async_trait]
impl LocalTool for FinishScanTool {
    fn name(&self) -> &'static str {
        "finish_scan"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Finish the whole assessment with the final report. Rejected while other agents are still active, or, when source code is available, while reported vulnerabilities lack a completed fix agent."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "executive_summary": {"type": "string"},
                    "methodology": {"type": "string"},
                    "technical_analysis": {"type": "string"},
                    "recommendations": {"type": "string"}
                },
                "required": ["executive_summary", "methodology", "technical_analysis", "recommendations"]
            }),
        }
    }

    fn audience(&self) -> ToolAudience {
        ToolAudience::RootOnly
    }

    async fn call(&self, args: serde_json::Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let report: ScanReport = parse_args(self.name(), args)?;
        match ctx.graph.request_finish(ctx.agent_id, FinishRequest::Scan(report)) {
            Ok(FinishOutcome::ScanFinished { forced }) => Ok(ToolOutcome::value(json!({
                "success": true,
                "forced": forced,
                "vulnerability_reports": ctx.graph.vulnerability_reports().len(),
            }))
            .with_control(LoopControl::ScanFinished)),
            Ok(FinishOutcome::AgentCompleted) => Err(Error::Tool(
                "finish_scan completed a sub-agent".into(),
            )),
            Err(Error::FinishRejected { code, reason }) => Ok(rejected(&code, &reason)),
            Err(e) => Err(e),
        }
    }
}

fn rejected(code: &str, reason: &str) -> ToolOutcome {
    ToolOutcome::value(json!({
        "success": false,
        "error": code,
        "message": reason,
    }))
}

// ============================================================================
// ViewAgentGraphTool
// ============================================================================

pub struct ViewAgentGraphTool;

#[async_trait]
impl LocalTool for ViewAgentGraphTool {
    fn name(&self) -> &'static str {
        "view_agent_graph"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Show the tree of agents in this scan with their status.".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _args: serde_json::Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let snapshot = ctx.graph.view_graph();
        Ok(ToolOutcome::value(json!({
            "graph_structure": snapshot.render_tree(Some(ctx.agent_id)),
            "active_agents": snapshot.active_count,
            "total_agents": snapshot.nodes.len(),
        })))
    }
}

// ============================================================================
// StopAgentTool
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StopAgentArgs {
    pub agent_id: String,
}

pub struct StopAgentTool;

#[async_trait]
impl LocalTool for StopAgentTool {
    fn name(&self) -> &'static str {
        "stop_agent"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Stop a running sub-agent. Its parent receives a STOPPED completion report."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"agent_id": {"type": "string"}},
                "required": ["agent_id"]
            }),
        }
    }

    async fn call(&self, args: serde_json::Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: StopAgentArgs = parse_args(self.name(), args)?;
        let target = AgentId::from(args.agent_id);
        if &target == ctx.agent_id {
            return Err(Error::InvalidRequest(
                "use agent_finish to end your own work".into(),
            ));
        }
        if ctx.graph.root_id().as_ref() == Some(&target) {
            return Err(Error::InvalidRequest("the root agent cannot be stopped".into()));
        }
        let status = ctx.graph.stop_agent(&target)?;
        Ok(ToolOutcome::value(json!({
            "success": true,
            "agent_id": target.to_string(),
            "status": status.as_str(),
        })))
    }
}

/// The graph tools offered to every scan
pub fn graph_tools(wait_timeout: Duration) -> Vec<Box<dyn LocalTool>> {
    vec![
        Box::new(CreateAgentTool),
        Box::new(SendMessageTool),
        Box::new(WaitForMessageTool::new(wait_timeout)),
        Box::new(AgentFinishTool),
        Box::new(FinishScanTool),
        Box::new(ViewAgentGraphTool),
        Box::new(StopAgentTool),
    ]
}
