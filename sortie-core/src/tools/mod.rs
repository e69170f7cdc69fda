//! Agent tools: local graph/reporting tools, the sandboxed shell, and routing

pub mod graph_tools;
pub mod registry;
pub mod reporting;
pub mod results;
pub mod router;
pub mod shell;

pub use registry::{
    AgentSpawner, LocalTool, LoopControl, SandboxedTool, ToolAudience, ToolContext,
    ToolDefinition, ToolOutcome,
};
pub use reporting::{ReportDraft, Severity, VulnerabilityReport};
pub use results::{CallResult, append_results, can_use_native};
pub use router::{ExecutionTarget, ToolExecutionRouter};
pub use shell::TerminalTool;
