//! Agent state, liveness tracking and the run ledger

pub mod agent_state;
pub mod heartbeat;
pub mod ledger;
pub mod migrations;
pub mod schema;

pub use agent_state::{
    AgentState, AgentStatus, Heartbeat, Recovery, WaitInfo, WaitReason, phase,
};
pub use heartbeat::HeartbeatStore;
pub use ledger::{AgentRecord, RunLedger, ToolStats, TransitionRecord, VulnerabilityRecord};
pub use migrations::run_migrations;
