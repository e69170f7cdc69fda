//! Telemetry sink consumed by the agent graph
//!
//! The core writes heartbeats and lifecycle events through [`Telemetry`] and
//! reads back only heartbeats. [`HeartbeatStore`](crate::state::HeartbeatStore)
//! keeps them in memory; [`RunLedger`](crate::state::RunLedger) persists them.

use std::sync::Arc;

use serde::Serialize;

use crate::agents::AgentId;
use crate::state::{AgentStatus, Heartbeat};
use crate::tools::VulnerabilityReport;

/// Lifecycle event emitted by the graph, the worker loop and the router
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    AgentCreated {
        agent_id: AgentId,
        parent_id: Option<AgentId>,
        name: String,
        task: String,
        skills: Vec<String>,
    },
    StatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    MessageSent {
        message_id: String,
        from: String,
        to: AgentId,
    },
    ToolExecuted {
        agent_id: AgentId,
        tool: String,
        sandboxed: bool,
        duration_ms: u64,
        success: bool,
    },
    StallRecovered {
        agent_id: AgentId,
        stall_count: u32,
        reason: String,
    },
    FinishRejected {
        agent_id: AgentId,
        code: String,
        reason: String,
    },
    VulnerabilityReported {
        report: VulnerabilityReport,
    },
}

/// Collaborator interface for liveness and lifecycle reporting
pub trait Telemetry: Send + Sync {
    fn touch_heartbeat(&self, agent_id: &AgentId, phase: &str, detail: Option<&str>);

    fn get_heartbeat(&self, agent_id: &AgentId) -> Option<Heartbeat>;

    fn record_event(&self, event: &LifecycleEvent);
}

/// Forwards to several sinks; heartbeat reads return the freshest one
pub struct FanoutTelemetry {
    sinks: Vec<Arc<dyn Telemetry>>,
}

impl FanoutTelemetry {
    pub fn new(sinks: Vec<Arc<dyn Telemetry>>) -> Self {
        Self { sinks }
    }
}

impl Telemetry for FanoutTelemetry {
    fn touch_heartbeat(&self, agent_id: &AgentId, phase: &str, detail: Option<&str>) {
        for sink in &self.sinks {
            sink.touch_heartbeat(agent_id, phase, detail);
        }
    }

    fn get_heartbeat(&self, agent_id: &AgentId) -> Option<Heartbeat> {
        self.sinks
            .iter()
            .filter_map(|s| s.get_heartbeat(agent_id))
            .max_by_key(|h| h.timestamp)
    }

    fn record_event(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.record_event(event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state::HeartbeatStore;

    #[test]
    fn test_fanout_reads_freshest_heartbeat() {
        let a = Arc::new(HeartbeatStore::new());
        let b = Arc::new(HeartbeatStore::new());
        let id = AgentId::from("agent_a");
        a.touch_heartbeat(&id, "first", None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        b.touch_heartbeat(&id, "second", Some("detail"));

        let fanout = FanoutTelemetry::new(vec![a, b]);
        let hb = fanout.get_heartbeat(&id).unwrap();
        assert_eq!(hb.phase, "second");
        assert_eq!(hb.detail.as_deref(), Some("detail"));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = LifecycleEvent::StatusChanged {
            agent_id: AgentId::from("agent_a"),
            from: AgentStatus::Running,
            to: AgentStatus::Waiting,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["to"], "waiting");
    }
}
