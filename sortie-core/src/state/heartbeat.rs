//! In-memory heartbeat store

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::agents::AgentId;
use crate::state::Heartbeat;
use crate::telemetry::{LifecycleEvent, Telemetry};

/// Per-agent liveness timestamps; lifecycle events go to the tracing log
#[derive(Debug, Default)]
pub struct HeartbeatStore {
    beats: RwLock<HashMap<AgentId, Heartbeat>>,
}

impl HeartbeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.beats.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Telemetry for HeartbeatStore {
    fn touch_heartbeat(&self, agent_id: &AgentId, phase: &str, detail: Option<&str>) {
        let beat = Heartbeat::now(phase, detail.map(str::to_string));
        let mut beats = match self.beats.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        beats.insert(agent_id.clone(), beat);
    }

    fn get_heartbeat(&self, agent_id: &AgentId) -> Option<Heartbeat> {
        let beats = match self.beats.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        beats.get(agent_id).cloned()
    }

    fn record_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::AgentCreated {
                agent_id,
                parent_id,
                name,
                ..
            } => info!(
                agent_id = %agent_id,
                parent_id = parent_id.as_ref().map(|p| p.as_str()).unwrap_or("-"),
                name = %name,
                "Agent created"
            ),
            LifecycleEvent::StatusChanged { agent_id, from, to } => {
                debug!(agent_id = %agent_id, from = %from, to = %to, "Agent status changed")
            }
            LifecycleEvent::StallRecovered {
                agent_id,
                stall_count,
                reason,
            } => warn!(
                agent_id = %agent_id,
                stall_count,
                reason = %reason,
                "Recovered stalled operation"
            ),
            LifecycleEvent::FinishRejected {
                agent_id,
                code,
                reason,
            } => info!(agent_id = %agent_id, code = %code, reason = %reason, "Finish rejected"),
            LifecycleEvent::VulnerabilityReported { report } => {
                info!(id = %report.id, title = %report.title, "Vulnerability reported")
            }
            LifecycleEvent::MessageSent { .. } | LifecycleEvent::ToolExecuted { .. } => {
                debug!(?event, "Lifecycle event")
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_overwrites_previous_heartbeat() {
        let store = HeartbeatStore::new();
        let id = AgentId::from("agent_1");
        assert!(store.get_heartbeat(&id).is_none());

        store.touch_heartbeat(&id, "before_llm_processing", None);
        store.touch_heartbeat(&id, "before_tool_execution", Some("terminal_execute"));

        let hb = store.get_heartbeat(&id).unwrap();
        assert_eq!(hb.phase, "before_tool_execution");
        assert_eq!(hb.detail.as_deref(), Some("terminal_execute"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_heartbeats_are_per_agent() {
        let store = HeartbeatStore::new();
        store.touch_heartbeat(&AgentId::from("a"), "x", None);
        store.touch_heartbeat(&AgentId::from("b"), "y", None);
        assert_eq!(store.get_heartbeat(&AgentId::from("a")).unwrap().phase, "x");
        assert_eq!(store.get_heartbeat(&AgentId::from("b")).unwrap().phase, "y");
    }
}
