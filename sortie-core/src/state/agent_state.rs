//! Per-agent mutable state: status, iteration budget, heartbeat, stall counters

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentId;

/// Heartbeat phase labels written by the worker loop
pub mod phase {
    pub const INITIALIZING: &str = "initializing";
    pub const BEFORE_MODEL: &str = "before_llm_processing";
    pub const AFTER_MODEL: &str = "after_llm_processing";
    pub const BEFORE_TOOL: &str = "before_tool_execution";
    pub const AFTER_TOOL: &str = "after_tool_execution";
    pub const WAITING: &str = "waiting";
    pub const RECOVERED: &str = "stall_recovered";
    pub const FINISHED: &str = "finished";
}

/// Lifecycle status of an agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered, first turn not yet started
    #[default]
    Initializing,
    Running,
    /// Blocked in `wait_for_message`, or parked after a model failure
    Waiting,
    /// Transient marker after a watchdog recovery; folds back into `Running`
    StalledRecovered,
    /// Stop requested, loop has not yet exited
    Stopping,
    Completed,
    Stopped,
    /// Terminal model failure (non-retryable)
    LlmFailed,
}

impl AgentStatus {
    /// Counted against the per-scan agent cap and blocks the root's finish
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AgentStatus::Initializing
                | AgentStatus::Running
                | AgentStatus::Waiting
                | AgentStatus::StalledRecovered
                | AgentStatus::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Stopped | AgentStatus::LlmFailed
        )
    }

    /// Terminal states are sticky and `Stopping` may only settle into `Stopped`
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            s if s.is_terminal() => false,
            AgentStatus::Stopping => matches!(next, AgentStatus::Stopped),
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Running => "running",
            AgentStatus::Waiting => "waiting",
            AgentStatus::StalledRecovered => "stalled_recovered",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Completed => "completed",
            AgentStatus::Stopped => "stopped",
            AgentStatus::LlmFailed => "llm_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(AgentStatus::Initializing),
            "running" => Some(AgentStatus::Running),
            "waiting" => Some(AgentStatus::Waiting),
            "stalled_recovered" => Some(AgentStatus::StalledRecovered),
            "stopping" => Some(AgentStatus::Stopping),
            "completed" => Some(AgentStatus::Completed),
            "stopped" => Some(AgentStatus::Stopped),
            "llm_failed" => Some(AgentStatus::LlmFailed),
            _ => None,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub detail: Option<String>,
}

impl Heartbeat {
    pub fn now(phase: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase: phase.into(),
            detail,
        }
    }

    /// Age relative to `now`; clock skew into the future counts as zero
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or_default()
    }
}

/// Why an agent is parked in `Waiting`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitReason {
    /// The agent asked to wait for messages
    Awaiting { reason: String },
    /// Model or watchdog failure that needs external input
    LlmFailed { diagnostic: String, retryable: bool },
}

impl WaitReason {
    pub fn awaiting(reason: impl Into<String>) -> Self {
        WaitReason::Awaiting {
            reason: reason.into(),
        }
    }

    pub fn is_llm_failed(&self) -> bool {
        matches!(self, WaitReason::LlmFailed { .. })
    }

    pub fn describe(&self) -> &str {
        match self {
            WaitReason::Awaiting { reason } => reason,
            WaitReason::LlmFailed { diagnostic, .. } => diagnostic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitInfo {
    pub reason: WaitReason,
    pub since: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recovery {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Mutable record owned by one agent's worker thread
#[derive(Debug, Clone)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub parent_id: Option<AgentId>,
    pub status: AgentStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    is_source_available: bool,
    pub heartbeat: Option<Heartbeat>,
    pub stall_count: u32,
    pub last_recovery: Option<Recovery>,
    pub waiting: Option<WaitInfo>,
    pub llm_failed: bool,
    pub auto_resume_attempts: u32,
    /// Label of the operation currently under watchdog supervision
    pub outstanding: Option<String>,
}

impl AgentState {
    pub fn new(
        agent_id: AgentId,
        parent_id: Option<AgentId>,
        max_iterations: u32,
        is_source_available: bool,
    ) -> Self {
        Self {
            agent_id,
            parent_id,
            status: AgentStatus::Initializing,
            iteration: 0,
            max_iterations,
            is_source_available,
            heartbeat: None,
            stall_count: 0,
            last_recovery: None,
            waiting: None,
            llm_failed: false,
            auto_resume_attempts: 0,
            outstanding: None,
        }
    }

    /// Fixed at creation and inherited from the parent
    pub fn is_source_available(&self) -> bool {
        self.is_source_available
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn touch(&mut self, phase: &str, detail: Option<String>) -> &Heartbeat {
        self.heartbeat.insert(Heartbeat::now(phase, detail))
    }

    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.heartbeat.as_ref().map(|h| h.timestamp)
    }

    pub fn increment_iteration(&mut self) {
        self.iteration = self.iteration.saturating_add(1);
    }

    pub fn has_reached_max_iterations(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    pub fn enter_waiting(&mut self, reason: WaitReason, timeout: Option<Duration>) {
        let since = Utc::now();
        let deadline = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| since + t);
        self.llm_failed = reason.is_llm_failed();
        self.waiting = Some(WaitInfo {
            reason,
            since,
            deadline,
        });
        self.outstanding = None;
    }

    /// Leave the waiting state; clears the llm_failed flag
    pub fn resume_from_waiting(&mut self) {
        self.waiting = None;
        self.llm_failed = false;
    }

    /// An llm_failed wait never times out on its own
    pub fn has_waiting_timeout(&self, now: DateTime<Utc>) -> bool {
        if self.llm_failed {
            return false;
        }
        self.waiting
            .as_ref()
            .and_then(|w| w.deadline)
            .is_some_and(|deadline| now >= deadline)
    }

    pub fn record_recovery(&mut self, reason: impl Into<String>) {
        self.stall_count = self.stall_count.saturating_add(1);
        self.last_recovery = Some(Recovery {
            at: Utc::now(),
            reason: reason.into(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn state() -> AgentState {
        AgentState::new(
            AgentId::from("agent_child"),
            Some(AgentId::from("agent_root")),
            10,
            true,
        )
    }

    #[test]
    fn test_active_and_terminal_sets_are_disjoint() {
        let all = [
            AgentStatus::Initializing,
            AgentStatus::Running,
            AgentStatus::Waiting,
            AgentStatus::StalledRecovered,
            AgentStatus::Stopping,
            AgentStatus::Completed,
            AgentStatus::Stopped,
            AgentStatus::LlmFailed,
        ];
        for status in all {
            assert!(!(status.is_active() && status.is_terminal()), "{status}");
            assert!(status.is_active() || status.is_terminal(), "{status}");
            assert_eq!(AgentStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        assert!(!AgentStatus::Completed.can_transition_to(AgentStatus::Running));
        assert!(!AgentStatus::LlmFailed.can_transition_to(AgentStatus::Waiting));
        assert!(AgentStatus::Completed.can_transition_to(AgentStatus::Completed));
        assert!(!AgentStatus::Stopping.can_transition_to(AgentStatus::Running));
        assert!(AgentStatus::Stopping.can_transition_to(AgentStatus::Stopped));
        assert!(AgentStatus::Waiting.can_transition_to(AgentStatus::Running));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&AgentStatus::StalledRecovered).unwrap();
        assert_eq!(json, "\"stalled_recovered\"");
    }

    #[test]
    fn test_waiting_timeout() {
        let mut state = state();
        state.enter_waiting(WaitReason::awaiting("child results"), Some(Duration::ZERO));
        assert!(!state.llm_failed);
        assert!(state.has_waiting_timeout(Utc::now()));

        state.resume_from_waiting();
        assert!(state.waiting.is_none());
        assert!(!state.has_waiting_timeout(Utc::now()));
    }

    #[test]
    fn test_llm_failed_wait_never_times_out() {
        let mut state = state();
        state.enter_waiting(
            WaitReason::LlmFailed {
                diagnostic: "watchdog exhausted".to_string(),
                retryable: true,
            },
            Some(Duration::ZERO),
        );
        assert!(state.llm_failed);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(!state.has_waiting_timeout(later));
    }

    #[test]
    fn test_record_recovery() {
        let mut state = state();
        state.record_recovery("llm call exceeded 600s");
        state.record_recovery("heartbeat stale");
        assert_eq!(state.stall_count, 2);
        assert_eq!(
            state.last_recovery.as_ref().map(|r| r.reason.as_str()),
            Some("heartbeat stale")
        );
    }

    #[test]
    fn test_iteration_budget() {
        let mut state = state();
        for _ in 0..9 {
            state.increment_iteration();
        }
        assert!(!state.has_reached_max_iterations());
        state.increment_iteration();
        assert!(state.has_reached_max_iterations());
    }

    #[test]
    fn test_heartbeat_age_ignores_future_timestamps() {
        let hb = Heartbeat {
            timestamp: Utc::now() + chrono::Duration::seconds(30),
            phase: phase::BEFORE_MODEL.to_string(),
            detail: None,
        };
        assert_eq!(hb.age(Utc::now()), Duration::ZERO);
    }
}
