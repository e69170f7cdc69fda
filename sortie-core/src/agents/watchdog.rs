//! Watchdog supervision of model calls and tool executions
//!
//! An operation is treated as stalled when it outlives its timeout, or when
//! the agent's heartbeat goes stale (older than `stall_grace_period_s`) while
//! it is outstanding. Staleness is never checked while the agent is waiting or
//! already `llm_failed`.
//!
//! A stall abandons the in-flight future. While `stall_count` is below
//! `max_stall_recoveries` the agent passes through `stalled_recovered` back to
//! `running` and the same step is retried; after that the agent is parked in
//! `waiting` with `llm_failed` set and a diagnostic.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::graph::AgentGraph;
use crate::state::{AgentState, AgentStatus, Heartbeat, WaitReason, phase};
use crate::{Error, Result};

const DEFAULT_LLM_TIMEOUT_S: u64 = 600;
const DEFAULT_TOOL_TIMEOUT_S: u64 = 300;
const DEFAULT_STALL_GRACE_S: u64 = 900;
const DEFAULT_MAX_STALL_RECOVERIES: u32 = 2;

/// How often the heartbeat is checked while an operation runs
const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// What to do when an operation stalls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallPolicy {
    /// Cancel and retry within the recovery budget
    #[default]
    AutoRecover,
}

impl StallPolicy {
    /// Unknown names fall back to the default
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto_recover" => StallPolicy::AutoRecover,
            other => {
                warn!(policy = other, "Unknown stall policy, using auto_recover");
                StallPolicy::AutoRecover
            }
        }
    }
}

impl<'de> Deserialize<'de> for StallPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Watchdog settings (`[watchdog]` in sortie.toml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawWatchdogConfig")]
pub struct WatchdogConfig {
    pub llm_watchdog_timeout_s: u64,
    pub tool_watchdog_timeout_s: u64,
    pub stall_grace_period_s: u64,
    pub max_stall_recoveries: u32,
    pub stall_policy: StallPolicy,
}

/// Accepts out-of-range values so they can be clamped instead of rejected
#[derive(Deserialize)]
#[serde(default)]
struct RawWatchdogConfig {
    llm_watchdog_timeout_s: i64,
    tool_watchdog_timeout_s: i64,
    stall_grace_period_s: i64,
    max_stall_recoveries: i64,
    stall_policy: StallPolicy,
}

impl Default for RawWatchdogConfig {
    fn default() -> Self {
        Self {
            llm_watchdog_timeout_s: DEFAULT_LLM_TIMEOUT_S as i64,
            tool_watchdog_timeout_s: DEFAULT_TOOL_TIMEOUT_S as i64,
            stall_grace_period_s: DEFAULT_STALL_GRACE_S as i64,
            max_stall_recoveries: i64::from(DEFAULT_MAX_STALL_RECOVERIES),
            stall_policy: StallPolicy::default(),
        }
    }
}

fn at_least_one(value: i64) -> u64 {
    u64::try_from(value.max(1)).unwrap_or(1)
}

impl From<RawWatchdogConfig> for WatchdogConfig {
    fn from(raw: RawWatchdogConfig) -> Self {
        Self {
            llm_watchdog_timeout_s: at_least_one(raw.llm_watchdog_timeout_s),
            tool_watchdog_timeout_s: at_least_one(raw.tool_watchdog_timeout_s),
            stall_grace_period_s: at_least_one(raw.stall_grace_period_s),
            max_stall_recoveries: u32::try_from(raw.max_stall_recoveries.max(0)).unwrap_or(u32::MAX),
            stall_policy: raw.stall_policy,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        RawWatchdogConfig::default().into()
    }
}

impl WatchdogConfig {
    /// Enforce positive timeouts on values built in code
    pub fn clamped(self) -> Self {
        Self {
            llm_watchdog_timeout_s: self.llm_watchdog_timeout_s.max(1),
            tool_watchdog_timeout_s: self.tool_watchdog_timeout_s.max(1),
            stall_grace_period_s: self.stall_grace_period_s.max(1),
            ..self
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_watchdog_timeout_s)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_watchdog_timeout_s)
    }

    pub fn stall_grace(&self) -> Duration {
        Duration::from_secs(self.stall_grace_period_s)
    }
}

pub struct Watchdog {
    config: WatchdogConfig,
    tick: Duration,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config: config.clamped(),
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Whether the freshest known heartbeat is older than the grace period
    /// while an operation is outstanding
    pub fn is_stale(&self, state: &AgentState, reported: Option<&Heartbeat>, now: DateTime<Utc>) -> bool {
        if state.waiting.is_some() || state.llm_failed || state.outstanding.is_none() {
            return false;
        }
        let last = match (state.last_heartbeat_at(), reported.map(|h| h.timestamp)) {
            (Some(a), Some(b)) => a.max(b),
            (a, b) => match a.or(b) {
                Some(t) => t,
                None => return false,
            },
        };
        (now - last)
            .to_std()
            .is_ok_and(|age| age > self.config.stall_grace())
    }

    /// Run `op` under supervision, recreating it after each recovered stall.
    ///
    /// Returns `Error::Stopped` if the agent is stopped meanwhile and
    /// `Error::WatchdogExhausted` once the recovery budget is spent.
    pub async fn supervise<T, F, Fut>(
        &self,
        label: &str,
        timeout: Duration,
        state: &mut AgentState,
        graph: &AgentGraph,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cancel = graph.cancel_token(&state.agent_id);
        loop {
            state.outstanding = Some(label.to_string());
            let stall = {
                let fut = op();
                tokio::pin!(fut);
                let deadline = tokio::time::sleep(timeout);
                tokio::pin!(deadline);
                let mut ticker = tokio::time::interval(self.tick);

                loop {
                    tokio::select! {
                        result = &mut fut => {
                            state.outstanding = None;
                            return result;
                        }
                        _ = cancelled(cancel.as_ref()) => {
                            state.outstanding = None;
                            return Err(Error::Stopped(state.agent_id.to_string()));
                        }
                        _ = &mut deadline => {
                            break format!("{label} exceeded its {}s watchdog timeout", timeout.as_secs_f64());
                        }
                        _ = ticker.tick() => {
                            let reported = graph.last_heartbeat(&state.agent_id);
                            if self.is_stale(state, reported.as_ref(), Utc::now()) {
                                break format!("heartbeat went stale during {label}");
                            }
                        }
                    }
                }
            };
            state.outstanding = None;
            self.handle_stall(state, graph, &stall)?;
        }
    }

    /// Recover within budget, otherwise park the agent as `llm_failed`
    pub fn handle_stall(&self, state: &mut AgentState, graph: &AgentGraph, reason: &str) -> Result<()> {
        let id = state.agent_id.clone();
        match self.config.stall_policy {
            StallPolicy::AutoRecover if state.stall_count < self.config.max_stall_recoveries => {
                state.record_recovery(reason);
                warn!(
                    agent_id = %id,
                    stall_count = state.stall_count,
                    max = self.config.max_stall_recoveries,
                    "Stall recovered: {}", reason
                );
                graph.apply_status(state, AgentStatus::StalledRecovered)?;
                graph.record_stall_recovery(&id, state.stall_count, reason);
                state.touch(phase::RECOVERED, Some(reason.to_string()));
                graph.touch_heartbeat(&id, phase::RECOVERED, Some(reason));
                graph.apply_status(state, AgentStatus::Running)?;
                Ok(())
            }
            StallPolicy::AutoRecover => {
                let diagnostic = format!(
                    "watchdog recovery budget exhausted after {} recoveries: {reason}",
                    state.stall_count
                );
                error!(agent_id = %id, "{}", diagnostic);
                state.enter_waiting(
                    WaitReason::LlmFailed {
                        diagnostic: diagnostic.clone(),
                        retryable: false,
                    },
                    None,
                );
                graph.apply_status(state, AgentStatus::Waiting)?;
                graph.touch_heartbeat(&id, phase::WAITING, Some(&diagnostic));
                Err(Error::WatchdogExhausted {
                    agent_id: id.to_string(),
                    diagnostic,
                })
            }
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
