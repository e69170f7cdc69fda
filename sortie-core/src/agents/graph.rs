//! Agent graph: the scan's registry of agents, edges, mailboxes and finish state
//!
//! Every mutation goes through one lock. Worker threads only call the
//! message-passing operations below; they never hold the lock across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::finish::{
    self, AgentReport, FinishOutcome, FinishRejection, FinishRequest, ScanReport,
};
use super::mailbox::{Mailbox, Message, MessageSender, should_resume};
use super::AgentId;
use crate::config::AgentLimits;
use crate::state::{AgentState, AgentStatus, Heartbeat, WaitReason, phase};
use crate::telemetry::{LifecycleEvent, Telemetry};
use crate::tools::{ReportDraft, VulnerabilityReport};
use crate::{Error, Result};

/// Interval at which a waiting agent re-checks its deadline without a wake-up
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters for `create_agent`
#[derive(Debug, Clone)]
pub struct CreateAgentRequest {
    /// `None` creates the root
    pub parent_id: Option<AgentId>,
    pub name: String,
    pub task: String,
    pub skills: Vec<String>,
    pub inherit_context: bool,
    /// Vulnerability report ids this agent is meant to remediate
    pub fixes: Vec<String>,
    /// Only honoured for the root; children inherit from their parent
    pub source_available: bool,
}

impl CreateAgentRequest {
    pub fn root(name: impl Into<String>, task: impl Into<String>, source_available: bool) -> Self {
        Self {
            parent_id: None,
            name: name.into(),
            task: task.into(),
            skills: vec![],
            inherit_context: false,
            fixes: vec![],
            source_available,
        }
    }

    pub fn child(parent: AgentId, name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent),
            name: name.into(),
            task: task.into(),
            skills: vec![],
            inherit_context: false,
            fixes: vec![],
            source_available: false,
        }
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_inherited_context(mut self, inherit: bool) -> Self {
        self.inherit_context = inherit;
        self
    }

    pub fn with_fixes(mut self, fixes: Vec<String>) -> Self {
        self.fixes = fixes;
        self
    }
}

/// A node in the agent tree
#[derive(Debug, Clone, Serialize)]
pub struct AgentNode {
    pub id: AgentId,
    pub parent_id: Option<AgentId>,
    pub name: String,
    pub task: String,
    pub skills: Vec<String>,
    pub status: AgentStatus,
    pub is_source_available: bool,
    pub fixes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub report: Option<AgentReport>,
}

impl AgentNode {
    pub fn new(
        id: AgentId,
        parent_id: Option<AgentId>,
        name: impl Into<String>,
        task: impl Into<String>,
        skills: Vec<String>,
        is_source_available: bool,
    ) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            task: task.into(),
            skills,
            status: AgentStatus::Initializing,
            is_source_available,
            fixes: vec![],
            created_at: Utc::now(),
            finished_at: None,
            report: None,
        }
    }
}

/// Read-only view of the graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub root: Option<AgentId>,
    /// Nodes in creation order
    pub nodes: Vec<AgentNode>,
    pub edges: Vec<(AgentId, AgentId)>,
    pub active_count: usize,
    pub max_agents: usize,
    pub vulnerability_reports: usize,
}

impl GraphSnapshot {
    pub fn node(&self, id: &AgentId) -> Option<&AgentNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Indented tree for the model-facing `view_agent_graph` tool
    pub fn render_tree(&self, viewer: Option<&AgentId>) -> String {
        let mut out = String::from("=== AGENT GRAPH ===\n");
        if let Some(root) = &self.root {
            self.render_node(root, 0, viewer, &mut out);
        }
        out.push_str(&format!(
            "\nActive agents: {}/{} | Vulnerability reports: {}",
            self.active_count, self.max_agents, self.vulnerability_reports
        ));
        out
    }

    fn render_node(&self, id: &AgentId, depth: usize, viewer: Option<&AgentId>, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        let marker = if viewer == Some(id) { " <- you" } else { "" };
        out.push_str(&format!(
            "{}- {} ({}) [{}]{}\n{}  task: {}\n",
            "  ".repeat(depth),
            node.name,
            node.id,
            node.status,
            marker,
            "  ".repeat(depth),
            node.task
        ));
        for (parent, child) in &self.edges {
            if parent == id {
                self.render_node(child, depth + 1, viewer, out);
            }
        }
    }
}

/// How a `wait_for_message` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A message the wake policy accepts arrived
    Message,
    TimedOut,
    /// Cooldown after a retryable model failure elapsed
    AutoResumed,
    /// The agent was stopped while waiting
    Cancelled,
}

/// Wait parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitOptions {
    /// Ignored for llm_failed waits
    pub timeout: Option<Duration>,
    /// Resume after this long even without a message
    pub auto_resume_after: Option<Duration>,
}

struct Signals {
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<AgentId, AgentNode>,
    order: Vec<AgentId>,
    children: HashMap<AgentId, Vec<AgentId>>,
    mailboxes: HashMap<AgentId, Mailbox>,
    signals: HashMap<AgentId, Signals>,
    root: Option<AgentId>,
    bounce_counts: HashMap<AgentId, u32>,
    reports: Vec<VulnerabilityReport>,
    scan_report: Option<ScanReport>,
}

impl GraphInner {
    fn active_count(&self) -> usize {
        self.nodes.values().filter(|n| n.status.is_active()).count()
    }

    fn node(&self, id: &AgentId) -> Result<&AgentNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::UnknownAgent(id.to_string()))
    }

    fn node_mut(&mut self, id: &AgentId) -> Result<&mut AgentNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownAgent(id.to_string()))
    }

    /// Apply a transition, returning the status the node actually holds
    fn transition(
        &mut self,
        id: &AgentId,
        next: AgentStatus,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<AgentStatus> {
        let node = self.node_mut(id)?;
        let from = node.status;
        if from == next {
            return Ok(from);
        }
        if !from.can_transition_to(next) {
            debug!(agent_id = %id, from = %from, to = %next, "Ignoring status transition");
            return Ok(from);
        }
        node.status = next;
        if next.is_terminal() {
            node.finished_at = Some(Utc::now());
            self.mailboxes.remove(id);
            self.signals.remove(id);
        }
        events.push(LifecycleEvent::StatusChanged {
            agent_id: id.clone(),
            from,
            to: next,
        });
        Ok(next)
    }

    fn deliver(&mut self, message: Message) -> Result<()> {
        let to = message.to.clone();
        let mailbox = self.mailboxes.get_mut(&to).ok_or_else(|| {
            Error::InvalidRequest(format!("agent {to} has already finished"))
        })?;
        mailbox.push(message);
        if let Some(signals) = self.signals.get(&to) {
            signals.notify.notify_one();
        }
        Ok(())
    }
}

/// Registry of all agents in one scan
pub struct AgentGraph {
    inner: Mutex<GraphInner>,
    max_agents: usize,
    max_skills: usize,
    telemetry: Arc<dyn Telemetry>,
}

impl AgentGraph {
    pub fn new(limits: &AgentLimits, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            inner: Mutex::new(GraphInner::default()),
            max_agents: limits.max_agents,
            max_skills: limits.max_skills,
            telemetry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<LifecycleEvent>) {
        for event in &events {
            self.telemetry.record_event(event);
        }
    }

    pub fn telemetry(&self) -> &Arc<dyn Telemetry> {
        &self.telemetry
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    /// Register a new agent; the root when `parent_id` is `None`
    pub fn create_agent(&self, request: CreateAgentRequest) -> Result<AgentId> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidRequest("agent name must not be empty".into()));
        }
        if request.skills.len() > self.max_skills {
            return Err(Error::InvalidRequest(format!(
                "at most {} skills per agent ({} requested)",
                self.max_skills,
                request.skills.len()
            )));
        }

        let id = AgentId::generate();
        let mut inner = self.lock();

        let is_source_available = match &request.parent_id {
            Some(parent) => inner.node(parent)?.is_source_available,
            None => {
                if inner.root.is_some() {
                    return Err(Error::InvalidRequest(
                        "scan already has a root agent".into(),
                    ));
                }
                request.source_available
            }
        };

        let active = inner.active_count();
        if active >= self.max_agents {
            return Err(Error::CapacityExceeded {
                active,
                max: self.max_agents,
            });
        }

        if let Some(unknown) = request
            .fixes
            .iter()
            .find(|f| !inner.reports.iter().any(|r| &r.id == *f))
        {
            return Err(Error::InvalidRequest(format!(
                "unknown vulnerability report id: {unknown}"
            )));
        }

        let mut node = AgentNode::new(
            id.clone(),
            request.parent_id.clone(),
            request.name.clone(),
            request.task.clone(),
            request.skills.clone(),
            is_source_available,
        );
        node.fixes = request.fixes.clone();

        inner.nodes.insert(id.clone(), node);
        inner.order.push(id.clone());
        inner.mailboxes.insert(id.clone(), Mailbox::new());
        inner.signals.insert(
            id.clone(),
            Signals {
                notify: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
            },
        );
        match &request.parent_id {
            Some(parent) => inner
                .children
                .entry(parent.clone())
                .or_default()
                .push(id.clone()),
            None => inner.root = Some(id.clone()),
        }
        drop(inner);

        self.emit(vec![LifecycleEvent::AgentCreated {
            agent_id: id.clone(),
            parent_id: request.parent_id,
            name: request.name,
            task: request.task,
            skills: request.skills,
        }]);
        Ok(id)
    }

    pub fn root_id(&self) -> Option<AgentId> {
        self.lock().root.clone()
    }

    pub fn node(&self, id: &AgentId) -> Option<AgentNode> {
        self.lock().nodes.get(id).cloned()
    }

    pub fn status(&self, id: &AgentId) -> Option<AgentStatus> {
        self.lock().nodes.get(id).map(|n| n.status)
    }

    pub fn children(&self, id: &AgentId) -> Vec<AgentId> {
        self.lock().children.get(id).cloned().unwrap_or_default()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count()
    }

    /// Apply a status transition. Terminal states are sticky, so the returned
    /// status may differ from the requested one.
    pub fn set_status(&self, id: &AgentId, status: AgentStatus) -> Result<AgentStatus> {
        let mut events = Vec::new();
        let effective = self.lock().transition(id, status, &mut events)?;
        self.emit(events);
        Ok(effective)
    }

    /// Transition both the graph node and the worker's own record
    pub fn apply_status(&self, state: &mut AgentState, status: AgentStatus) -> Result<AgentStatus> {
        let effective = self.set_status(&state.agent_id, status)?;
        state.status = effective;
        Ok(effective)
    }

    pub fn touch_heartbeat(&self, id: &AgentId, phase: &str, detail: Option<&str>) {
        self.telemetry.touch_heartbeat(id, phase, detail);
    }

    pub fn last_heartbeat(&self, id: &AgentId) -> Option<Heartbeat> {
        self.telemetry.get_heartbeat(id)
    }

    pub fn notifier(&self, id: &AgentId) -> Option<Arc<Notify>> {
        self.lock().signals.get(id).map(|s| Arc::clone(&s.notify))
    }

    pub fn cancel_token(&self, id: &AgentId) -> Option<CancellationToken> {
        self.lock().signals.get(id).map(|s| s.cancel.clone())
    }

    /// Append a message to the recipient's mailbox and wake it
    pub fn send_message(&self, message: Message) -> Result<()> {
        let event = {
            let mut inner = self.lock();
            inner.node(&message.to)?;
            if let MessageSender::Agent(from) = &message.from {
                inner.node(from)?;
            }
            let event = LifecycleEvent::MessageSent {
                message_id: message.id.clone(),
                from: message.from.to_string(),
                to: message.to.clone(),
            };
            inner.deliver(message)?;
            event
        };
        self.emit(vec![event]);
        Ok(())
    }

    /// Consume every pending message, oldest first
    pub fn take_messages(&self, id: &AgentId) -> Vec<Message> {
        self.lock()
            .mailboxes
            .get_mut(id)
            .map(Mailbox::drain_all)
            .unwrap_or_default()
    }

    pub fn pending_messages(&self, id: &AgentId) -> usize {
        self.lock().mailboxes.get(id).map(Mailbox::len).unwrap_or(0)
    }

    /// Whether any queued message would wake an agent waiting for `reason`
    pub fn has_wake_message(&self, id: &AgentId, reason: &WaitReason) -> bool {
        let inner = self.lock();
        let parent = inner.nodes.get(id).and_then(|n| n.parent_id.as_ref());
        inner
            .mailboxes
            .get(id)
            .is_some_and(|mb| mb.peek_all().any(|m| should_resume(reason, parent, &m.from)))
    }

    /// Display name for a message sender, if it is a known agent
    pub fn sender_name(&self, sender: &MessageSender) -> Option<String> {
        match sender {
            MessageSender::Agent(id) => self.lock().nodes.get(id).map(|n| n.name.clone()),
            _ => None,
        }
    }

    /// Park the agent in `waiting` until the wake policy, the deadline, the
    /// auto-resume cooldown or a stop request ends the wait.
    pub async fn wait_for_message(
        &self,
        state: &mut AgentState,
        reason: WaitReason,
        options: WaitOptions,
    ) -> Result<WaitOutcome> {
        let id = state.agent_id.clone();
        let (notify, cancel) = {
            let inner = self.lock();
            let signals = inner.signals.get(&id).ok_or_else(|| {
                Error::InvalidRequest(format!("agent {id} is no longer active"))
            })?;
            (Arc::clone(&signals.notify), signals.cancel.clone())
        };

        state.enter_waiting(reason.clone(), options.timeout);
        self.apply_status(state, AgentStatus::Waiting)?;
        self.touch_heartbeat(&id, phase::WAITING, Some(reason.describe()));
        let auto_resume_at = options
            .auto_resume_after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        let outcome = loop {
            if cancel.is_cancelled() {
                break WaitOutcome::Cancelled;
            }
            if self.has_wake_message(&id, &reason) {
                break WaitOutcome::Message;
            }
            let now = Utc::now();
            if state.has_waiting_timeout(now) {
                break WaitOutcome::TimedOut;
            }
            if auto_resume_at.is_some_and(|at| now >= at) {
                break WaitOutcome::AutoResumed;
            }

            let deadline = if state.llm_failed {
                None
            } else {
                state.waiting.as_ref().and_then(|w| w.deadline)
            };
            let mut sleep_for = WAIT_POLL_INTERVAL;
            for at in [deadline, auto_resume_at].into_iter().flatten() {
                sleep_for = sleep_for.min((at - now).to_std().unwrap_or_default());
            }

            tokio::select! {
                _ = notify.notified() => {}
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        };

        if outcome != WaitOutcome::Cancelled {
            state.resume_from_waiting();
            self.apply_status(state, AgentStatus::Running)?;
        }
        debug!(agent_id = %id, ?outcome, "Wait ended");
        Ok(outcome)
    }

    /// Request that an agent stop; its loop settles into `stopped`
    pub fn stop_agent(&self, id: &AgentId) -> Result<AgentStatus> {
        let mut events = Vec::new();
        let status = {
            let mut inner = self.lock();
            let status = inner.transition(id, AgentStatus::Stopping, &mut events)?;
            if let Some(signals) = inner.signals.get(id) {
                signals.cancel.cancel();
                signals.notify.notify_one();
            }
            status
        };
        self.emit(events);
        info!(agent_id = %id, status = %status, "Stop requested");
        Ok(status)
    }

    /// Stop every active agent (scan teardown)
    pub fn stop_all(&self) {
        let ids: Vec<AgentId> = {
            let inner = self.lock();
            inner
                .nodes
                .values()
                .filter(|n| n.status.is_active())
                .map(|n| n.id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.stop_agent(&id) {
                warn!(agent_id = %id, "Failed to stop agent: {}", e);
            }
        }
    }

    /// Finish request from an agent. Sub-agents always succeed; the root is
    /// gated as described in [`finish`].
    pub fn request_finish(&self, id: &AgentId, request: FinishRequest) -> Result<FinishOutcome> {
        let mut events = Vec::new();
        let result = {
            let mut inner = self.lock();
            let is_root = inner.root.as_ref() == Some(id);
            match (is_root, request) {
                (false, FinishRequest::Agent(report)) => {
                    Self::finish_child(&mut inner, id, report, &mut events)
                }
                (true, FinishRequest::Scan(report)) => {
                    Self::finish_root(&mut inner, id, report, &mut events)
                }
                (false, FinishRequest::Scan(_)) => {
                    inner.node(id)?;
                    Err(FinishRejection::new(
                        "finish_scan_wrong_agent",
                        "finish_scan may only be called by the root agent; use agent_finish",
                    )
                    .into())
                }
                (true, FinishRequest::Agent(_)) => Err(FinishRejection::new(
                    "agent_finish_wrong_agent",
                    "the root agent must call finish_scan instead of agent_finish",
                )
                .into()),
            }
        };

        if let Err(Error::FinishRejected { code, reason }) = &result {
            events.push(LifecycleEvent::FinishRejected {
                agent_id: id.clone(),
                code: code.clone(),
                reason: reason.clone(),
            });
        }
        self.emit(events);
        result
    }

    fn finish_child(
        inner: &mut GraphInner,
        id: &AgentId,
        report: AgentReport,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<FinishOutcome> {
        let node = inner.node(id)?;
        if node.status == AgentStatus::Completed {
            return Ok(FinishOutcome::AgentCompleted);
        }
        Self::end_child(inner, id, AgentStatus::Completed, report, events)?;
        Ok(FinishOutcome::AgentCompleted)
    }

    /// Attach the report, settle the status and notify the parent
    fn end_child(
        inner: &mut GraphInner,
        id: &AgentId,
        status: AgentStatus,
        report: AgentReport,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<()> {
        let effective = inner.transition(id, status, events)?;
        let node = inner.node_mut(id)?;
        if node.report.is_some() {
            return Ok(());
        }
        let rendered = report.render_completion(&node.name, id, effective);
        node.report = Some(report);
        if let Some(parent) = node.parent_id.clone() {
            let message = Message::new(MessageSender::Agent(id.clone()), parent.clone(), rendered);
            if let Err(e) = inner.deliver(message) {
                debug!(agent_id = %id, parent = %parent, "Completion report not delivered: {}", e);
            }
        }
        Ok(())
    }

    fn finish_root(
        inner: &mut GraphInner,
        id: &AgentId,
        report: ScanReport,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<FinishOutcome> {
        if inner.node(id)?.status == AgentStatus::Completed {
            return Ok(FinishOutcome::ScanFinished { forced: false });
        }

        finish::check_active_agents(id, inner.nodes.values())?;

        let mut forced = false;
        if inner.node(id)?.is_source_available {
            let coverage = finish::remediation_coverage(&inner.reports, inner.nodes.values());
            let bounces = inner.bounce_counts.entry(id.clone()).or_insert(0);
            forced = finish::gate_remediation(&coverage, bounces)?;
            if forced {
                warn!(
                    agent_id = %id,
                    uncovered = ?coverage.uncovered,
                    "Remediation bounce limit reached; allowing finish without full fix coverage"
                );
            }
        }

        finish::validate_scan_report(&report)?;

        inner.transition(id, AgentStatus::Completed, events)?;
        inner.scan_report = Some(report);
        info!(agent_id = %id, forced, "Scan finished");
        Ok(FinishOutcome::ScanFinished { forced })
    }

    /// Settle a sub-agent that ended without calling `agent_finish`
    /// (stopped, terminal model failure, iteration budget), notifying its parent.
    pub fn end_agent(&self, id: &AgentId, status: AgentStatus, report: AgentReport) -> Result<AgentStatus> {
        let mut events = Vec::new();
        let effective = {
            let mut inner = self.lock();
            Self::end_child(&mut inner, id, status, report, &mut events)?;
            inner.node(id)?.status
        };
        self.emit(events);
        Ok(effective)
    }

    pub fn bounce_count(&self, root: &AgentId) -> u32 {
        self.lock().bounce_counts.get(root).copied().unwrap_or(0)
    }

    pub fn scan_report(&self) -> Option<ScanReport> {
        self.lock().scan_report.clone()
    }

    /// Store a vulnerability report, assigning the next `vuln-NNNN` id
    pub fn add_vulnerability_report(
        &self,
        reporter: &AgentId,
        draft: ReportDraft,
    ) -> Result<VulnerabilityReport> {
        let report = {
            let mut inner = self.lock();
            inner.node(reporter)?;
            let id = format!("vuln-{:04}", inner.reports.len() + 1);
            let report = VulnerabilityReport::from_draft(id, reporter.clone(), draft);
            inner.reports.push(report.clone());
            report
        };
        self.emit(vec![LifecycleEvent::VulnerabilityReported {
            report: report.clone(),
        }]);
        Ok(report)
    }

    pub fn vulnerability_reports(&self) -> Vec<VulnerabilityReport> {
        self.lock().reports.clone()
    }

    /// Record a tool execution for telemetry
    pub fn record_tool_execution(
        &self,
        id: &AgentId,
        tool: &str,
        sandboxed: bool,
        duration: Duration,
        success: bool,
    ) {
        self.telemetry.record_event(&LifecycleEvent::ToolExecuted {
            agent_id: id.clone(),
            tool: tool.to_string(),
            sandboxed,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            success,
        });
    }

    pub fn record_stall_recovery(&self, id: &AgentId, stall_count: u32, reason: &str) {
        self.telemetry.record_event(&LifecycleEvent::StallRecovered {
            agent_id: id.clone(),
            stall_count,
            reason: reason.to_string(),
        });
    }

    pub fn view_graph(&self) -> GraphSnapshot {
        let inner = self.lock();
        let nodes: Vec<AgentNode> = inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect();
        let edges = inner
            .order
            .iter()
            .filter_map(|id| {
                inner
                    .nodes
                    .get(id)
                    .and_then(|n| n.parent_id.clone())
                    .map(|p| (p, id.clone()))
            })
            .collect();
        GraphSnapshot {
            root: inner.root.clone(),
            nodes,
            edges,
            active_count: inner.active_count(),
            max_agents: self.max_agents,
            vulnerability_reports: inner.reports.len(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::state::HeartbeatStore;
    use crate::tools::Severity;

    fn graph(max_agents: usize) -> AgentGraph {
        let limits = AgentLimits {
            max_agents,
            ..AgentLimits::default()
        };
        AgentGraph::new(&limits, Arc::new(HeartbeatStore::new()))
    }

    fn scan_report() -> ScanReport {
        ScanReport {
            executive_summary: "summary".into(),
            methodology: "method".into(),
            technical_analysis: "analysis".into(),
            recommendations: "recs".into(),
        }
    }

    fn draft(title: &str) -> ReportDraft {
        ReportDraft {
            title: title.to_string(),
            severity: Severity::High,
            description: "desc".to_string(),
            ..ReportDraft::default()
        }
    }

    #[test]
    fn test_create_root_and_child_inherits_source_flag() {
        let graph = graph(10);
        let root = graph
            .create_agent(CreateAgentRequest::root("root", "assess app", true))
            .unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "recon", "map"))
            .unwrap();
        let grandchild = graph
            .create_agent(CreateAgentRequest::child(child.clone(), "fuzz", "fuzz"))
            .unwrap();

        assert!(graph.node(&child).unwrap().is_source_available);
        assert!(graph.node(&grandchild).unwrap().is_source_available);
        assert_eq!(graph.children(&root), vec![child.clone()]);
        assert_eq!(graph.root_id(), Some(root));
    }

    #[test]
    fn test_second_root_rejected() {
        let graph = graph(10);
        graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let err = graph
            .create_agent(CreateAgentRequest::root("root2", "t", false))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_unknown_parent() {
        let graph = graph(10);
        let err = graph
            .create_agent(CreateAgentRequest::child(AgentId::from("agent_nope"), "x", "t"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(_)));
    }

    #[test]
    fn test_skill_limit() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let skills = (0..6).map(|i| format!("skill{i}")).collect();
        let err = graph
            .create_agent(CreateAgentRequest::child(root, "x", "t").with_skills(skills))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_capacity_counts_only_active_agents() {
        let graph = graph(2);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "a", "t"))
            .unwrap();
        let err = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "b", "t"))
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { active: 2, max: 2 }));
        assert!(err.is_retryable());

        graph
            .request_finish(&child, FinishRequest::Agent(AgentReport::default()))
            .unwrap();
        assert!(graph.create_agent(CreateAgentRequest::child(root, "b", "t")).is_ok());
    }

    #[test]
    fn test_send_message_unknown_recipient() {
        let graph = graph(10);
        let err = graph
            .send_message(Message::new(MessageSender::User, AgentId::from("agent_x"), "hi"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(_)));
    }

    #[test]
    fn test_messages_are_fifo() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "a", "t"))
            .unwrap();
        for i in 0..3 {
            graph
                .send_message(Message::new(
                    MessageSender::Agent(child.clone()),
                    root.clone(),
                    format!("{i}"),
                ))
                .unwrap();
        }
        let bodies: Vec<_> = graph.take_messages(&root).into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["0", "1", "2"]);
        assert_eq!(graph.pending_messages(&root), 0);
    }

    #[test]
    fn test_child_finish_notifies_parent() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "recon", "t"))
            .unwrap();
        let outcome = graph
            .request_finish(
                &child,
                FinishRequest::Agent(AgentReport {
                    success: true,
                    summary: "mapped 12 endpoints".into(),
                    ..AgentReport::default()
                }),
            )
            .unwrap();
        assert_eq!(outcome, FinishOutcome::AgentCompleted);
        assert_eq!(graph.status(&child), Some(AgentStatus::Completed));

        let messages = graph.take_messages(&root);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].body.contains("<agent_completion_report>"));
        assert!(messages[0].body.contains("mapped 12 endpoints"));

        // Terminal agents no longer accept mail
        let err = graph
            .send_message(Message::new(MessageSender::User, child, "late"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_root_finish_blocked_by_active_child() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "recon", "t"))
            .unwrap();
        graph.set_status(&child, AgentStatus::Waiting).unwrap();

        let err = graph
            .request_finish(&root, FinishRequest::Scan(scan_report()))
            .unwrap_err();
        match err {
            Error::FinishRejected { code, .. } => assert_eq!(code, "agents_still_active"),
            other => panic!("unexpected {other:?}"),
        }

        graph.stop_agent(&child).unwrap();
        graph.set_status(&child, AgentStatus::Stopped).unwrap();
        let outcome = graph
            .request_finish(&root, FinishRequest::Scan(scan_report()))
            .unwrap();
        assert_eq!(outcome, FinishOutcome::ScanFinished { forced: false });

        // Idempotent once finished
        let again = graph
            .request_finish(&root, FinishRequest::Scan(ScanReport::default()))
            .unwrap();
        assert_eq!(again, FinishOutcome::ScanFinished { forced: false });
    }

    #[test]
    fn test_finish_scan_wrong_agent() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root, "recon", "t"))
            .unwrap();
        let err = graph
            .request_finish(&child, FinishRequest::Scan(scan_report()))
            .unwrap_err();
        assert!(matches!(err, Error::FinishRejected { ref code, .. } if code == "finish_scan_wrong_agent"));
    }

    #[test]
    fn test_remediation_gate_forced_after_two_bounces() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", true)).unwrap();
        graph.add_vulnerability_report(&root, draft("SQLi")).unwrap();

        for _ in 0..2 {
            let err = graph
                .request_finish(&root, FinishRequest::Scan(scan_report()))
                .unwrap_err();
            assert!(matches!(err, Error::FinishRejected { ref code, .. } if code == "remediation_incomplete"));
        }
        assert_eq!(graph.bounce_count(&root), 2);

        let outcome = graph
            .request_finish(&root, FinishRequest::Scan(scan_report()))
            .unwrap();
        assert_eq!(outcome, FinishOutcome::ScanFinished { forced: true });
    }

    #[test]
    fn test_remediation_gate_skipped_without_source() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        graph.add_vulnerability_report(&root, draft("SQLi")).unwrap();
        let outcome = graph
            .request_finish(&root, FinishRequest::Scan(scan_report()))
            .unwrap();
        assert_eq!(outcome, FinishOutcome::ScanFinished { forced: false });
    }

    #[test]
    fn test_report_ids_are_sequential() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", true)).unwrap();
        let a = graph.add_vulnerability_report(&root, draft("a")).unwrap();
        let b = graph.add_vulnerability_report(&root, draft("b")).unwrap();
        assert_eq!(a.id, "vuln-0001");
        assert_eq!(b.id, "vuln-0002");
        assert_eq!(b.reported_by, root);
    }

    #[test]
    fn test_fix_links_must_reference_known_reports() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", true)).unwrap();
        let err = graph
            .create_agent(
                CreateAgentRequest::child(root.clone(), "fixer", "t")
                    .with_fixes(vec!["vuln-0001".into()]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        graph.add_vulnerability_report(&root, draft("a")).unwrap();
        let fixer = graph
            .create_agent(
                CreateAgentRequest::child(root, "fixer", "t").with_fixes(vec!["vuln-0001".into()]),
            )
            .unwrap();
        assert_eq!(graph.node(&fixer).unwrap().fixes, vec!["vuln-0001".to_string()]);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        graph.set_status(&root, AgentStatus::LlmFailed).unwrap();
        let effective = graph.set_status(&root, AgentStatus::Running).unwrap();
        assert_eq!(effective, AgentStatus::LlmFailed);
    }

    #[test]
    fn test_view_graph_renders_tree() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "assess", false)).unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "recon", "map"))
            .unwrap();
        let snapshot = graph.view_graph();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.edges, vec![(root.clone(), child.clone())]);
        assert_eq!(snapshot.active_count, 2);

        let tree = snapshot.render_tree(Some(&child));
        assert!(tree.contains("- root ("));
        assert!(tree.contains("  - recon ("));
        assert!(tree.contains("<- you"));
    }

    #[tokio::test]
    async fn test_wait_resumes_on_message() {
        let graph = Arc::new(graph(10));
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let mut state = AgentState::new(root.clone(), None, 10, false);

        let sender = Arc::clone(&graph);
        let to = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender
                .send_message(Message::new(MessageSender::User, to, "continue"))
                .unwrap();
        });

        let outcome = graph
            .wait_for_message(
                &mut state,
                WaitReason::awaiting("user input"),
                WaitOptions {
                    timeout: Some(Duration::from_secs(5)),
                    auto_resume_after: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Message);
        assert_eq!(state.status, AgentStatus::Running);
        assert!(state.waiting.is_none());
        assert_eq!(graph.pending_messages(&root), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let mut state = AgentState::new(root, None, 10, false);
        let outcome = graph
            .wait_for_message(
                &mut state,
                WaitReason::awaiting("children"),
                WaitOptions {
                    timeout: Some(Duration::from_millis(30)),
                    auto_resume_after: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_llm_failed_wait_ignores_unrelated_sender() {
        let graph = graph(10);
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let a = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "a", "t"))
            .unwrap();
        let b = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "b", "t"))
            .unwrap();
        graph
            .send_message(Message::new(MessageSender::Agent(b.clone()), a.clone(), "sibling"))
            .unwrap();
        graph
            .send_message(Message::new(MessageSender::System, a.clone(), "budget notice"))
            .unwrap();

        let mut state = AgentState::new(a.clone(), Some(root.clone()), 10, false);
        let outcome = graph
            .wait_for_message(
                &mut state,
                WaitReason::LlmFailed {
                    diagnostic: "model down".into(),
                    retryable: true,
                },
                WaitOptions {
                    timeout: Some(Duration::ZERO),
                    auto_resume_after: Some(Duration::from_millis(50)),
                },
            )
            .await
            .unwrap();
        // The sibling's message, the notice and the zero timeout are all ignored
        assert_eq!(outcome, WaitOutcome::AutoResumed);
        assert!(!state.llm_failed);
        assert_eq!(graph.pending_messages(&a), 2);
    }

    #[tokio::test]
    async fn test_stop_cancels_wait() {
        let graph = Arc::new(graph(10));
        let root = graph.create_agent(CreateAgentRequest::root("root", "t", false)).unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root, "a", "t"))
            .unwrap();
        let mut state = AgentState::new(child.clone(), None, 10, false);

        let stopper = Arc::clone(&graph);
        let target = child.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop_agent(&target).unwrap();
        });

        let outcome = graph
            .wait_for_message(&mut state, WaitReason::awaiting("x"), WaitOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert_eq!(graph.status(&child), Some(AgentStatus::Stopping));
    }
}
