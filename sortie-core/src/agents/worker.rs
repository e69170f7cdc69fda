//! Agent worker loop
//!
//! One `Agent` drives one conversation: drain the mailbox, ask the model for a
//! turn, run the requested tools, append the results, repeat. Model calls and
//! tool calls run under the [`Watchdog`]; waiting goes through the graph so the
//! wake policy and stop requests apply.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::finish::AgentReport;
use super::graph::{WaitOptions, WaitOutcome};
use super::mailbox::{Message, MessageSender};
use super::prompts::{PromptContext, PromptSource};
use super::watchdog::Watchdog;
use super::{AgentGraph, AgentId};
use crate::config::ScanConfig;
use crate::providers::{ChatMessage, ModelClient, ModelRequest, ModelTurn, RetryConfig, ToolCall};
use crate::state::{AgentState, AgentStatus, WaitReason, phase};
use crate::tools::results::render_value;
use crate::tools::{
    AgentSpawner, CallResult, LoopControl, ToolContext, ToolExecutionRouter, append_results,
    can_use_native,
};
use crate::{Error, Result};

/// Shared collaborators handed to every agent of a scan
#[derive(Clone)]
pub struct AgentDeps {
    pub graph: Arc<AgentGraph>,
    pub router: Arc<ToolExecutionRouter>,
    pub model: Arc<dyn ModelClient>,
    pub prompts: Arc<dyn PromptSource>,
    pub config: Arc<ScanConfig>,
}

/// How an agent's loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentOutcome {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub iterations: u32,
}

/// Result of one loop step
enum Step {
    Continue,
    Exit(AgentStatus),
}

pub struct Agent {
    state: AgentState,
    name: String,
    system_prompt: String,
    history: Vec<ChatMessage>,
    deps: AgentDeps,
    watchdog: Watchdog,
    retry: RetryConfig,
    budget_warned: bool,
}

impl Agent {
    /// Prepare the worker for an agent already registered in the graph.
    /// `inherited` is the parent context placed before the task message.
    pub fn new(id: &AgentId, deps: AgentDeps, inherited: Vec<ChatMessage>) -> Result<Self> {
        let node = deps
            .graph
            .node(id)
            .ok_or_else(|| Error::UnknownAgent(id.to_string()))?;
        let config = &deps.config;

        let state = AgentState::new(
            id.clone(),
            node.parent_id.clone(),
            config.agents.max_iterations,
            node.is_source_available,
        );
        let system_prompt = deps.prompts.system_prompt(&PromptContext {
            is_root: node.parent_id.is_none(),
            is_source_available: node.is_source_available,
            skills: &node.skills,
            max_agents: config.agents.max_agents,
        });

        let mut history = inherited;
        history.push(ChatMessage::user(task_message(&node.name, &node.task, &node.fixes, node.parent_id.is_none())));

        Ok(Self {
            state,
            name: node.name,
            system_prompt,
            history,
            watchdog: Watchdog::new(config.watchdog.clone()),
            retry: RetryConfig::from(&config.llm),
            deps,
            budget_warned: false,
        })
    }

    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn id(&self) -> &AgentId {
        &self.state.agent_id
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Drive the loop until the agent reaches a terminal state
    pub async fn run(mut self, spawner: &dyn AgentSpawner) -> AgentOutcome {
        let id = self.state.agent_id.clone();
        info!(agent_id = %id, name = %self.name, "Agent started");
        self.beat(phase::INITIALIZING, None);

        let status = match self.deps.graph.apply_status(&mut self.state, AgentStatus::Running) {
            Ok(_) => self.drive(spawner).await,
            Err(e) => {
                error!(agent_id = %id, "Failed to start agent: {}", e);
                AgentStatus::LlmFailed
            }
        };

        self.beat(phase::FINISHED, Some(status.as_str()));
        if let Some(runtime) = self.deps.router.sandbox() {
            runtime.release(self.deps.router.scan_id(), &id);
        }
        info!(agent_id = %id, status = %status, iterations = self.state.iteration, "Agent ended");
        AgentOutcome {
            agent_id: id,
            status,
            iterations: self.state.iteration,
        }
    }

    async fn drive(&mut self, spawner: &dyn AgentSpawner) -> AgentStatus {
        loop {
            let step = match self.step(spawner).await {
                Ok(step) => step,
                Err(Error::Stopped(_)) => Step::Exit(self.end(AgentStatus::Stopped, AgentReport::failed("agent was stopped"))),
                Err(e) => {
                    error!(agent_id = %self.state.agent_id, "Agent failed: {}", e);
                    Step::Exit(self.end(AgentStatus::LlmFailed, AgentReport::failed(e.to_string())))
                }
            };
            if let Step::Exit(status) = step {
                return status;
            }
        }
    }

    /// One iteration of the loop.
    ///
    /// The iteration counter advances before the model turn, so the budget
    /// check counts the turn about to run. An agent stopped for budget has
    /// counted one iteration past its last model turn.
    async fn step(&mut self, spawner: &dyn AgentSpawner) -> Result<Step> {
        let id = self.state.agent_id.clone();
        if let Some(status) = self.deps.graph.status(&id) {
            if status == AgentStatus::Stopping {
                return Err(Error::Stopped(id.to_string()));
            }
            if status.is_terminal() {
                return Ok(Step::Exit(status));
            }
        }

        self.state.increment_iteration();
        if let Some(step) = self.check_iteration_budget() {
            return Ok(step);
        }

        self.drain_mailbox();

        let turn = match self.request_turn().await {
            Ok(turn) => turn,
            Err(Error::TransientModel { status, message }) => {
                let diagnostic = format!("model request kept failing (status {status:?}): {message}");
                return self.wait_after_model_failure(diagnostic, true).await;
            }
            Err(Error::WatchdogExhausted { diagnostic, .. }) => {
                return self.wait_after_model_failure(diagnostic, false).await;
            }
            Err(Error::Model(message)) => {
                error!(agent_id = %id, "Terminal model failure: {}", message);
                let status = self.end(
                    AgentStatus::LlmFailed,
                    AgentReport::failed(format!("model request failed: {message}")),
                );
                return Ok(Step::Exit(status));
            }
            Err(e) => return Err(e),
        };
        self.beat(phase::AFTER_MODEL, None);

        self.handle_turn(turn, spawner).await
    }

    fn drain_mailbox(&mut self) {
        let graph = &self.deps.graph;
        for message in graph.take_messages(&self.state.agent_id) {
            let sender = graph.sender_name(&message.from);
            debug!(agent_id = %self.state.agent_id, from = %message.from, "Delivering message");
            self.history.push(ChatMessage::user(message.render(sender.as_deref())));
        }
    }

    /// Queue a scan notice for this agent; it arrives with the next drain
    fn notify(&self, body: String) {
        let message = Message::new(MessageSender::System, self.state.agent_id.clone(), body);
        if let Err(e) = self.deps.graph.send_message(message) {
            warn!(agent_id = %self.state.agent_id, "Failed to queue notice: {}", e);
        }
    }

    /// Warn once at the limit; force wrap-up after the grace iterations
    fn check_iteration_budget(&mut self) -> Option<Step> {
        let limits = &self.deps.config.agents;
        let hard_limit = limits.max_iterations.saturating_add(limits.wrap_up_grace_iterations);
        if self.state.iteration > hard_limit {
            warn!(agent_id = %self.state.agent_id, iteration = self.state.iteration, "Iteration budget exhausted");
            let status = self.end(
                AgentStatus::Stopped,
                AgentReport::failed("iteration budget exhausted before the agent finished"),
            );
            return Some(Step::Exit(status));
        }
        if self.state.has_reached_max_iterations() && !self.budget_warned {
            self.budget_warned = true;
            let finish_tool = if self.state.is_root() { "finish_scan" } else { "agent_finish" };
            let notice = format!(
                "You have used {} of {} iterations. Wrap up now and call {finish_tool} within the next {} iterations.",
                self.state.iteration, self.state.max_iterations, limits.wrap_up_grace_iterations
            );
            self.notify(notice);
        }
        None
    }

    /// Model call under the watchdog, retrying transient failures with cooldown
    async fn request_turn(&mut self) -> Result<ModelTurn> {
        let request = ModelRequest {
            system: self.system_prompt.clone(),
            messages: self.history.clone(),
            tools: self.deps.router.definitions(self.state.is_root()),
        };
        let model = Arc::clone(&self.deps.model);
        let graph = Arc::clone(&self.deps.graph);
        let timeout = self.watchdog.config().llm_timeout();

        let mut attempt = 0;
        loop {
            self.beat(phase::BEFORE_MODEL, None);
            let result = self
                .watchdog
                .supervise("model call", timeout, &mut self.state, &graph, || {
                    let model = Arc::clone(&model);
                    let request = request.clone();
                    async move { model.complete(request).await.map_err(Error::from) }
                })
                .await;

            match result {
                Err(Error::TransientModel { status, message }) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        agent_id = %self.state.agent_id,
                        ?status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient model failure, retrying: {}", message
                    );
                    self.cooldown(delay).await?;
                }
                other => return other,
            }
        }
    }

    async fn cooldown(&self, delay: Duration) -> Result<()> {
        let cancel = self.deps.graph.cancel_token(&self.state.agent_id);
        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(Error::Stopped(self.state.agent_id.to_string())),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    /// Park in llm_failed waiting until a message (or, for retryable failures
    /// of sub-agents, the auto-resume cooldown) brings the agent back
    async fn wait_after_model_failure(&mut self, diagnostic: String, retryable: bool) -> Result<Step> {
        let llm = &self.deps.config.llm;
        let auto_resume_after = (retryable
            && !self.state.is_root()
            && self.state.auto_resume_attempts < llm.max_auto_resume_attempts)
            .then(|| Duration::from_secs(llm.auto_resume_cooldown_s));
        warn!(
            agent_id = %self.state.agent_id,
            retryable,
            auto_resume = auto_resume_after.is_some(),
            "Agent waiting after model failure: {}", diagnostic
        );

        let reason = WaitReason::LlmFailed {
            diagnostic,
            retryable,
        };
        let graph = Arc::clone(&self.deps.graph);
        let outcome = graph
            .wait_for_message(
                &mut self.state,
                reason,
                WaitOptions {
                    timeout: None,
                    auto_resume_after,
                },
            )
            .await?;

        match outcome {
            WaitOutcome::Cancelled => Err(Error::Stopped(self.state.agent_id.to_string())),
            WaitOutcome::AutoResumed => {
                self.state.auto_resume_attempts += 1;
                info!(
                    agent_id = %self.state.agent_id,
                    attempt = self.state.auto_resume_attempts,
                    "Auto-resuming after model failure"
                );
                Ok(Step::Continue)
            }
            WaitOutcome::Message | WaitOutcome::TimedOut => Ok(Step::Continue),
        }
    }

    async fn handle_turn(&mut self, turn: ModelTurn, spawner: &dyn AgentSpawner) -> Result<Step> {
        let content = turn.content.unwrap_or_default();
        if turn.tool_calls.is_empty() {
            self.history.push(ChatMessage::assistant(content));
            let finish_tool = if self.state.is_root() { "finish_scan" } else { "agent_finish" };
            self.history.push(ChatMessage::user(format!(
                "No tool was called. Continue working with the available tools, or call {finish_tool} when the task is complete."
            )));
            return Ok(Step::Continue);
        }

        let calls = turn.tool_calls;
        let native = can_use_native(&calls, self.deps.model.supports_tools());
        self.history
            .push(ChatMessage::assistant_with_calls(content, calls.clone()));

        let mut results = Vec::with_capacity(calls.len());
        let mut control = None;
        let mut exhausted = None;
        for call in calls {
            if control.is_some() || exhausted.is_some() {
                results.push(CallResult::new(call, "Skipped: an earlier call in this turn ended the step."));
                continue;
            }
            self.beat(phase::BEFORE_TOOL, Some(&call.name));
            match self.run_tool(&call, spawner).await {
                Ok(outcome) => {
                    control = outcome.control;
                    results.push(CallResult::new(call, render_value(&outcome.result)));
                }
                Err(Error::Stopped(id)) => return Err(Error::Stopped(id)),
                Err(Error::WatchdogExhausted { diagnostic, .. }) => {
                    results.push(CallResult::new(call, format!("Error: {diagnostic}")));
                    exhausted = Some(diagnostic);
                }
                Err(e) => results.push(CallResult::new(call, format!("Error: {e}"))),
            }
            self.beat(phase::AFTER_TOOL, None);
        }
        append_results(&mut self.history, results, native);

        if let Some(diagnostic) = exhausted {
            return self.wait_after_model_failure(diagnostic, false).await;
        }
        match control {
            None => Ok(Step::Continue),
            Some(LoopControl::Wait { reason, timeout }) => self.wait(reason, timeout).await,
            Some(LoopControl::AgentFinished | LoopControl::ScanFinished) => {
                let status = self
                    .deps
                    .graph
                    .status(&self.state.agent_id)
                    .unwrap_or(AgentStatus::Completed);
                self.state.status = status;
                Ok(Step::Exit(status))
            }
        }
    }

    /// Tool call under the watchdog
    async fn run_tool(&mut self, call: &ToolCall, spawner: &dyn AgentSpawner) -> Result<crate::tools::ToolOutcome> {
        let agent_id = self.state.agent_id.clone();
        let parent_id = self.state.parent_id.clone();
        let graph = Arc::clone(&self.deps.graph);
        let router = Arc::clone(&self.deps.router);
        let timeout = self.watchdog.config().tool_timeout();
        let ctx = ToolContext {
            agent_id: &agent_id,
            parent_id: parent_id.as_ref(),
            history: &self.history,
            graph: &graph,
            spawner,
        };
        let label = format!("tool {}", call.name);
        self.watchdog
            .supervise(&label, timeout, &mut self.state, &graph, || router.execute(call, &ctx))
            .await
    }

    async fn wait(&mut self, reason: String, timeout: Option<Duration>) -> Result<Step> {
        let graph = Arc::clone(&self.deps.graph);
        let outcome = graph
            .wait_for_message(
                &mut self.state,
                WaitReason::awaiting(reason),
                WaitOptions {
                    timeout,
                    auto_resume_after: None,
                },
            )
            .await?;
        match outcome {
            WaitOutcome::Cancelled => Err(Error::Stopped(self.state.agent_id.to_string())),
            WaitOutcome::TimedOut => {
                self.notify("Wait timed out without any new messages.".to_string());
                Ok(Step::Continue)
            }
            WaitOutcome::Message | WaitOutcome::AutoResumed => Ok(Step::Continue),
        }
    }

    /// Settle the agent in a terminal status; the parent receives the report
    fn end(&mut self, status: AgentStatus, report: AgentReport) -> AgentStatus {
        let graph = Arc::clone(&self.deps.graph);
        let status = match graph.status(&self.state.agent_id) {
            Some(AgentStatus::Stopping) => AgentStatus::Stopped,
            _ => status,
        };
        match graph.end_agent(&self.state.agent_id, status, report) {
            Ok(effective) => {
                self.state.status = effective;
                effective
            }
            Err(e) => {
                warn!(agent_id = %self.state.agent_id, "Failed to settle agent: {}", e);
                status
            }
        }
    }

    fn beat(&mut self, phase: &str, detail: Option<&str>) {
        self.state.touch(phase, detail.map(str::to_string));
        self.deps
            .graph
            .touch_heartbeat(&self.state.agent_id, phase, detail);
    }
}

fn task_message(name: &str, task: &str, fixes: &[String], is_root: bool) -> String {
    if is_root {
        return task.to_string();
    }
    let mut out = format!("<agent_task>\n<agent_name>{name}</agent_name>\n<task>{task}</task>\n");
    if !fixes.is_empty() {
        out.push_str(&format!("<fixes>{}</fixes>\n", fixes.join(", ")));
    }
    out.push_str("</agent_task>");
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::agents::{CreateAgentRequest, StaticPrompts};
    use crate::providers::{ModelError, Role};
    use crate::state::HeartbeatStore;

    /// Replays canned turns; an exhausted script keeps failing terminally
    struct ScriptedModel {
        turns: Mutex<VecDeque<std::result::Result<ModelTurn, ModelError>>>,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<std::result::Result<ModelTurn, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                requests: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_tools(&self) -> bool {
            true
        }

        async fn complete(&self, request: ModelRequest) -> std::result::Result<ModelTurn, ModelError> {
            self.requests.lock().unwrap().push(request);
            self.turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::new(Some(400), "script exhausted")))
        }
    }

    /// Registers children without starting them
    struct GraphOnly(Arc<AgentGraph>);

    impl AgentSpawner for GraphOnly {
        fn spawn_agent(&self, request: CreateAgentRequest, _: &[ChatMessage]) -> Result<AgentId> {
            self.0.create_agent(request)
        }
    }

    fn config() -> ScanConfig {
        let mut config = ScanConfig::default();
        config.llm.retry_initial_delay_ms = 1;
        config.llm.retry_max_delay_ms = 1;
        config.llm.auto_resume_cooldown_s = 0;
        config
    }

    fn setup(config: ScanConfig, model: Arc<ScriptedModel>) -> (AgentDeps, AgentId, AgentId) {
        let graph = Arc::new(AgentGraph::new(&config.agents, Arc::new(HeartbeatStore::new())));
        let root = graph
            .create_agent(CreateAgentRequest::root("root", "assess the target", false))
            .unwrap();
        let child = graph
            .create_agent(CreateAgentRequest::child(root.clone(), "recon", "map the app"))
            .unwrap();
        let deps = AgentDeps {
            router: Arc::new(ToolExecutionRouter::standard("scan", Duration::from_secs(5), None)),
            graph,
            model,
            prompts: Arc::new(StaticPrompts::default_prompts()),
            config: Arc::new(config),
        };
        (deps, root, child)
    }

    fn call(name: &str, args: serde_json::Value, id: &str) -> ModelTurn {
        ModelTurn::default().with_call(ToolCall::new(name, args).with_id(id))
    }

    #[tokio::test]
    async fn test_child_finishes_and_reports_to_parent() {
        let model = ScriptedModel::new(vec![
            Ok(ModelTurn::text("thinking")),
            Ok(call("agent_finish", json!({"result_summary": "found login form"}), "c1")),
        ]);
        let (deps, root, child) = setup(config(), model.clone());
        let graph = Arc::clone(&deps.graph);
        let agent = Agent::new(&child, deps, vec![]).unwrap();
        assert!(agent.history()[0].content.contains("<agent_task>"));

        let outcome = agent.run(&GraphOnly(Arc::clone(&graph))).await;
        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.iterations, 2);

        let inbox = graph.take_messages(&root);
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].body.contains("found login form"));

        let requests = model.requests.lock().unwrap();
        let second = &requests[1].messages;
        assert!(second.iter().any(|m| m.content.starts_with("No tool was called")));
        assert!(requests[0].tools.iter().any(|t| t.name == "agent_finish"));
    }

    #[tokio::test]
    async fn test_terminal_model_failure_is_sticky() {
        let model = ScriptedModel::new(vec![Err(ModelError::new(Some(401), "HTTP 401 Unauthorized"))]);
        let (deps, root, child) = setup(config(), model);
        let graph = Arc::clone(&deps.graph);
        let outcome = Agent::new(&child, deps, vec![])
            .unwrap()
            .run(&GraphOnly(Arc::clone(&graph)))
            .await;

        assert_eq!(outcome.status, AgentStatus::LlmFailed);
        assert_eq!(graph.status(&child), Some(AgentStatus::LlmFailed));
        assert!(graph.take_messages(&root)[0].body.contains("<status>FAILED</status>"));
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_auto_resume() {
        let mut config = config();
        config.llm.max_transient_retries = 1;
        let model = ScriptedModel::new(vec![
            Err(ModelError::new(Some(503), "overloaded")),
            Err(ModelError::new(Some(503), "overloaded")),
            Ok(call("agent_finish", json!({"result_summary": "done"}), "c1")),
        ]);
        let (deps, _root, child) = setup(config, model.clone());
        let graph = Arc::clone(&deps.graph);
        let outcome = Agent::new(&child, deps, vec![])
            .unwrap()
            .run(&GraphOnly(Arc::clone(&graph)))
            .await;

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(model.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_iteration_budget_forces_wrap_up() {
        let mut config = config();
        config.agents.max_iterations = 2;
        config.agents.wrap_up_grace_iterations = 1;
        let model = ScriptedModel::new((0..5).map(|_| Ok(ModelTurn::text("still going"))).collect());
        let (deps, root, child) = setup(config, model.clone());
        let graph = Arc::clone(&deps.graph);
        let outcome = Agent::new(&child, deps, vec![])
            .unwrap()
            .run(&GraphOnly(Arc::clone(&graph)))
            .await;

        assert_eq!(outcome.status, AgentStatus::Stopped);
        assert_eq!(outcome.iterations, 4);
        assert_eq!(model.requests.lock().unwrap().len(), 3);
        let requests = model.requests.lock().unwrap();
        assert!(!requests[0].messages.iter().any(|m| m.content.contains("Wrap up now")));
        assert!(requests[1]
            .messages
            .iter()
            .any(|m| m.role == Role::User
                && m.content.starts_with("<system_notice>")
                && m.content.contains("Wrap up now")));
        assert!(graph.take_messages(&root)[0].body.contains("iteration budget exhausted"));
    }

    #[tokio::test]
    async fn test_wait_then_resume_on_message() {
        let model = ScriptedModel::new(vec![
            Ok(call("wait_for_message", json!({"reason": "waiting for parent"}), "c1")),
            Ok(call("agent_finish", json!({"result_summary": "ok"}), "c2")),
        ]);
        let (deps, root, child) = setup(config(), model.clone());
        let graph = Arc::clone(&deps.graph);

        let sender = {
            let graph = Arc::clone(&graph);
            let (root, child) = (root.clone(), child.clone());
            tokio::spawn(async move {
                while graph.status(&child) != Some(AgentStatus::Waiting) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                graph
                    .send_message(crate::agents::Message::new(
                        crate::agents::MessageSender::Agent(root),
                        child,
                        "carry on",
                    ))
                    .unwrap();
            })
        };

        let outcome = Agent::new(&child, deps, vec![])
            .unwrap()
            .run(&GraphOnly(Arc::clone(&graph)))
            .await;
        sender.await.unwrap();

        assert_eq!(outcome.status, AgentStatus::Completed);
        let requests = model.requests.lock().unwrap();
        assert!(requests[1].messages.iter().any(|m| m.content.contains("carry on")));
    }

    #[tokio::test]
    async fn test_wait_timeout_arrives_as_system_notice() {
        let model = ScriptedModel::new(vec![
            Ok(call("wait_for_message", json!({"reason": "nothing", "timeout_s": 1}), "c1")),
            Ok(call("agent_finish", json!({"result_summary": "ok"}), "c2")),
        ]);
        let (deps, _root, child) = setup(config(), model.clone());
        let graph = Arc::clone(&deps.graph);
        let outcome = Agent::new(&child, deps, vec![])
            .unwrap()
            .run(&GraphOnly(Arc::clone(&graph)))
            .await;

        assert_eq!(outcome.status, AgentStatus::Completed);
        let requests = model.requests.lock().unwrap();
        assert!(requests[1].messages.iter().any(|m| m.content
            == "<system_notice>\nWait timed out without any new messages.\n</system_notice>"));
        assert_eq!(graph.pending_messages(&child), 0);
    }

    #[tokio::test]
    async fn test_stop_while_waiting() {
        let model = ScriptedModel::new(vec![Ok(call(
            "wait_for_message",
            json!({"reason": "idle"}),
            "c1",
        ))]);
        let (deps, root, child) = setup(config(), model);
        let graph = Arc::clone(&deps.graph);

        let stopper = {
            let graph = Arc::clone(&graph);
            let child = child.clone();
            tokio::spawn(async move {
                while graph.status(&child) != Some(AgentStatus::Waiting) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                graph.stop_agent(&child).unwrap();
            })
        };

        let outcome = Agent::new(&child, deps, vec![])
            .unwrap()
            .run(&GraphOnly(Arc::clone(&graph)))
            .await;
        stopper.await.unwrap();

        assert_eq!(outcome.status, AgentStatus::Stopped);
        assert!(graph.take_messages(&root)[0].body.contains("<status>STOPPED</status>"));
    }
}
