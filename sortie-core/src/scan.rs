//! A scan: one agent graph, one router, one thread per agent
//!
//! [`Scan`] owns the collaborators shared by every agent and implements
//! [`AgentSpawner`]: each registered agent gets a dedicated OS thread running
//! its own current-thread tokio runtime. When the root's loop ends, every
//! remaining agent is asked to stop.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::agents::context::inherit_context;
use crate::agents::finish::AgentReport;
use crate::agents::{
    Agent, AgentDeps, AgentGraph, AgentId, AgentOutcome, CreateAgentRequest, Message,
    MessageSender, PromptSource, ScanReport, StaticPrompts,
};
use crate::config::ScanConfig;
use crate::providers::{ChatMessage, ModelClient};
use crate::sandbox::SandboxRuntime;
use crate::state::AgentStatus;
use crate::telemetry::Telemetry;
use crate::tools::{AgentSpawner, ToolExecutionRouter, VulnerabilityReport};
use crate::{Error, Result};

/// Final state of a scan after every agent thread has ended
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub root_status: Option<AgentStatus>,
    pub agents: Vec<AgentOutcome>,
    pub report: Option<ScanReport>,
    pub vulnerabilities: Vec<VulnerabilityReport>,
}

impl ScanSummary {
    pub fn is_finished(&self) -> bool {
        self.root_status == Some(AgentStatus::Completed) && self.report.is_some()
    }
}

struct ScanShared {
    this: Weak<ScanShared>,
    scan_id: String,
    deps: AgentDeps,
    threads: Mutex<Vec<JoinHandle<AgentOutcome>>>,
}

impl ScanShared {
    fn start_worker(&self, id: &AgentId, inherited: Vec<ChatMessage>) -> Result<()> {
        let shared = self
            .this
            .upgrade()
            .ok_or_else(|| Error::InvalidRequest("scan is shutting down".into()))?;
        let agent = Agent::new(id, self.deps.clone(), inherited)?;
        let agent_id = id.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("agent-{id}"))
            .spawn(move || shared.run_worker(agent_id, agent));

        match spawned {
            Ok(handle) => {
                self.threads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle);
                Ok(())
            }
            Err(e) => {
                error!(agent_id = %id, "Failed to spawn agent thread: {}", e);
                self.abandon(id, format!("could not start agent thread: {e}"));
                Err(Error::Io(e))
            }
        }
    }

    /// Thread body: a private runtime drives the agent to completion
    fn run_worker(&self, id: AgentId, agent: Agent) -> AgentOutcome {
        let is_root = self.deps.graph.root_id().as_ref() == Some(&id);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();

        let outcome = match runtime {
            Ok(runtime) => runtime.block_on(agent.run(self)),
            Err(e) => {
                error!(agent_id = %id, "Failed to build agent runtime: {}", e);
                let status = self.abandon(&id, format!("could not start agent runtime: {e}"));
                AgentOutcome {
                    agent_id: id,
                    status,
                    iterations: 0,
                }
            }
        };

        if is_root {
            info!(scan_id = %self.scan_id, status = %outcome.status, "Root agent ended; stopping remaining agents");
            self.deps.graph.stop_all();
        }
        outcome
    }

    fn abandon(&self, id: &AgentId, reason: String) -> AgentStatus {
        self.deps
            .graph
            .end_agent(id, AgentStatus::LlmFailed, AgentReport::failed(reason))
            .unwrap_or(AgentStatus::LlmFailed)
    }

    fn take_threads(&self) -> Vec<JoinHandle<AgentOutcome>> {
        std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl AgentSpawner for ScanShared {
    fn spawn_agent(&self, request: CreateAgentRequest, inherited: &[ChatMessage]) -> Result<AgentId> {
        let inherit = request.inherit_context;
        let id = self.deps.graph.create_agent(request)?;
        let limits = &self.deps.config.agents;
        let context = if inherit {
            inherit_context(
                inherited,
                limits.inherited_context_threshold,
                limits.inherited_recent_messages,
            )
        } else {
            vec![]
        };
        if let Err(e) = self.start_worker(&id, context) {
            self.abandon(&id, e.to_string());
            return Err(e);
        }
        Ok(id)
    }
}

/// Handle to a running scan
pub struct Scan {
    shared: Arc<ScanShared>,
    root: Mutex<Option<AgentId>>,
}

impl Scan {
    pub fn new(
        config: ScanConfig,
        model: Arc<dyn ModelClient>,
        telemetry: Arc<dyn Telemetry>,
        sandbox: Option<Arc<SandboxRuntime>>,
    ) -> Self {
        let short: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        Self::with_id(format!("scan-{short}"), config, model, telemetry, sandbox)
    }

    pub fn with_id(
        scan_id: impl Into<String>,
        config: ScanConfig,
        model: Arc<dyn ModelClient>,
        telemetry: Arc<dyn Telemetry>,
        sandbox: Option<Arc<SandboxRuntime>>,
    ) -> Self {
        let scan_id = scan_id.into();
        let graph = Arc::new(AgentGraph::new(&config.agents, telemetry));
        let router = Arc::new(ToolExecutionRouter::standard(
            scan_id.clone(),
            Duration::from_secs(config.agents.wait_timeout_s),
            sandbox,
        ));
        let deps = AgentDeps {
            graph,
            router,
            model,
            prompts: Arc::new(StaticPrompts::default_prompts()),
            config: Arc::new(config),
        };
        Self::from_deps(scan_id, deps)
    }

    /// Assemble a scan from prepared collaborators
    pub fn from_deps(scan_id: impl Into<String>, deps: AgentDeps) -> Self {
        let scan_id = scan_id.into();
        let shared = Arc::new_cyclic(|this| ScanShared {
            this: this.clone(),
            scan_id,
            deps,
            threads: Mutex::new(vec![]),
        });
        Self {
            shared,
            root: Mutex::new(None),
        }
    }

    /// Replace the prompt source; only effective before `start`
    pub fn with_prompts(self, prompts: Arc<dyn PromptSource>) -> Self {
        let mut deps = self.shared.deps.clone();
        deps.prompts = prompts;
        Self::from_deps(self.shared.scan_id.clone(), deps)
    }

    pub fn id(&self) -> &str {
        &self.shared.scan_id
    }

    pub fn graph(&self) -> &Arc<AgentGraph> {
        &self.shared.deps.graph
    }

    pub fn root_id(&self) -> Option<AgentId> {
        self.root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register the root agent and start its thread
    pub fn start(&self, task: &str, source_available: bool) -> Result<AgentId> {
        let request = CreateAgentRequest::root("root", task, source_available);
        let id = self.shared.spawn_agent(request, &[])?;
        *self.root.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        info!(scan_id = %self.id(), agent_id = %id, source_available, "Scan started");
        Ok(id)
    }

    /// Deliver a user message (for example to resume an llm_failed agent)
    pub fn send_user_message(&self, to: &AgentId, body: impl Into<String>) -> Result<()> {
        self.graph()
            .send_message(Message::new(MessageSender::User, to.clone(), body))
    }

    pub fn stop(&self) {
        self.graph().stop_all();
    }

    /// Block until every agent thread, including ones spawned meanwhile, ends
    pub fn join(&self) -> ScanSummary {
        let mut agents = Vec::new();
        loop {
            let handles = self.shared.take_threads();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                match handle.join() {
                    Ok(outcome) => agents.push(outcome),
                    Err(_) => error!(scan_id = %self.id(), "Agent thread panicked"),
                }
            }
        }

        let graph = self.graph();
        ScanSummary {
            scan_id: self.id().to_string(),
            root_status: self.root_id().and_then(|id| graph.status(&id)),
            agents,
            report: graph.scan_report(),
            vulnerabilities: graph.vulnerability_reports(),
        }
    }

    /// Stop all agents and destroy the scan's sandbox container
    pub async fn teardown(&self) -> Result<()> {
        self.stop();
        if let Some(runtime) = self.shared.deps.router.sandbox() {
            match runtime.teardown(self.id(), true).await {
                Ok(true) => info!(scan_id = %self.id(), "Sandbox destroyed"),
                Ok(false) => {}
                Err(e) => {
                    warn!(scan_id = %self.id(), "Sandbox teardown failed: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use super::*;
    use crate::agents::PromptContext;
    use crate::providers::{ModelError, ModelRequest, ModelTurn};
    use crate::state::HeartbeatStore;

    struct Silent(Mutex<VecDeque<ModelTurn>>);

    #[async_trait]
    impl ModelClient for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        fn supports_tools(&self) -> bool {
            true
        }

        async fn complete(&self, _: ModelRequest) -> std::result::Result<ModelTurn, ModelError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ModelError::new(Some(400), "no more turns"))
        }
    }

    #[test]
    fn test_root_failure_ends_scan() {
        let scan = Scan::with_id(
            "scan-test",
            ScanConfig::default(),
            Arc::new(Silent(Mutex::new(VecDeque::new()))),
            Arc::new(HeartbeatStore::new()),
            None,
        );
        let root = scan.start("audit", false).unwrap();
        let summary = scan.join();

        assert_eq!(summary.scan_id, "scan-test");
        assert_eq!(summary.root_status, Some(AgentStatus::LlmFailed));
        assert!(!summary.is_finished());
        assert_eq!(summary.agents.len(), 1);
        assert_eq!(summary.agents[0].agent_id, root);
    }

    #[test]
    fn test_second_start_rejected() {
        let scan = Scan::new(
            ScanConfig::default(),
            Arc::new(Silent(Mutex::new(VecDeque::new()))),
            Arc::new(HeartbeatStore::new()),
            None,
        );
        assert!(scan.id().starts_with("scan-"));
        scan.start("audit", false).unwrap();
        let err = scan.start("again", false).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        scan.join();
    }

    /// Records each system prompt, then refuses the turn
    struct Capture(Mutex<Vec<String>>);

    #[async_trait]
    impl ModelClient for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn supports_tools(&self) -> bool {
            true
        }

        async fn complete(&self, request: ModelRequest) -> std::result::Result<ModelTurn, ModelError> {
            self.0.lock().unwrap().push(request.system);
            Err(ModelError::new(Some(400), "refused"))
        }
    }

    struct Fixed(Mutex<Vec<bool>>);

    impl PromptSource for Fixed {
        fn system_prompt(&self, ctx: &PromptContext<'_>) -> String {
            self.0.lock().unwrap().push(ctx.is_root);
            "You are the house auditor.".to_string()
        }
    }

    #[test]
    fn test_custom_prompts_reach_the_model() {
        let model = Arc::new(Capture(Mutex::new(vec![])));
        let prompts = Arc::new(Fixed(Mutex::new(vec![])));
        let scan = Scan::with_id(
            "scan-prompts",
            ScanConfig::default(),
            model.clone(),
            Arc::new(HeartbeatStore::new()),
            None,
        )
        .with_prompts(prompts.clone());
        assert_eq!(scan.id(), "scan-prompts");

        scan.start("audit", false).unwrap();
        scan.join();

        assert_eq!(*prompts.0.lock().unwrap(), vec![true]);
        let systems = model.0.lock().unwrap();
        assert!(!systems.is_empty());
        assert!(systems.iter().all(|s| s.starts_with("You are the house auditor.")));
    }
}
