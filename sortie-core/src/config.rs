//! Configuration types for sortie scans

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::Error;
use crate::agents::watchdog::WatchdogConfig;

/// Hard cap on concurrently active agents per scan
pub const DEFAULT_MAX_AGENTS: usize = 10;

/// Maximum number of skills a single agent may load
pub const MAX_SKILLS_PER_AGENT: usize = 5;

/// Agent graph and worker loop limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    pub max_agents: usize,
    pub max_iterations: u32,
    /// Extra iterations granted after the warning turn before wrap-up is forced
    pub wrap_up_grace_iterations: u32,
    pub max_skills: usize,
    /// Inherited parent histories longer than this are summarized
    pub inherited_context_threshold: usize,
    /// Number of most recent parent messages kept verbatim when summarizing
    pub inherited_recent_messages: usize,
    /// Default timeout for `wait_for_message`, in seconds
    pub wait_timeout_s: u64,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_agents: DEFAULT_MAX_AGENTS,
            max_iterations: 300,
            wrap_up_grace_iterations: 10,
            max_skills: MAX_SKILLS_PER_AGENT,
            inherited_context_threshold: 15,
            inherited_recent_messages: 10,
            wait_timeout_s: 600,
        }
    }
}

/// Model call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Transient (408/429/5xx) retries before the agent is marked llm_failed
    pub max_transient_retries: usize,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Cooldown before a retryable llm_failed sub-agent resumes on its own
    pub auto_resume_cooldown_s: u64,
    pub max_auto_resume_attempts: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            auto_resume_cooldown_s: 10,
            max_auto_resume_attempts: 2,
        }
    }
}

/// Sandbox container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    /// Port the tool server listens on inside the container
    pub tool_server_port: u16,
    /// Hard per-request timeout enforced by the tool server
    pub execution_timeout_s: u64,
    pub connect_timeout_s: u64,
    /// How long to poll `/health` before giving up on a new container
    pub health_timeout_s: u64,
    /// Attempts for a sandbox request that cannot reach the tool server
    pub unreachable_retries: usize,
    pub workspace_dir: String,
    /// Host directories seeded into the container workspace
    pub sources: Vec<PathBuf>,
    /// Fixed bearer token; a random one is generated when absent
    pub token: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "sortie-sandbox:latest".to_string(),
            tool_server_port: 48081,
            execution_timeout_s: 120,
            connect_timeout_s: 10,
            health_timeout_s: 60,
            unreachable_retries: 3,
            workspace_dir: "/workspace".to_string(),
            sources: vec![],
            token: None,
        }
    }
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Parent of the per-scan `<scan_id>/ledger.db` directories
    pub run_dir: PathBuf,
}

fn default_run_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sortie")
        .join("runs")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
        }
    }
}

/// Complete scan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub agents: AgentLimits,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl ScanConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string; watchdog values are clamped
    pub fn parse(content: &str) -> crate::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.watchdog = config.watchdog.clamped();
        Ok(config)
    }

    /// Load configuration from default locations with cascade:
    /// 1. ./sortie.toml (local override)
    /// 2. ~/.sortie/config.toml (global defaults)
    /// 3. Built-in defaults
    pub fn load_default() -> Self {
        let mut candidates = vec![PathBuf::from("sortie.toml")];
        candidates.extend(Self::global_config_path());
        Self::load_first(&candidates)
    }

    /// First candidate that exists and parses wins; unreadable files are skipped
    pub fn load_first(candidates: &[PathBuf]) -> Self {
        let mut config = candidates
            .iter()
            .find_map(|path| match Self::from_file(path) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded configuration");
                    Some(config)
                }
                Err(Error::Io(_)) => None,
                Err(e) => {
                    warn!(path = %path.display(), "Ignoring invalid configuration: {}", e);
                    None
                }
            })
            .unwrap_or_default();
        config.expand_env_vars();
        config
    }

    /// Get the path to the global config file
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".sortie").join("config.toml"))
    }

    /// Expand `${VAR}` references in secret fields
    pub fn expand_env_vars(&mut self) {
        self.sandbox.token = self.sandbox.token.take().map(expand_env_ref);
    }
}

fn expand_env_ref(value: String) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        if let Ok(expanded) = std::env::var(var_name) {
            return expanded;
        }
    }
    value
}
