//! Shell tool executed inside the sandbox container

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

use super::registry::{SandboxedTool, ToolDefinition, parse_args};
use crate::Result;

/// Maximum output size in bytes (1MB)
const MAX_OUTPUT_SIZE: usize = 1_048_576;

/// Arguments for the shell tool
#[derive(Debug, Deserialize)]
pub struct TerminalArgs {
    /// The shell command to execute
    pub command: String,
    /// Working directory, relative to the workspace
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

/// Output from the shell tool
#[derive(Debug, Serialize)]
pub struct TerminalOutput {
    /// Combined stdout and stderr
    pub output: String,
    pub exit_code: i64,
    pub truncated: bool,
    pub timed_out: bool,
}

/// Runs `sh -c` in the container's workspace
pub struct TerminalTool {
    workspace: PathBuf,
    default_timeout: Duration,
}

impl TerminalTool {
    pub fn new(workspace: impl Into<PathBuf>, default_timeout: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            default_timeout,
        }
    }

    fn resolve_workdir(&self, workdir: Option<&str>) -> PathBuf {
        match workdir {
            Some(dir) if dir.starts_with('/') => PathBuf::from(dir),
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        }
    }
}

#[async_trait]
impl SandboxedTool for TerminalTool {
    fn name(&self) -> &'static str {
        "terminal_execute"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Execute a shell command in the sandbox container. The workspace holds a writable copy of the target source when it is available. Returns combined stdout/stderr and the exit code."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute (e.g., 'curl -si http://target/login')"
                    },
                    "workdir": {
                        "type": "string",
                        "description": "Directory to run in, relative to the workspace"
                    },
                    "timeout_s": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Give up on the command after this many seconds"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, args: serde_json::Value) -> Result<serde_json::Value> {
        let args: TerminalArgs = parse_args(self.name(), args)?;
        let workdir = self.resolve_workdir(args.workdir.as_deref());
        let timeout = args
            .timeout_s
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        debug!(command = %args.command, workdir = %workdir.display(), "Executing");

        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("{} 2>&1", args.command))
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!("Command execution timed out after {} seconds", timeout.as_secs());
                return Ok(serde_json::to_value(TerminalOutput {
                    output: format!("Command timed out after {} seconds", timeout.as_secs()),
                    exit_code: -1,
                    truncated: false,
                    timed_out: true,
                })?);
            }
        };

        let mut bytes = output.stdout;
        bytes.extend_from_slice(&output.stderr);
        let truncated = bytes.len() > MAX_OUTPUT_SIZE;
        bytes.truncate(MAX_OUTPUT_SIZE);
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if truncated {
            text.push_str("\n[OUTPUT TRUNCATED - exceeded 1MB limit]");
        }

        Ok(serde_json::to_value(TerminalOutput {
            output: text,
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            truncated,
            timed_out: false,
        })?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tool(dir: &std::path::Path) -> TerminalTool {
        TerminalTool::new(dir, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = tool(dir.path())
            .execute(json!({"command": "ls"}))
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert!(out["output"].as_str().unwrap().contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_captures_stderr_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(dir.path())
            .execute(json!({"command": "echo oops >&2; exit 3"}))
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 3);
        assert!(out["output"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(dir.path())
            .execute(json!({"command": "sleep 5", "timeout_s": 1}))
            .await
            .unwrap();
        assert_eq!(out["timed_out"], true);
        assert_eq!(out["exit_code"], -1);
    }

    #[test]
    fn test_relative_workdir() {
        let t = TerminalTool::new("/workspace", Duration::from_secs(1));
        assert_eq!(t.resolve_workdir(Some("app")), PathBuf::from("/workspace/app"));
        assert_eq!(t.resolve_workdir(Some("/tmp")), PathBuf::from("/tmp"));
    }
}
