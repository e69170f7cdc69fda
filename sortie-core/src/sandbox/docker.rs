//! Docker-backed sandbox containers

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{CreateContainerOptions, RemoveContainerOptions, StartContainerOptions};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::protocol::{PORT_ENV, TIMEOUT_ENV, TOKEN_ENV};
use super::runtime::{SandboxBackend, SandboxEndpoint};
use crate::config::SandboxConfig;
use crate::{Error, Result};

const LABEL_SCAN: &str = "sortie.scan_id";
const LABEL_PORT: &str = "sortie.host_port";
const LABEL_TOKEN: &str = "sortie.token";

/// Read-only mount point for host source directories
const SOURCE_MOUNT: &str = "/source";

pub fn container_name(scan_id: &str) -> String {
    format!("sortie-scan-{scan_id}")
}

/// Starts one container per scan running `sortie tool-server`
pub struct DockerBackend {
    config: SandboxConfig,
}

impl DockerBackend {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    // Each agent thread has its own runtime, so connect per operation
    fn connect() -> Result<Docker> {
        Ok(Docker::connect_with_local_defaults()?)
    }

    fn source_mounts(&self) -> Vec<(PathBuf, String)> {
        self.config
            .sources
            .iter()
            .filter_map(|path| {
                if !path.is_dir() {
                    warn!("Source path is not a directory: {}", path.display());
                    return None;
                }
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some((path.clone(), name))
            })
            .collect()
    }

    async fn create_container(&self, docker: &Docker, scan_id: &str, token: &str) -> Result<SandboxEndpoint> {
        let name = container_name(scan_id);
        let host_port = free_port()?;
        let container_port = format!("{}/tcp", self.config.tool_server_port);
        let mounts = self.source_mounts();

        let binds = mounts
            .iter()
            .map(|(host, name)| format!("{}:{SOURCE_MOUNT}/{name}:ro", host.display()))
            .collect();

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(HashMap::from([(
                container_port.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            )])),
            cap_add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
            memory: Some(4 * 1024 * 1024 * 1024),
            pids_limit: Some(2048),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            hostname: Some("sortie".to_string()),
            working_dir: Some(self.config.workspace_dir.clone()),
            env: Some(vec![
                format!("{TOKEN_ENV}={token}"),
                format!("{PORT_ENV}={}", self.config.tool_server_port),
                format!("{TIMEOUT_ENV}={}", self.config.execution_timeout_s),
            ]),
            labels: Some(HashMap::from([
                (LABEL_SCAN.to_string(), scan_id.to_string()),
                (LABEL_PORT.to_string(), host_port.to_string()),
                (LABEL_TOKEN.to_string(), token.to_string()),
            ])),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            host_config: Some(host_config),
            cmd: Some(vec!["sortie".to_string(), "tool-server".to_string()]),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };
        let response = docker.create_container(Some(options), body).await?;

        // A labelled container is reused as-is by later creates, so it must
        // not outlive a failed start or seed
        let prepared = async {
            docker
                .start_container(&name, None::<StartContainerOptions>)
                .await?;
            info!(container = %response.id, host_port, "Sandbox container started");
            for (_, dir) in &mounts {
                self.seed_workspace(docker, &response.id, dir).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        discard_on_failure(prepared, self.destroy(&response.id)).await?;

        Ok(SandboxEndpoint {
            container_id: response.id,
            base_url: format!("http://127.0.0.1:{host_port}"),
            token: token.to_string(),
        })
    }

    /// Copy a read-only source mount into the writable workspace
    async fn seed_workspace(&self, docker: &Docker, container_id: &str, dir: &str) -> Result<()> {
        let target = Path::new(&self.config.workspace_dir).join(dir);
        let script = format!(
            "mkdir -p '{target}' && cp -a '{SOURCE_MOUNT}/{dir}/.' '{target}/'",
            target = target.display()
        );
        let (exit_code, output) = exec(docker, container_id, vec!["sh", "-c", &script]).await?;
        if exit_code != 0 {
            return Err(Error::Sandbox(format!(
                "seeding workspace from {dir} failed ({exit_code}): {output}"
            )));
        }
        debug!(container = %container_id, dir, "Workspace seeded");
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn create(&self, scan_id: &str, token: &str) -> Result<SandboxEndpoint> {
        let docker = Self::connect()?;
        let name = container_name(scan_id);

        match docker.inspect_container(&name, None::<bollard::query_parameters::InspectContainerOptions>).await {
            Ok(info) => {
                let labels = info
                    .config
                    .and_then(|c| c.labels)
                    .unwrap_or_default();
                let port = labels.get(LABEL_PORT).and_then(|p| p.parse::<u16>().ok());
                let existing_token = labels.get(LABEL_TOKEN).cloned();
                let container_id = info.id.unwrap_or_else(|| name.clone());

                if let (Some(port), Some(existing_token)) = (port, existing_token) {
                    if info.state.and_then(|s| s.running) != Some(true) {
                        info!("Starting existing sandbox container: {}", name);
                        docker
                            .start_container(&name, None::<StartContainerOptions>)
                            .await?;
                    }
                    return Ok(SandboxEndpoint {
                        container_id,
                        base_url: format!("http://127.0.0.1:{port}"),
                        token: existing_token,
                    });
                }

                warn!("Recreating sandbox container without sortie labels: {}", name);
                self.destroy(&container_id).await?;
                self.create_container(&docker, scan_id, token).await
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                info!("Creating sandbox container: {}", name);
                self.create_container(&docker, scan_id, token).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self, container_id: &str) -> Result<()> {
        let docker = Self::connect()?;
        info!("Removing sandbox container: {}", container_id);
        match docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run `remove` when preparing a new container failed, keeping the original error
async fn discard_on_failure<F>(prepared: Result<()>, remove: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let Err(e) = prepared else {
        return Ok(());
    };
    if let Err(remove_err) = remove.await {
        warn!("Failed to remove half-prepared sandbox container: {}", remove_err);
    }
    Err(e)
}

/// Ask the OS for an unused local port
fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Run a command in the container, returning exit code and combined output
async fn exec(docker: &Docker, container_id: &str, cmd: Vec<&str>) -> Result<(i64, String)> {
    let exec_config = CreateExecOptions {
        cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };
    let exec = docker.create_exec(container_id, exec_config).await?;

    let mut output = String::new();
    if let StartExecResults::Attached {
        output: mut stream, ..
    } = docker.start_exec(&exec.id, None).await?
    {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => warn!("Error reading exec output: {}", e),
            }
        }
    }

    let inspect = docker.inspect_exec(&exec.id).await?;
    Ok((inspect.exit_code.unwrap_or(-1), output))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("abc"), "sortie-scan-abc");
    }

    #[test]
    fn test_source_mounts_skip_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DockerBackend::new(SandboxConfig {
            sources: vec![dir.path().to_path_buf(), PathBuf::from("/definitely/not/here")],
            ..SandboxConfig::default()
        });
        let mounts = backend.source_mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].0, dir.path());
    }

    fn seed_failure() -> Error {
        Error::Sandbox("seeding workspace from app failed (1): cp: Permission denied".to_string())
    }

    #[tokio::test]
    async fn test_failed_seed_removes_container() {
        let removed = AtomicBool::new(false);
        let result = discard_on_failure(Err(seed_failure()), async {
            removed.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Sandbox(msg)) if msg.contains("seeding workspace")));
        assert!(removed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_seed_error_survives_failed_removal() {
        let result = discard_on_failure(Err(seed_failure()), async {
            Err(Error::Sandbox("daemon went away".to_string()))
        })
        .await;

        assert!(matches!(result, Err(Error::Sandbox(msg)) if msg.contains("Permission denied")));
    }

    #[tokio::test]
    async fn test_prepared_container_is_kept() {
        let removed = AtomicBool::new(false);
        discard_on_failure(Ok(()), async {
            removed.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert!(!removed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_destroy_missing_container_is_ok() {
        let backend = DockerBackend::new(SandboxConfig::default());
        backend.destroy("sortie-scan-does-not-exist").await.unwrap();
    }
}
