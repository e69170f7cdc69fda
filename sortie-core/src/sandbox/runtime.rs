//! Per-scan sandbox registry
//!
//! One container per scan id. Concurrent first-use callers serialize on a
//! creation lock keyed by scan id, so they converge on the same container.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::client::SandboxClient;
use super::protocol::{ExecuteRequest, ExecuteResponse};
use crate::agents::AgentId;
use crate::config::SandboxConfig;
use crate::Result;

/// Where a started sandbox can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEndpoint {
    pub container_id: String,
    pub base_url: String,
    /// Token the tool server was started with
    pub token: String,
}

/// Creates and destroys sandbox containers
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Find or start the container for `scan_id`, seeding its workspace
    async fn create(&self, scan_id: &str, token: &str) -> Result<SandboxEndpoint>;

    async fn destroy(&self, container_id: &str) -> Result<()>;
}

/// A ready sandbox shared by every agent of one scan
#[derive(Debug)]
pub struct SandboxHandle {
    pub scan_id: String,
    pub endpoint: SandboxEndpoint,
    client: SandboxClient,
    holders: Mutex<HashSet<AgentId>>,
}

impl SandboxHandle {
    fn holders(&self) -> MutexGuard<'_, HashSet<AgentId>> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client(&self) -> &SandboxClient {
        &self.client
    }

    /// Agents that have used this sandbox and not released it
    pub fn holder_count(&self) -> usize {
        self.holders().len()
    }

    pub async fn execute(
        &self,
        agent_id: &AgentId,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<ExecuteResponse> {
        self.client
            .execute(&ExecuteRequest {
                agent_id: agent_id.clone(),
                tool_name: tool_name.to_string(),
                args,
            })
            .await
    }
}

pub struct SandboxRuntime {
    backend: Arc<dyn SandboxBackend>,
    config: SandboxConfig,
    handles: Mutex<HashMap<String, Arc<SandboxHandle>>>,
    /// One per scan id for the life of the runtime, surviving teardown
    creation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SandboxRuntime {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: SandboxConfig) -> Self {
        Self {
            backend,
            config,
            handles: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, Arc<SandboxHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn creation_lock(&self, scan_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .creation_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(scan_id.to_string()).or_default())
    }

    pub fn handle(&self, scan_id: &str) -> Option<Arc<SandboxHandle>> {
        self.handles().get(scan_id).cloned()
    }

    fn claim(&self, scan_id: &str, agent_id: &AgentId) -> Option<Arc<SandboxHandle>> {
        let handle = self.handle(scan_id)?;
        handle.holders().insert(agent_id.clone());
        Some(handle)
    }

    /// Return the scan's sandbox, creating it on first use
    pub async fn ensure_sandbox(&self, scan_id: &str, agent_id: &AgentId) -> Result<Arc<SandboxHandle>> {
        if let Some(handle) = self.claim(scan_id, agent_id) {
            return Ok(handle);
        }

        let lock = self.creation_lock(scan_id);
        let _guard = lock.lock().await;
        if let Some(handle) = self.claim(scan_id, agent_id) {
            return Ok(handle);
        }

        let token = self
            .config
            .token
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        info!(scan_id, agent_id = %agent_id, "Creating sandbox");
        let endpoint = self.backend.create(scan_id, &token).await?;
        let client = SandboxClient::new(&endpoint.base_url, &endpoint.token, &self.config)?;

        let health_timeout = Duration::from_secs(self.config.health_timeout_s);
        if let Err(e) = client.wait_until_healthy(health_timeout).await {
            warn!(scan_id, container = %endpoint.container_id, "Sandbox failed health check: {}", e);
            if let Err(destroy_err) = self.backend.destroy(&endpoint.container_id).await {
                warn!(container = %endpoint.container_id, "Failed to remove unhealthy sandbox: {}", destroy_err);
            }
            return Err(e);
        }

        let handle = Arc::new(SandboxHandle {
            scan_id: scan_id.to_string(),
            endpoint,
            client,
            holders: Mutex::new(HashSet::from([agent_id.clone()])),
        });
        self.handles().insert(scan_id.to_string(), Arc::clone(&handle));
        info!(scan_id, url = %handle.endpoint.base_url, "Sandbox ready");
        Ok(handle)
    }

    /// Drop an agent's claim; the container stays up until teardown
    pub fn release(&self, scan_id: &str, agent_id: &AgentId) -> usize {
        match self.handle(scan_id) {
            Some(handle) => {
                let mut holders = handle.holders();
                holders.remove(agent_id);
                debug!(scan_id, agent_id = %agent_id, remaining = holders.len(), "Released sandbox");
                holders.len()
            }
            None => 0,
        }
    }

    /// Destroy the scan's container. Without `force`, refuses while agents
    /// still hold it.
    pub async fn teardown(&self, scan_id: &str, force: bool) -> Result<bool> {
        let handle = {
            let mut handles = self.handles();
            match handles.get(scan_id) {
                None => return Ok(false),
                Some(h) if !force && h.holder_count() > 0 => {
                    debug!(scan_id, holders = h.holder_count(), "Sandbox still in use");
                    return Ok(false);
                }
                Some(_) => handles.remove(scan_id),
            }
        };
        if let Some(handle) = handle {
            info!(scan_id, container = %handle.endpoint.container_id, "Tearing down sandbox");
            self.backend.destroy(&handle.endpoint.container_id).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sandbox::server::{ToolServer, ToolServerHandle};

    /// Starts an in-process tool server per "container"
    struct InProcessBackend {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        servers: tokio::sync::Mutex<Vec<ToolServerHandle>>,
    }

    impl InProcessBackend {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                servers: tokio::sync::Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl SandboxBackend for InProcessBackend {
        async fn create(&self, scan_id: &str, token: &str) -> Result<SandboxEndpoint> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            let server = Arc::new(ToolServer::standard("/tmp", token, Duration::from_secs(5)));
            let handle = server.bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
            let endpoint = SandboxEndpoint {
                container_id: format!("{scan_id}-{n}"),
                base_url: handle.url(),
                token: token.to_string(),
            };
            self.servers.lock().await.push(handle);
            Ok(endpoint)
        }

        async fn destroy(&self, _container_id: &str) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_use_creates_one_container() {
        let backend = Arc::new(InProcessBackend::new());
        let runtime = Arc::new(SandboxRuntime::new(backend.clone(), SandboxConfig::default()));

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    runtime
                        .ensure_sandbox("scan-1", &AgentId::from(format!("agent_{i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap().endpoint.container_id.clone());
        }

        assert_eq!(backend.created.load(Ordering::SeqCst), 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(runtime.handle("scan-1").unwrap().holder_count(), 4);
    }

    #[tokio::test]
    async fn test_teardown_respects_holders_unless_forced() {
        let backend = Arc::new(InProcessBackend::new());
        let runtime = SandboxRuntime::new(backend.clone(), SandboxConfig::default());
        let agent = AgentId::from("agent_a");
        runtime.ensure_sandbox("scan-1", &agent).await.unwrap();

        assert!(!runtime.teardown("scan-1", false).await.unwrap());
        assert_eq!(runtime.release("scan-1", &agent), 0);
        assert!(runtime.teardown("scan-1", false).await.unwrap());
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert!(runtime.handle("scan-1").is_none());
        assert!(!runtime.teardown("scan-1", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_keeps_creation_serialized() {
        let backend = Arc::new(InProcessBackend::new());
        let runtime = SandboxRuntime::new(backend.clone(), SandboxConfig::default());
        runtime.ensure_sandbox("scan-1", &AgentId::from("agent_a")).await.unwrap();

        // A creator already holds the lock when the old container goes away
        let lock = runtime.creation_lock("scan-1");
        let guard = lock.lock().await;
        assert!(runtime.teardown("scan-1", true).await.unwrap());

        let agent = AgentId::from("agent_b");
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            runtime.ensure_sandbox("scan-1", &agent),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(backend.created.load(Ordering::SeqCst), 1);

        drop(guard);
        let handle = runtime.ensure_sandbox("scan-1", &agent).await.unwrap();
        assert_eq!(handle.endpoint.container_id, "scan-1-1");
        assert_eq!(backend.created.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&lock, &runtime.creation_lock("scan-1")));
    }

    #[tokio::test]
    async fn test_execute_through_handle() {
        let backend = Arc::new(InProcessBackend::new());
        let runtime = SandboxRuntime::new(backend, SandboxConfig::default());
        let agent = AgentId::from("agent_a");
        let handle = runtime.ensure_sandbox("scan-1", &agent).await.unwrap();
        let response = handle
            .execute(&agent, "terminal_execute", serde_json::json!({"command": "echo hi"}))
            .await
            .unwrap();
        assert_eq!(response.status, crate::sandbox::protocol::ExecuteStatus::Ok);
        assert!(response.result.unwrap()["output"].as_str().unwrap().contains("hi"));
    }
}
