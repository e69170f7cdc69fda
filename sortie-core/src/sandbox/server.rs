//! In-container tool server
//!
//! Serves `POST /execute` and `GET /health` over HTTP/1. Every execute request
//! must carry the scan's bearer token. Each agent has at most one running task:
//! a new request from the same agent aborts the previous one, which then answers
//! with `cancelled`. Every task is bounded by the server's own timeout so a
//! hung tool answers `timeout` instead of holding the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::protocol::{
    EXECUTE_PATH, ExecuteRequest, ExecuteResponse, ExecuteStatus, HEALTH_PATH, HealthResponse,
};
use crate::Result;
use crate::agents::AgentId;
use crate::tools::{SandboxedTool, TerminalTool};

struct RunningTask {
    generation: u64,
    abort: AbortHandle,
}

/// Dispatches sandboxed tool calls inside the container
pub struct ToolServer {
    tools: HashMap<String, Arc<dyn SandboxedTool>>,
    token: String,
    timeout: Duration,
    tasks: Mutex<HashMap<AgentId, RunningTask>>,
    next_generation: AtomicU64,
}

impl ToolServer {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            token: token.into(),
            timeout,
            tasks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Server with the default sandboxed tool set
    pub fn standard(workspace: impl Into<std::path::PathBuf>, token: impl Into<String>, timeout: Duration) -> Self {
        Self::new(token, timeout).with_tool(Arc::new(TerminalTool::new(workspace, timeout)))
    }

    pub fn with_tool(mut self, tool: Arc<dyn SandboxedTool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<AgentId, RunningTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Agents with a task currently running
    pub fn active_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.tasks().keys().cloned().collect();
        agents.sort();
        agents
    }

    pub fn health(&self) -> HealthResponse {
        let agents = self.active_agents();
        HealthResponse {
            status: "healthy".to_string(),
            active_agents: agents.len(),
            agents,
        }
    }

    fn authorized(&self, header: Option<&str>) -> bool {
        header
            .and_then(|h| h.strip_prefix("Bearer "))
            .is_some_and(|token| token == self.token)
    }

    /// Run one request, replacing any task the same agent still has running
    pub async fn execute(&self, request: ExecuteRequest) -> ExecuteResponse {
        let Some(tool) = self.tools.get(&request.tool_name).cloned() else {
            return ExecuteResponse::failed(
                ExecuteStatus::Error,
                format!("Unknown sandbox tool: {}", request.tool_name),
            );
        };

        let started = Instant::now();
        let timeout = self.timeout;
        let args = request.args;
        let task: JoinHandle<Option<Result<serde_json::Value>>> = tokio::spawn(async move {
            tokio::time::timeout(timeout, tool.execute(args)).await.ok()
        });

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.tasks().insert(
            request.agent_id.clone(),
            RunningTask {
                generation,
                abort: task.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            debug!(agent_id = %request.agent_id, "Cancelling previous task");
            previous.abort.abort();
        }

        let joined = task.await;
        {
            let mut tasks = self.tasks();
            if tasks
                .get(&request.agent_id)
                .is_some_and(|t| t.generation == generation)
            {
                tasks.remove(&request.agent_id);
            }
        }

        let response = match joined {
            Ok(Some(Ok(result))) => ExecuteResponse::ok(result),
            Ok(Some(Err(e))) => ExecuteResponse::failed(ExecuteStatus::Error, e.to_string()),
            Ok(None) => ExecuteResponse::failed(
                ExecuteStatus::Timeout,
                format!("Tool timed out after {}s", timeout.as_secs()),
            ),
            Err(e) if e.is_cancelled() => ExecuteResponse::failed(
                ExecuteStatus::Cancelled,
                "Cancelled by a newer request from the same agent",
            ),
            Err(e) => ExecuteResponse::failed(ExecuteStatus::Error, format!("Tool task failed: {e}")),
        };

        info!(
            "[tool_server] agent={} tool={} duration={:.2}s status={:?}",
            request.agent_id,
            request.tool_name,
            started.elapsed().as_secs_f64(),
            response.status
        );
        response
    }

    /// Bind and serve until the returned handle is shut down
    pub async fn bind(self: Arc<Self>, addr: SocketAddr) -> Result<ToolServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Tool server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            accept_loop(listener, self, shutdown_rx).await;
        });

        Ok(ToolServerHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

/// A running tool server
pub struct ToolServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ToolServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Tool server accept loop ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    server: Arc<ToolServer>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("Tool server connection from {}", addr);
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let server = Arc::clone(&server);
                                handle_request(server, req)
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!("Tool server connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Tool server accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown_rx => {
                debug!("Tool server shutting down");
                break;
            }
        }
    }
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| {
            warn!("Failed to build HTTP response, returning empty 500");
            let mut resp = Response::new(Full::new(Bytes::new()));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &ExecuteResponse::failed(ExecuteStatus::Error, message))
}

async fn handle_request(
    server: Arc<ToolServer>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, HEALTH_PATH) => Ok(json_response(StatusCode::OK, &server.health())),
        (&Method::POST, EXECUTE_PATH) => {
            let auth = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if !server.authorized(auth) {
                return Ok(error_response(StatusCode::UNAUTHORIZED, "Invalid or missing bearer token"));
            }

            let body = req.collect().await?.to_bytes();
            let request: ExecuteRequest = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        &format!("Invalid request body: {e}"),
                    ));
                }
            };
            let response = server.execute(request).await;
            Ok(json_response(StatusCode::OK, &response))
        }
        (_, EXECUTE_PATH | HEALTH_PATH) => Ok(error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
        )),
        _ => Ok(error_response(StatusCode::NOT_FOUND, "Not found")),
    }
}
