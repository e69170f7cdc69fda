//! HTTP client for the in-container tool server

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::Retryable;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::protocol::{EXECUTE_PATH, ExecuteRequest, ExecuteResponse, HEALTH_PATH, HealthResponse};
use crate::config::SandboxConfig;
use crate::providers::{RetryConfig, build_backoff};
use crate::{Error, Result};

/// Interval between `/health` probes while a container starts
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Extra time allowed on top of the server's own execution limit
const RESPONSE_GRACE: Duration = Duration::from_secs(15);

/// Client bound to one sandbox container
#[derive(Debug, Clone)]
pub struct SandboxClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    retry: RetryConfig,
}

impl SandboxClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, config: &SandboxConfig) -> Result<Self> {
        // Agents run on separate runtimes; a pooled connection would be bound
        // to whichever runtime opened it.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_s))
            .timeout(Duration::from_secs(config.execution_timeout_s) + RESPONSE_GRACE)
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            retry: RetryConfig {
                max_retries: config.unreachable_retries.saturating_sub(1),
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                jitter: false,
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a tool in the container, retrying while the server is unreachable
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let attempts = AtomicUsize::new(0);
        let result = (|| async {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.post_execute(request).await
        })
        .retry(build_backoff(&self.retry))
        .when(|e| matches!(e, Error::SandboxUnreachable { .. }))
        .notify(|e, delay| {
            warn!(tool = %request.tool_name, "Sandbox unreachable, retrying in {:?}: {}", delay, e);
        })
        .await;

        result.map_err(|e| match e {
            Error::SandboxUnreachable { message, .. } => Error::SandboxUnreachable {
                attempts: attempts.load(Ordering::Relaxed),
                message,
            },
            other => other,
        })
    }

    async fn post_execute(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, EXECUTE_PATH))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(unreachable_or_http)?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(Error::Sandbox("tool server rejected the bearer token".into()))
            }
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
                Err(Error::SandboxUnreachable {
                    attempts: 1,
                    message: format!("tool server returned {status}"),
                })
            }
            _ => {
                let body = response.bytes().await?;
                serde_json::from_slice(&body).map_err(|e| {
                    Error::Sandbox(format!("malformed tool server response ({status}): {e}"))
                })
            }
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, HEALTH_PATH))
            .timeout(RESPONSE_GRACE)
            .send()
            .await
            .map_err(unreachable_or_http)?;
        if !response.status().is_success() {
            return Err(Error::SandboxUnreachable {
                attempts: 1,
                message: format!("health check returned {}", response.status()),
            });
        }
        Ok(response.json().await?)
    }

    /// Poll `/health` until the server answers or `timeout` passes
    pub async fn wait_until_healthy(&self, timeout: Duration) -> Result<HealthResponse> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            match self.health().await {
                Ok(health) => {
                    debug!(url = %self.base_url, attempts, "Tool server healthy");
                    return Ok(health);
                }
                Err(e) if tokio::time::Instant::now() + HEALTH_POLL_INTERVAL < deadline => {
                    debug!(url = %self.base_url, "Tool server not ready: {}", e);
                    tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(Error::SandboxUnreachable {
                        attempts,
                        message: format!("tool server did not become healthy within {:?}: {e}", timeout),
                    });
                }
            }
        }
    }
}

fn unreachable_or_http(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_request() {
        Error::SandboxUnreachable {
            attempts: 1,
            message: e.to_string(),
        }
    } else {
        Error::Http(e)
    }
}
