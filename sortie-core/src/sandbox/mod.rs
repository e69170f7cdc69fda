//! Sandbox container lifecycle, its HTTP client and the in-container server

pub mod client;
pub mod docker;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use client::SandboxClient;
pub use docker::DockerBackend;
pub use protocol::{ExecuteRequest, ExecuteResponse, ExecuteStatus, HealthResponse};
pub use runtime::{SandboxBackend, SandboxEndpoint, SandboxHandle, SandboxRuntime};
pub use server::{ToolServer, ToolServerHandle};
