//! Wire types for the in-container tool server

use serde::{Deserialize, Serialize};

use crate::agents::AgentId;

/// Environment variable carrying the bearer token inside the container
pub const TOKEN_ENV: &str = "SORTIE_TOOL_SERVER_TOKEN";
/// Environment variable carrying the listen port inside the container
pub const PORT_ENV: &str = "SORTIE_TOOL_SERVER_PORT";
/// Environment variable carrying the per-request timeout in seconds
pub const TIMEOUT_ENV: &str = "SORTIE_TOOL_TIMEOUT_S";

pub const EXECUTE_PATH: &str = "/execute";
pub const HEALTH_PATH: &str = "/health";

/// Body of `POST /execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub agent_id: AgentId,
    pub tool_name: String,
    #[serde(default, alias = "kwargs")]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Ok,
    Error,
    /// The server's own per-request limit fired
    Timeout,
    /// A newer request from the same agent replaced this one
    Cancelled,
}

/// Response of `POST /execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub status: ExecuteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteResponse {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            status: ExecuteStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(status: ExecuteStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Response of `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_agents: usize,
    #[serde(default)]
    pub agents: Vec<AgentId>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_accepts_kwargs_alias() {
        let req: ExecuteRequest = serde_json::from_value(json!({
            "agent_id": "agent_1",
            "tool_name": "terminal_execute",
            "kwargs": {"command": "id"}
        }))
        .unwrap();
        assert_eq!(req.args["command"], "id");
    }

    #[test]
    fn test_timeout_response_shape() {
        let resp = ExecuteResponse::failed(ExecuteStatus::Timeout, "Tool timed out after 120s");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "timeout");
        assert!(json.get("result").is_none());
    }
}
