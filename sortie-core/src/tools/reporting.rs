//! Vulnerability reporting tool

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::registry::{LocalTool, ToolContext, ToolDefinition, ToolOutcome, parse_args};
use crate::Result;
use crate::agents::AgentId;

/// Severity level for vulnerabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Info => write!(f, "info"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "info" | "informational" => Ok(Severity::Info),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Report fields supplied by the reporting agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportDraft {
    pub title: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub remediation: Option<String>,
    #[serde(default)]
    pub cwe: Option<String>,
}

/// A stored vulnerability report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    /// `vuln-0001`, `vuln-0002`, ...
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub description: String,
    pub endpoint: Option<String>,
    pub evidence: Option<String>,
    pub remediation: Option<String>,
    pub cwe: Option<String>,
    pub reported_by: AgentId,
    pub created_at: DateTime<Utc>,
}

impl VulnerabilityReport {
    pub fn from_draft(id: String, reported_by: AgentId, draft: ReportDraft) -> Self {
        Self {
            id,
            title: draft.title,
            severity: draft.severity,
            description: draft.description,
            endpoint: draft.endpoint,
            evidence: draft.evidence,
            remediation: draft.remediation,
            cwe: draft.cwe,
            reported_by,
            created_at: Utc::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_report(n: u32, severity: Severity) -> Self {
        Self::from_draft(
            format!("vuln-{n:04}"),
            AgentId::from("agent_root"),
            ReportDraft {
                title: format!("finding {n}"),
                severity,
                description: "test".to_string(),
                ..ReportDraft::default()
            },
        )
    }
}

// ============================================================================
// CreateVulnerabilityReportTool
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateReportArgs {
    pub title: String,
    pub severity: String,
    pub description: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub remediation: Option<String>,
    #[serde(default)]
    pub cwe: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateReportOutput {
    pub success: bool,
    pub report_id: String,
    pub message: String,
}

pub struct CreateVulnerabilityReportTool;

#[async_trait]
impl LocalTool for CreateVulnerabilityReportTool {
    fn name(&self) -> &'static str {
        "create_vulnerability_report"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Record a validated vulnerability. Only report issues you have confirmed with evidence. Returns the report id (e.g. vuln-0001); pass it in `fixes` when creating a fix agent."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Short title, e.g. 'SQL injection in /api/search'"},
                    "severity": {"type": "string", "enum": ["critical", "high", "medium", "low", "info"]},
                    "description": {"type": "string", "description": "What the issue is and its impact"},
                    "endpoint": {"type": "string", "description": "Affected URL, route or file"},
                    "evidence": {"type": "string", "description": "Request/response or PoC proving the issue"},
                    "remediation": {"type": "string", "description": "How to fix it"},
                    "cwe": {"type": "string", "description": "CWE identifier, e.g. CWE-89"}
                },
                "required": ["title", "severity", "description"]
            }),
        }
    }

    async fn call(&self, args: serde_json::Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let args: CreateReportArgs = parse_args(self.name(), args)?;
        let severity = args
            .severity
            .parse::<Severity>()
            .map_err(crate::Error::InvalidRequest)?;
        if args.title.trim().is_empty() {
            return Err(crate::Error::InvalidRequest(
                "report title must not be empty".into(),
            ));
        }

        let report = ctx.graph.add_vulnerability_report(
            ctx.agent_id,
            ReportDraft {
                title: args.title,
                severity,
                description: args.description,
                endpoint: args.endpoint,
                evidence: args.evidence,
                remediation: args.remediation,
                cwe: args.cwe,
            },
        )?;

        ToolOutcome::serialize(&CreateReportOutput {
            success: true,
            message: format!("Recorded {} ({}): {}", report.id, report.severity, report.title),
            report_id: report.id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_parse() {
        assert_eq!("HIGH".parse::<Severity>(), Ok(Severity::High));
        assert_eq!("informational".parse::<Severity>(), Ok(Severity::Info));
        assert!("severe".parse::<Severity>().is_err());
    }

    #[test]
    fn test_report_serializes_lowercase_severity() {
        let report = VulnerabilityReport::test_report(3, Severity::Critical);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["id"], "vuln-0003");
        assert_eq!(json["severity"], "critical");
    }
}
