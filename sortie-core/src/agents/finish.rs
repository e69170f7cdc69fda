//! Finish gating
//!
//! A sub-agent may always finish. The root's `finish_scan` is gated, in order:
//!
//! 1. only the root may call it;
//! 2. no other agent may be active (`initializing`, `running`, `waiting`,
//!    `stalled_recovered`, `stopping`);
//! 3. in source-available scans, every reported vulnerability needs a completed
//!    fixer. This gate is soft: it bounces at most [`MAX_REMEDIATION_BOUNCES`]
//!    times per root and then lets the finish through with a warning;
//! 4. the scan report sections must be non-empty.
//!
//! Coverage: a fixer created with explicit `fixes` links covers exactly those
//! reports. Completed fixers without links (named `*fix*`, or carrying the
//! `remediation` skill) each cover one of the reports still uncovered.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{AgentId, AgentNode};
use crate::Error;
use crate::state::AgentStatus;
use crate::tools::VulnerabilityReport;

pub const MAX_REMEDIATION_BOUNCES: u32 = 2;

/// Result attached by a sub-agent when it finishes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl AgentReport {
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            ..Self::default()
        }
    }

    /// Message delivered to the parent when the agent ends
    pub fn render_completion(&self, name: &str, id: &AgentId, status: AgentStatus) -> String {
        let label = match status {
            AgentStatus::Completed if self.success => "SUCCESS",
            AgentStatus::Stopped => "STOPPED",
            _ => "FAILED",
        };
        let mut out = format!(
            "<agent_completion_report>\n<agent_name>{name}</agent_name>\n<agent_id>{id}</agent_id>\n<status>{label}</status>\n<summary>{}</summary>\n",
            self.summary
        );
        if !self.findings.is_empty() {
            out.push_str("<findings>\n");
            for finding in &self.findings {
                out.push_str(&format!("- {finding}\n"));
            }
            out.push_str("</findings>\n");
        }
        if !self.recommendations.is_empty() {
            out.push_str("<recommendations>\n");
            for rec in &self.recommendations {
                out.push_str(&format!("- {rec}\n"));
            }
            out.push_str("</recommendations>\n");
        }
        out.push_str("</agent_completion_report>");
        out
    }
}

/// Final report submitted with `finish_scan`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub executive_summary: String,
    pub methodology: String,
    pub technical_analysis: String,
    pub recommendations: String,
}

impl ScanReport {
    /// Names of the sections that are empty or whitespace
    pub fn missing_sections(&self) -> Vec<&'static str> {
        [
            ("executive_summary", &self.executive_summary),
            ("methodology", &self.methodology),
            ("technical_analysis", &self.technical_analysis),
            ("recommendations", &self.recommendations),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

#[derive(Debug, Clone)]
pub enum FinishRequest {
    Agent(AgentReport),
    Scan(ScanReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Sub-agent completed, report delivered to the parent
    AgentCompleted,
    /// Root finished; `forced` when the remediation gate was overridden
    ScanFinished { forced: bool },
}

/// Soft rejection returned to the calling agent as a tool result
#[derive(Debug, Clone, PartialEq)]
pub struct FinishRejection {
    pub code: &'static str,
    pub reason: String,
    pub details: serde_json::Value,
}

impl FinishRejection {
    pub fn new(code: &'static str, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl From<FinishRejection> for Error {
    fn from(rejection: FinishRejection) -> Self {
        let reason = if rejection.details.is_null() {
            rejection.reason
        } else {
            format!("{} {}", rejection.reason, rejection.details)
        };
        Error::FinishRejected {
            code: rejection.code.to_string(),
            reason,
        }
    }
}

/// Reject when any agent other than the root is still active
pub fn check_active_agents<'a>(
    root: &AgentId,
    nodes: impl IntoIterator<Item = &'a AgentNode>,
) -> Result<(), FinishRejection> {
    let active: Vec<&AgentNode> = nodes
        .into_iter()
        .filter(|n| &n.id != root && n.status.is_active())
        .collect();
    if active.is_empty() {
        return Ok(());
    }

    let stopping: Vec<_> = active
        .iter()
        .filter(|n| n.status == AgentStatus::Stopping)
        .map(|n| json!({"id": n.id, "name": n.name}))
        .collect();
    let listed: Vec<_> = active
        .iter()
        .map(|n| json!({"id": n.id, "name": n.name, "status": n.status}))
        .collect();
    let names: Vec<String> = active
        .iter()
        .map(|n| format!("{} ({}, {})", n.name, n.id, n.status))
        .collect();

    Err(FinishRejection::new(
        "agents_still_active",
        format!(
            "Cannot finish scan: {} agent(s) still active: {}. Wait for them to complete or stop them first.",
            active.len(),
            names.join(", ")
        ),
    )
    .with_details(json!({
        "active_agents": listed,
        "stopping_agents": stopping,
        "total_active": active.len(),
    })))
}

/// Heuristic for fixers created without explicit report links
pub fn is_unlinked_fixer(node: &AgentNode) -> bool {
    node.fixes.is_empty()
        && (node.name.to_lowercase().contains("fix")
            || node
                .skills
                .iter()
                .any(|s| s.eq_ignore_ascii_case("remediation")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub reported: usize,
    pub fixers_completed: usize,
    pub uncovered: Vec<String>,
}

impl Coverage {
    pub fn is_complete(&self) -> bool {
        self.uncovered.is_empty()
    }
}

/// Match reported vulnerabilities against completed fixers
pub fn remediation_coverage<'a>(
    reports: &[VulnerabilityReport],
    nodes: impl IntoIterator<Item = &'a AgentNode>,
) -> Coverage {
    let completed: Vec<&AgentNode> = nodes
        .into_iter()
        .filter(|n| n.status == AgentStatus::Completed)
        .filter(|n| !n.fixes.is_empty() || is_unlinked_fixer(n))
        .collect();

    let mut uncovered: Vec<String> = reports
        .iter()
        .map(|r| r.id.clone())
        .filter(|id| !completed.iter().any(|n| n.fixes.contains(id)))
        .collect();

    let unlinked = completed.iter().filter(|n| n.fixes.is_empty()).count();
    let drop = unlinked.min(uncovered.len());
    uncovered.drain(..drop);

    Coverage {
        reported: reports.len(),
        fixers_completed: completed.len(),
        uncovered,
    }
}

/// Apply the bounded remediation gate; `bounces` is the root's counter.
///
/// Returns `Ok(true)` when the finish goes through only because the bounce
/// budget is spent.
pub fn gate_remediation(coverage: &Coverage, bounces: &mut u32) -> Result<bool, FinishRejection> {
    if coverage.is_complete() {
        return Ok(false);
    }
    if *bounces >= MAX_REMEDIATION_BOUNCES {
        return Ok(true);
    }
    *bounces += 1;
    Err(FinishRejection::new(
        "remediation_incomplete",
        format!(
            "{} vulnerabilities reported but only {} fixing agent(s) completed. Create fix agents for: {} (attempt {}/{}).",
            coverage.reported,
            coverage.fixers_completed,
            coverage.uncovered.join(", "),
            bounces,
            MAX_REMEDIATION_BOUNCES
        ),
    )
    .with_details(json!({
        "vulnerabilities_reported": coverage.reported,
        "fixing_agents_completed": coverage.fixers_completed,
        "vulnerabilities_without_fixes": coverage.uncovered,
    })))
}

pub fn validate_scan_report(report: &ScanReport) -> Result<(), FinishRejection> {
    let missing = report.missing_sections();
    if missing.is_empty() {
        return Ok(());
    }
    Err(FinishRejection::new(
        "invalid_scan_report",
        format!("Scan report sections must not be empty: {}", missing.join(", ")),
    )
    .with_details(json!({ "missing_sections": missing })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::tools::Severity;

    fn node(id: &str, name: &str, status: AgentStatus) -> AgentNode {
        AgentNode {
            status,
            ..AgentNode::new(
                AgentId::from(id),
                Some(AgentId::from("agent_root")),
                name,
                "task",
                vec![],
                true,
            )
        }
    }

    fn report(n: u32) -> VulnerabilityReport {
        VulnerabilityReport::test_report(n, Severity::High)
    }

    #[test]
    fn test_active_agents_block_finish() {
        let root = AgentId::from("agent_root");
        let nodes = vec![
            node("agent_root", "root", AgentStatus::Running),
            node("agent_a", "recon", AgentStatus::Waiting),
            node("agent_b", "exploit", AgentStatus::Completed),
            node("agent_c", "fuzz", AgentStatus::Stopping),
        ];
        let rejection = check_active_agents(&root, &nodes).unwrap_err();
        assert_eq!(rejection.code, "agents_still_active");
        assert_eq!(rejection.details["total_active"], 2);
        assert_eq!(rejection.details["active_agents"][0]["status"], "waiting");
        assert_eq!(rejection.details["stopping_agents"][0]["id"], "agent_c");
    }

    #[test]
    fn test_terminal_agents_do_not_block_finish() {
        let root = AgentId::from("agent_root");
        let nodes = vec![
            node("agent_root", "root", AgentStatus::Running),
            node("agent_a", "recon", AgentStatus::Completed),
            node("agent_b", "scan", AgentStatus::LlmFailed),
            node("agent_c", "fuzz", AgentStatus::Stopped),
        ];
        assert!(check_active_agents(&root, &nodes).is_ok());
    }

    #[test]
    fn test_unlinked_fixers_cover_by_count() {
        let reports = vec![report(1), report(2)];
        let mut nodes = vec![node("agent_f1", "SQLi Fixer", AgentStatus::Completed)];
        let coverage = remediation_coverage(&reports, &nodes);
        assert_eq!(coverage.reported, 2);
        assert_eq!(coverage.fixers_completed, 1);
        assert_eq!(coverage.uncovered, vec!["vuln-0002".to_string()]);

        nodes.push(node("agent_f2", "xss-fix", AgentStatus::Completed));
        assert!(remediation_coverage(&reports, &nodes).is_complete());
    }

    #[test]
    fn test_running_fixer_does_not_count() {
        let reports = vec![report(1)];
        let nodes = vec![node("agent_f1", "fixer", AgentStatus::Running)];
        assert!(!remediation_coverage(&reports, &nodes).is_complete());
    }

    #[test]
    fn test_linked_fixer_covers_only_its_reports() {
        let reports = vec![report(1), report(2)];
        let mut linked = node("agent_f1", "patcher", AgentStatus::Completed);
        linked.fixes = vec!["vuln-0001".to_string()];
        let coverage = remediation_coverage(&reports, [&linked]);
        assert_eq!(coverage.uncovered, vec!["vuln-0002".to_string()]);
    }

    #[test]
    fn test_remediation_skill_marks_fixer() {
        let mut n = node("agent_f1", "patcher", AgentStatus::Completed);
        assert!(!is_unlinked_fixer(&n));
        n.skills = vec!["Remediation".to_string()];
        assert!(is_unlinked_fixer(&n));
    }

    #[test]
    fn test_gate_bounces_twice_then_allows() {
        let coverage = Coverage {
            reported: 2,
            fixers_completed: 1,
            uncovered: vec!["vuln-0002".to_string()],
        };
        let mut bounces = 0;

        let first = gate_remediation(&coverage, &mut bounces).unwrap_err();
        assert_eq!(first.code, "remediation_incomplete");
        assert_eq!(first.details["vulnerabilities_reported"], 2);
        assert_eq!(first.details["fixing_agents_completed"], 1);
        assert_eq!(bounces, 1);

        assert!(gate_remediation(&coverage, &mut bounces).is_err());
        assert_eq!(bounces, 2);

        assert_eq!(gate_remediation(&coverage, &mut bounces), Ok(true));
        assert_eq!(bounces, 2);
    }

    #[test]
    fn test_gate_passes_when_covered() {
        let coverage = Coverage {
            reported: 1,
            fixers_completed: 1,
            uncovered: vec![],
        };
        let mut bounces = 0;
        assert_eq!(gate_remediation(&coverage, &mut bounces), Ok(false));
        assert_eq!(bounces, 0);
    }

    #[test]
    fn test_scan_report_validation() {
        let report = ScanReport {
            executive_summary: "Two injection flaws".to_string(),
            methodology: "  ".to_string(),
            technical_analysis: "details".to_string(),
            recommendations: String::new(),
        };
        let rejection = validate_scan_report(&report).unwrap_err();
        assert_eq!(rejection.code, "invalid_scan_report");
        assert!(rejection.reason.contains("methodology"));
        assert!(rejection.reason.contains("recommendations"));
        assert!(!rejection.reason.contains("technical_analysis"));
    }

    #[test]
    fn test_completion_report_rendering() {
        let report = AgentReport {
            success: false,
            summary: "LLM processing timed out".to_string(),
            findings: vec!["admin panel at /admin".to_string()],
            recommendations: vec![],
        };
        let text = report.render_completion("Recon", &AgentId::from("agent_1"), AgentStatus::LlmFailed);
        assert!(text.starts_with("<agent_completion_report>"));
        assert!(text.contains("<status>FAILED</status>"));
        assert!(text.contains("- admin panel at /admin"));
        assert!(!text.contains("<recommendations>"));
    }

    #[test]
    fn test_rejection_into_error() {
        let err: Error = FinishRejection::new("agents_still_active", "busy").into();
        match err {
            Error::FinishRejected { code, reason } => {
                assert_eq!(code, "agents_still_active");
                assert_eq!(reason, "busy");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
