//! SQLite run ledger
//!
//! Persists the lifecycle of one scan (agents, status transitions, the latest
//! heartbeat per agent, tool executions, vulnerability reports) so a run can be
//! inspected after the process exits.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::warn;

use crate::agents::AgentId;
use crate::state::{Heartbeat, run_migrations};
use crate::telemetry::{LifecycleEvent, Telemetry};
use crate::tools::VulnerabilityReport;
use crate::Result;

/// File name of the ledger inside a run directory
pub const LEDGER_FILE: &str = "ledger.db";

/// One row of the `agents` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub task: String,
    pub skills: Vec<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub agent_id: String,
    pub from_status: String,
    pub to_status: String,
    pub at: String,
}

/// Aggregated tool executions per tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStats {
    pub tool_name: String,
    pub calls: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VulnerabilityRecord {
    pub id: String,
    pub title: String,
    pub severity: String,
    pub endpoint: Option<String>,
    pub reported_by: String,
    pub created_at: String,
}

/// SQLite-backed [`Telemetry`] sink
pub struct RunLedger {
    scan_id: String,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl RunLedger {
    /// Create (or reopen) the ledger for `scan_id` at `path`
    pub fn open(path: impl AsRef<Path>, scan_id: impl Into<String>, task: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, scan_id.into(), Some(path.to_path_buf()), task)
    }

    /// Ledger in `<run_dir>/<scan_id>/ledger.db`
    pub fn for_run(run_dir: impl AsRef<Path>, scan_id: &str, task: Option<&str>) -> Result<Self> {
        let path = run_dir.as_ref().join(scan_id).join(LEDGER_FILE);
        Self::open(path, scan_id, task)
    }

    pub fn in_memory(scan_id: impl Into<String>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, scan_id.into(), None, None)
    }

    /// Open an existing ledger read-only for inspection
    pub fn inspect(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let scan_id: String = conn
            .query_row("SELECT id FROM scans ORDER BY started_at LIMIT 1", [], |row| row.get(0))
            .optional()?
            .unwrap_or_default();
        Ok(Self {
            scan_id,
            path: Some(path.as_ref().to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: Connection, scan_id: String, path: Option<PathBuf>, task: Option<&str>) -> Result<Self> {
        run_migrations(&conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO scans (id, task, status, started_at) VALUES (?1, ?2, 'running', ?3)",
            params![scan_id, task, Utc::now().to_rfc3339()],
        )?;
        Ok(Self {
            scan_id,
            path,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Mark the scan finished with a final status
    pub fn finish_scan(&self, status: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE scans SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status, Utc::now().to_rfc3339(), self.scan_id],
        )?;
        Ok(())
    }

    pub fn scan_status(&self) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT status FROM scans WHERE id = ?1",
                params![self.scan_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn agents(&self) -> Result<Vec<AgentRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, name, task, skills, status, created_at, updated_at
             FROM agents ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            let skills: String = row.get(4)?;
            Ok(AgentRecord {
                id: row.get(0)?,
                parent_id: row.get(1)?,
                name: row.get(2)?,
                task: row.get(3)?,
                skills: serde_json::from_str(&skills).unwrap_or_default(),
                status: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn transitions(&self, agent_id: &str) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT agent_id, from_status, to_status, at FROM status_transitions
             WHERE agent_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok(TransitionRecord {
                agent_id: row.get(0)?,
                from_status: row.get(1)?,
                to_status: row.get(2)?,
                at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn tool_stats(&self) -> Result<Vec<ToolStats>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT tool_name, COUNT(*), SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), AVG(duration_ms)
             FROM tool_executions GROUP BY tool_name ORDER BY COUNT(*) DESC, tool_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ToolStats {
                tool_name: row.get(0)?,
                calls: row.get::<_, i64>(1)?.max(0) as u64,
                failures: row.get::<_, i64>(2)?.max(0) as u64,
                avg_duration_ms: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn vulnerabilities(&self) -> Result<Vec<VulnerabilityRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, severity, endpoint, reported_by, created_at
             FROM vulnerabilities ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(VulnerabilityRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                severity: row.get(2)?,
                endpoint: row.get(3)?,
                reported_by: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn stall_recoveries(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM stall_recoveries", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn write_heartbeat(&self, agent_id: &AgentId, phase: &str, detail: Option<&str>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO heartbeats (agent_id, phase, detail, at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id) DO UPDATE SET phase = excluded.phase, detail = excluded.detail, at = excluded.at",
            params![agent_id.as_str(), phase, detail, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn read_heartbeat(&self, agent_id: &AgentId) -> Result<Option<Heartbeat>> {
        let row: Option<(String, Option<String>, String)> = self
            .conn()
            .query_row(
                "SELECT phase, detail, at FROM heartbeats WHERE agent_id = ?1",
                params![agent_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row.and_then(|(phase, detail, at)| {
            let timestamp = DateTime::parse_from_rfc3339(&at).ok()?.with_timezone(&Utc);
            Some(Heartbeat {
                timestamp,
                phase,
                detail,
            })
        }))
    }

    fn write_event(&self, event: &LifecycleEvent) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        match event {
            LifecycleEvent::AgentCreated {
                agent_id,
                parent_id,
                name,
                task,
                skills,
            } => {
                conn.execute(
                    "INSERT OR REPLACE INTO agents (id, parent_id, name, task, skills, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'initializing', ?6, ?6)",
                    params![
                        agent_id.as_str(),
                        parent_id.as_ref().map(AgentId::as_str),
                        name,
                        task,
                        serde_json::to_string(skills)?,
                        now
                    ],
                )?;
            }
            LifecycleEvent::StatusChanged { agent_id, from, to } => {
                conn.execute(
                    "INSERT INTO status_transitions (agent_id, from_status, to_status, at) VALUES (?1, ?2, ?3, ?4)",
                    params![agent_id.as_str(), from.as_str(), to.as_str(), now],
                )?;
                conn.execute(
                    "UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![to.as_str(), now, agent_id.as_str()],
                )?;
            }
            LifecycleEvent::MessageSent {
                message_id,
                from,
                to,
            } => {
                conn.execute(
                    "INSERT OR IGNORE INTO messages (id, sender, recipient, at) VALUES (?1, ?2, ?3, ?4)",
                    params![message_id, from, to.as_str(), now],
                )?;
            }
            LifecycleEvent::ToolExecuted {
                agent_id,
                tool,
                sandboxed,
                duration_ms,
                success,
            } => {
                conn.execute(
                    "INSERT INTO tool_executions (agent_id, tool_name, sandboxed, duration_ms, success, at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        agent_id.as_str(),
                        tool,
                        sandboxed,
                        i64::try_from(*duration_ms).unwrap_or(i64::MAX),
                        success,
                        now
                    ],
                )?;
            }
            LifecycleEvent::StallRecovered {
                agent_id,
                stall_count,
                reason,
            } => {
                conn.execute(
                    "INSERT INTO stall_recoveries (agent_id, stall_count, reason, at) VALUES (?1, ?2, ?3, ?4)",
                    params![agent_id.as_str(), stall_count, reason, now],
                )?;
            }
            LifecycleEvent::FinishRejected {
                agent_id,
                code,
                reason,
            } => {
                conn.execute(
                    "INSERT INTO finish_rejections (agent_id, code, reason, at) VALUES (?1, ?2, ?3, ?4)",
                    params![agent_id.as_str(), code, reason, now],
                )?;
            }
            LifecycleEvent::VulnerabilityReported { report } => insert_report(&conn, report)?,
        }
        Ok(())
    }
}

fn insert_report(conn: &Connection, report: &VulnerabilityReport) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO vulnerabilities
         (id, title, severity, description, endpoint, evidence, remediation, cwe, reported_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            report.id,
            report.title,
            report.severity.to_string(),
            report.description,
            report.endpoint,
            report.evidence,
            report.remediation,
            report.cwe,
            report.reported_by.as_str(),
            report.created_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

impl Telemetry for RunLedger {
    fn touch_heartbeat(&self, agent_id: &AgentId, phase: &str, detail: Option<&str>) {
        if let Err(e) = self.write_heartbeat(agent_id, phase, detail) {
            warn!(agent_id = %agent_id, "Failed to persist heartbeat: {}", e);
        }
    }

    fn get_heartbeat(&self, agent_id: &AgentId) -> Option<Heartbeat> {
        match self.read_heartbeat(agent_id) {
            Ok(beat) => beat,
            Err(e) => {
                warn!(agent_id = %agent_id, "Failed to read heartbeat: {}", e);
                None
            }
        }
    }

    fn record_event(&self, event: &LifecycleEvent) {
        if let Err(e) = self.write_event(event) {
            warn!(scan_id = %self.scan_id, "Failed to persist lifecycle event: {}", e);
        }
    }
}
