//! Command execution

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use sortie_core::sandbox::ToolServer;
use sortie_core::state::ledger::LEDGER_FILE;
use sortie_core::state::RunLedger;
use tracing::{debug, info};

/// Serve sandboxed tools until ctrl-c
pub async fn run_tool_server(
    token: String,
    host: &str,
    port: u16,
    timeout: Duration,
    workspace: PathBuf,
) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let server = Arc::new(ToolServer::standard(workspace, token, timeout));
    let tools = server.tool_names().join(", ");
    let handle = server
        .bind(addr)
        .await
        .context("failed to start tool server")?;
    info!(addr = %handle.local_addr(), tools = %tools, "Tool server listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down tool server");
    handle.shutdown().await;
    Ok(())
}

/// Most recently modified run directory under `run_dir` that holds a ledger
pub fn latest_run(run_dir: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(run_dir)
        .with_context(|| format!("failed to read run directory {}", run_dir.display()))?;

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let ledger = entry.path().join(LEDGER_FILE);
        let Ok(modified) = ledger.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if latest.as_ref().is_none_or(|(newest, _)| modified > *newest) {
            latest = Some((modified, entry.path()));
        }
    }

    let (_, run) = latest.with_context(|| format!("no runs found in {}", run_dir.display()))?;
    debug!(run = %run.display(), "Inspecting latest run");
    Ok(run)
}

fn ledger_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(LEDGER_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Print a summary of a run ledger
pub fn run_inspect(path: &Path, json: bool) -> Result<()> {
    let path = ledger_path(path);
    let ledger = RunLedger::inspect(&path)
        .with_context(|| format!("failed to open ledger {}", path.display()))?;

    let status = ledger.scan_status()?.unwrap_or_else(|| "unknown".to_string());
    let agents = ledger.agents()?;
    let tools = ledger.tool_stats()?;
    let vulns = ledger.vulnerabilities()?;
    let stalls = ledger.stall_recoveries()?;

    if json {
        let summary = serde_json::json!({
            "scan_id": ledger.scan_id(),
            "status": status,
            "agents": agents,
            "tools": tools,
            "vulnerabilities": vulns,
            "stall_recoveries": stalls,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Scan {} ({status})", ledger.scan_id());
    println!();
    println!("Agents ({}):", agents.len());
    for agent in &agents {
        let parent = agent.parent_id.as_deref().unwrap_or("-");
        println!(
            "  {:<16} {:<20} {:<18} parent={parent}",
            agent.id, agent.name, agent.status
        );
    }

    println!();
    println!("Tools:");
    if tools.is_empty() {
        println!("  (none)");
    }
    for tool in &tools {
        println!(
            "  {:<28} calls={:<5} failures={:<4} avg={:.0}ms",
            tool.tool_name, tool.calls, tool.failures, tool.avg_duration_ms
        );
    }

    println!();
    println!("Vulnerabilities ({}):", vulns.len());
    for vuln in &vulns {
        println!(
            "  {} [{}] {} ({})",
            vuln.id,
            vuln.severity,
            vuln.title,
            vuln.endpoint.as_deref().unwrap_or("-")
        );
    }

    if stalls > 0 {
        println!();
        println!("Stall recoveries: {stalls}");
    }
    Ok(())
}
