//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sortie_core::sandbox::protocol::{PORT_ENV, TIMEOUT_ENV, TOKEN_ENV};

#[derive(Debug, Parser)]
#[command(name = "sortie")]
#[command(author, version, about = "Orchestration core for multi-agent security assessments")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve sandboxed tools over HTTP (runs inside the scan container)
    ToolServer {
        /// Bearer token required on /execute
        #[arg(long, env = TOKEN_ENV, hide_env_values = true)]
        token: String,

        /// Port to listen on
        #[arg(long, env = PORT_ENV, default_value_t = 48081)]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Hard per-request timeout in seconds
        #[arg(long, env = TIMEOUT_ENV, default_value_t = 120)]
        timeout: u64,

        /// Working directory for shell commands
        #[arg(long, default_value = "/workspace")]
        workspace: PathBuf,
    },

    /// Summarize a finished or running scan from its ledger
    Inspect {
        /// Ledger file, or a run directory containing ledger.db.
        /// Defaults to the latest run under the configured output.run_dir
        path: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

impl Args {
    /// Default tracing filter for the `-v` count; RUST_LOG still wins
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn,sortie=info,sortie_core=info",
            1 => "info,sortie=debug,sortie_core=debug",
            _ => "debug,sortie=trace,sortie_core=trace",
        }
    }
}
