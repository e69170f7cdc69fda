mod args;
mod runner;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use args::{Args, Command};
use sortie_core::config::ScanConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG overrides the -v level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::ToolServer {
            token,
            port,
            host,
            timeout,
            workspace,
        } => {
            runner::run_tool_server(token, &host, port, Duration::from_secs(timeout), workspace)
                .await
        }
        Command::Inspect { path, json } => {
            let path = match path {
                Some(path) => path,
                None => runner::latest_run(&ScanConfig::load_default().output.run_dir)?,
            };
            runner::run_inspect(&path, json)
        }
    }
}
