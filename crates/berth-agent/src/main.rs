//! `berth-agent`: the on-server agent for the berth control plane.
//!
//! First run: `berth-agent --token <REGISTRATION_TOKEN> --url <URL>`
//! generates the identity keypair under the state directory and registers
//! with the orchestrator. Later runs reconnect with the persisted
//! identity; the token is no longer needed.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use berth_agent::{AgentConfig, supervisor};

/// berth agent: executes signed deployment commands on this server.
#[derive(Parser)]
#[command(name = "berth-agent")]
#[command(author, version, about)]
struct Args {
    /// Orchestrator URL (e.g. wss://cp.example.com).
    #[arg(short, long, env = "BERTH_ORCHESTRATOR_URL")]
    url: Option<String>,

    /// Registration token (first run only).
    #[arg(short, long, env = "BERTH_REGISTRATION_TOKEN")]
    token: Option<String>,

    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the state directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(url) = args.url {
        config.orchestrator_url = url;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }

    tokio::select! {
        result = supervisor::run(config, args.token) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        },
    }
    Ok(())
}
