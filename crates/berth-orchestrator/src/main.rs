//! `berthd`: the berth orchestrator daemon.
//!
//! Thin entry point: parse arguments, initialize logging, wire the state,
//! and run the WebSocket server until ctrl-c.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use berth_orchestrator::{OrchestratorConfig, OrchestratorState, Server};

/// berth orchestrator: accepts agent and dashboard sessions and routes
/// signed commands.
#[derive(Parser)]
#[command(name = "berthd")]
#[command(author, version, about)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,

    /// Override the state directory (signing key).
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
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }

    let state = OrchestratorState::with_in_memory_stores(config)?;
    let server = Server::bind(state).await?;

    tokio::select! {
        () = server.run() => {},
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        },
    }
    Ok(())
}
