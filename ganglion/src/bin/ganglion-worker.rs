//! ganglion-worker - reference agent worker speaking the fleet RPC protocol.
//!
//! # Usage
//!
//! ```bash
//! # Serve on a fixed port
//! ganglion-worker --mode rpc --port 9100 --model claude-sonnet-4 --provider anthropic
//!
//! # Ephemeral port, debug logging
//! ganglion-worker --port 0 -v
//! ```
//!
//! The worker exits cleanly on SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use ganglion::process::wait_for_termination;
use ganglion::telemetry::init_tracing;
use ganglion::worker::{WorkerConfig, WorkerServer};

#[derive(Parser)]
#[command(name = "ganglion-worker")]
#[command(about = "Reference agent worker for ganglion fleets", long_about = None)]
#[command(version)]
struct Cli {
    /// Protocol mode
    #[arg(long, value_enum, default_value = "rpc")]
    mode: Mode,

    /// Port to listen on (0 picks a free one)
    #[arg(short, long, env = "GANGLION_WORKER_PORT", default_value_t = 0)]
    port: u16,

    /// Interface to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Model reported by new sessions
    #[arg(long, default_value = "echo")]
    model: String,

    /// Provider reported by new sessions
    #[arg(long, default_value = "local")]
    provider: String,

    /// Default working directory of sessions
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Rpc,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Mode::Rpc = cli.mode;
    let defaults = WorkerConfig::default();
    let config = WorkerConfig {
        host: cli.host,
        port: cli.port,
        model: cli.model,
        provider: cli.provider,
        working_directory: cli.cwd.unwrap_or(defaults.working_directory.clone()),
        ..defaults
    };

    let server = WorkerServer::bind(config.clone())
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!(
        "ganglion-worker {} serving {} ({} / {})",
        ganglion::VERSION,
        server.endpoint(),
        config.model,
        config.provider
    );

    let shutdown = server.shutdown_token();
    let serve = tokio::spawn(server.serve());

    tokio::select! {
        result = serve => {
            result.context("Worker task panicked")?.context("Worker failed")?;
        }
        _ = wait_for_termination() => {
            info!("Termination signal received, shutting down");
            shutdown.cancel();
        }
    }

    Ok(())
}
