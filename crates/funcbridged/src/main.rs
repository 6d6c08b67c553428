//! funcbridged — the function-execution supervisor daemon.
//!
//! Single binary that assembles the host side of the bridge: load the
//! configuration, bind the control socket, spawn the worker process,
//! wait for readiness, then supervise until the worker reaches a
//! terminal state. Any fatal worker failure makes the daemon itself
//! exit non-zero.
//!
//! # Usage
//!
//! ```text
//! FUNCBRIDGE_SCRIPT=/srv/fn/index.ts funcbridged run
//! ```

use clap::{Parser, Subcommand};
use tracing::{error, info};

use funcbridge_host::{Config, Supervisor, WorkerState};

#[derive(Parser)]
#[command(name = "funcbridged", about = "Function-execution supervisor daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn and supervise one worker for the configured script.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    config.init_tracing();

    match cli.command {
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(script = %config.script.display(), "funcbridged starting");

    let supervisor = Supervisor::start(&config).await?;

    let port = supervisor.await_ready(config.ready_timeout()).await?;
    match port {
        Some(port) => info!(port, "worker ready, serving"),
        None => info!("worker ready (one-shot)"),
    }

    match supervisor.wait_terminal().await {
        WorkerState::Exited(0) => {
            info!("worker exited cleanly");
            Ok(())
        }
        WorkerState::Exited(code) => {
            error!(code, "worker exited with failure");
            anyhow::bail!("worker exited with code {code}")
        }
        WorkerState::Faulted(reason) => {
            error!(reason = %reason, "worker faulted");
            anyhow::bail!("worker faulted: {reason}")
        }
        other => anyhow::bail!("supervisor stopped in non-terminal state {other}"),
    }
}
