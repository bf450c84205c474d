// ABOUTME: CLI entry point for ct-replicator
// ABOUTME: Parses commands, initialises logging, and drives the controller

use anyhow::Result;
use clap::{Parser, Subcommand};
use ct_replicator::daemon::Controller;
use ct_replicator::orchestrator::SyncedEvent;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ct-replicator")]
#[command(about = "Change-tracking based SQL Server replication", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every replication set once and exit
    Run {
        /// Path to the configuration file
        #[arg(long, default_value = "ct-replicator.toml")]
        config: PathBuf,
    },
    /// Replicate continuously at the configured interval until interrupted
    Loop {
        /// Path to the configuration file
        #[arg(long, default_value = "ct-replicator.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over the --log flag.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received; finishing the current batch");
                cancel.cancel();
            }
        });
    }

    let (synced_tx, mut synced_rx) = tokio::sync::mpsc::unbounded_channel::<SyncedEvent>();
    tokio::spawn(async move {
        while let Some(event) = synced_rx.recv().await {
            tracing::info!(
                "Synced replication set '{}' at version {}",
                event.replication_set,
                event.version
            );
        }
    });

    match cli.command {
        Commands::Run { config } => {
            let config = ct_replicator::config::load(&config)?;
            let mut controller =
                Controller::new(config, cancel).with_synced_events(synced_tx);
            let clean = controller.run_once().await?;
            if !clean {
                anyhow::bail!("One or more replication sets completed with errors");
            }
            Ok(())
        }
        Commands::Loop { config } => {
            let config = ct_replicator::config::load(&config)?;
            let mut controller =
                Controller::new(config, cancel).with_synced_events(synced_tx);
            controller.run_loop().await
        }
    }
}
