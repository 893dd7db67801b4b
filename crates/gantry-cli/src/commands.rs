//! Command dispatch for the `gantry` binary.

use anyhow::Context;
use clap::Subcommand;
use console::style;
use gantry_api::daemon::{DaemonConfig, run_daemon};
use gantry_core::config::parse_pipeline;
use gantry_events::EventBroadcaster;
use gantry_runner::{run_pipeline, shutdown_channel, shutdown_on_signal};
use std::path::PathBuf;
use tracing::info;

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a pipeline file, or run as a daemon
    Apply {
        /// Pipeline configuration file path
        #[arg(short = 'f', long)]
        filepath: Option<PathBuf>,

        /// Pipeline name
        #[arg(short = 'n', long)]
        name: Option<String>,

        /// Run as daemon with an SSE server for real-time event streaming
        #[arg(long)]
        daemon: bool,
    },
}

pub async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Apply {
            filepath,
            name,
            daemon,
        } => apply(filepath, name, daemon).await,
    }
}

async fn apply(
    filepath: Option<PathBuf>,
    name: Option<String>,
    daemon: bool,
) -> anyhow::Result<()> {
    if daemon {
        // In daemon mode the file is optional; pipelines can arrive
        // over the trigger endpoint.
        run_daemon(DaemonConfig::default(), filepath).await?;
        return Ok(());
    }

    let Some(path) = filepath else {
        anyhow::bail!("required flag \"filepath\" not set");
    };

    let yaml = std::fs::read(&path)
        .with_context(|| format!("failed to read pipeline file: {}", path.display()))?;
    let pipeline = parse_pipeline(&yaml)?;

    println!(
        "{} Pipeline validation successful",
        style("✓").green().bold()
    );
    if let Some(name) = name {
        info!(pipeline = %name, "Applying pipeline");
    }

    let broadcaster = EventBroadcaster::new();
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(shutdown_on_signal(shutdown_tx));

    match run_pipeline(pipeline, broadcaster, shutdown_rx).await {
        Ok(()) => {
            println!(
                "{} Pipeline completed successfully",
                style("✓").green().bold()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{} Pipeline failed: {}", style("✗").red().bold(), e);
            Err(e.into())
        }
    }
}
