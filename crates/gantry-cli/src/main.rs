//! Gantry CLI entrypoint.

use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Container pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    commands::run(cli.command).await
}
