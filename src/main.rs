//! pactown — orchestrates a Markdown-declared service ecosystem: brings
//! services up in dependency order, supervises them, and tears them
//! down cleanly.

use anyhow::Result;
use clap::Parser;

mod cmd;

#[derive(Parser)]
#[command(name = "pactown")]
#[command(about = "Markdown-declared service ecosystem orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: cmd::Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PACTOWN_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| "pactown=info".into()),
        )
        .init();

    let exit_code = match cli.command {
        cmd::Commands::Up { config, user } => cmd::up::run(&config, user.as_deref()).await?,
        cmd::Commands::Down { config } => cmd::down::run(&config).await?,
        cmd::Commands::Status { config } => cmd::status::run(&config).await?,
        cmd::Commands::Validate { config } => cmd::validate::run(&config),
        cmd::Commands::Graph { config } => cmd::graph::run(&config),
    };

    std::process::exit(exit_code as i32);
}
