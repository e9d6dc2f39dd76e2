//! # syncpair CLI Application
//!
//! Main entry point for syncpair, which mirrors one folder between two
//! paired machines.

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncpair::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncpair=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = match cli.command {
        Commands::Init => cli::init(cli.config).await,
        Commands::Run(args) => cli::run(cli.config, cli.state, args).await,
        Commands::Status => cli::show_status(cli.config, cli.state).await,
        Commands::Folder { path } => cli::set_folder(cli.config, cli.state, path).await,
        Commands::Port { port } => cli::set_port(cli.config, cli.state, port).await,
    } {
        eprintln!(
            "{} {}\n{}",
            "Error:".red().bold(),
            e.to_string().red(),
            "Tip: Run with --help for usage information.".yellow()
        );
        std::process::exit(1);
    }
    Ok(())
}
