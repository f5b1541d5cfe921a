//! # SlyShare CLI Application
//!
//! Main entry point for the SlyShare shared-folder synchronization utility.

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slyshare::cli::{self, Cli, Commands};

/// Sets up logging, parses command line arguments and dispatches to the command handler.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slyshare=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = match cli.command {
        Commands::Init => cli::init().await,
        Commands::Id => cli::show_id().await,
        Commands::Add { path, name } => cli::add_share(path, name).await,
        Commands::Join {
            share_id,
            secret,
            path,
            access,
            peers,
        } => cli::join_share(share_id, secret, path, access, peers).await,
        Commands::Status { verbose } => cli::show_status(verbose).await,
        Commands::Daemon => cli::run_daemon().await,
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
