//! # Command Line Interface
//!
//! This module provides the command-line interface for SlyShare, including
//! argument parsing, command definitions, and command implementations.
//!
//! ## Commands
//!
//! - `init` - Initialize SlyShare configuration and generate node identity
//! - `id` - Display the current node's peer id
//! - `add` - Share a local folder and print its secret
//! - `join` - Join a share using its id and a secret
//! - `status` - Display the state of every share
//! - `daemon` - Run the SlyShare engine

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::info;

use crate::config::Config;
use crate::crypto::{derive_share_key, generate_share_secret, Identity};
use crate::protocol::AccessLevel;
use crate::share::ShareSnapshot;

/// Command-line interface structure for SlyShare.
#[derive(Parser)]
#[command(name = "slyshare")]
#[command(about = "Peer-to-peer shared folder synchronization")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands for SlyShare.
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize SlyShare configuration and generate node identity
    Init,

    /// Display the current node's peer id
    Id,

    /// Share a local folder
    Add {
        /// Path to the folder to share
        path: PathBuf,
        /// Optional human-readable alias for the share
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Join an existing share
    Join {
        /// Id of the share to join
        share_id: String,
        /// Hex-encoded share secret received from a member
        secret: String,
        /// Local path where the shared folder will be kept
        path: PathBuf,
        /// Level of the secret: read_write, read_only or untrusted
        #[arg(short, long, default_value = "read_write")]
        access: AccessLevel,
        /// Address (host:port) of a peer serving the share; may be repeated
        #[arg(short, long = "peer")]
        peers: Vec<String>,
    },

    /// Display the state of every share
    Status {
        /// List every file record
        #[arg(short, long)]
        verbose: bool,
    },

    /// Run the SlyShare engine
    Daemon,
}

/// Initialize SlyShare configuration and generate node identity.
pub async fn init() -> Result<()> {
    info!("Initializing SlyShare...");

    let mut config = Config::init().await?;
    info!("Configuration initialized at: {}", config.config_path().display());

    let identity = Identity::generate()?;
    identity.save(&config.identity_path()?)?;
    info!("Node identity saved to: {}", config.identity_path()?.display());

    config.node_id = identity.peer_id();
    config.save().await?;

    println!("✅ SlyShare initialized successfully!");
    println!("Node ID: {}", identity.peer_id());

    Ok(())
}

/// Display the current node's peer id.
pub async fn show_id() -> Result<()> {
    let config = Config::load().await?;
    let identity = Identity::load_or_generate(&config.identity_path()?)?;

    println!("{}", identity.peer_id());
    Ok(())
}

/// Share a folder. Prints the share id together with the read-write and read-only
/// secrets; whoever receives one of them can join at that level.
pub async fn add_share(path: PathBuf, name: Option<String>) -> Result<()> {
    info!("Adding share: {}", path.display());

    if !path.exists() {
        anyhow::bail!("Path does not exist: {}", path.display());
    }

    if !path.is_dir() {
        anyhow::bail!("Path is not a directory: {}", path.display());
    }

    let path = path.canonicalize()?;
    let secret = generate_share_secret();
    let mut config = Config::load().await?;
    let share_id = config.add_share(path.clone(), name.clone(), secret)?;
    config.save().await?;

    let read_only = derive_share_key(&secret, AccessLevel::ReadWrite, AccessLevel::ReadOnly)
        .ok_or_else(|| anyhow!("Cannot derive read-only secret"))?;

    println!("✅ Shared folder: {}", path.display());
    if let Some(name) = name {
        println!("   Alias: {}", name);
    }
    println!("   Share ID: {}", share_id);
    println!("   Read-write secret: {}", hex::encode(secret));
    println!("   Read-only secret:  {}", hex::encode(read_only.as_bytes()));
    println!(
        "\n💡 Peers join with: slyshare join {} <secret> <path> --access <level> --peer <host:{}>",
        share_id, config.listen_port
    );

    Ok(())
}

fn parse_secret(secret: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(secret.trim()).map_err(|e| anyhow!("Secret is not valid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("Secret must be 32 bytes (64 hex characters)"))
}

/// Join a share someone else created.
pub async fn join_share(
    share_id: String,
    secret: String,
    path: PathBuf,
    access: AccessLevel,
    peers: Vec<String>,
) -> Result<()> {
    info!("Joining share {} at path: {}", share_id, path.display());

    let secret = parse_secret(&secret)?;
    if access == AccessLevel::Unknown {
        anyhow::bail!("Access level must be read_write, read_only or untrusted");
    }

    if !path.exists() {
        std::fs::create_dir_all(&path)?;
    }
    let path = path.canonicalize()?;

    let mut config = Config::load().await?;
    config.join_share(share_id.clone(), secret, access, path.clone(), peers.clone())?;
    config.save().await?;

    println!("✅ Joined share {} at: {}", share_id, path.display());
    println!("   Access: {}", access);
    if peers.is_empty() {
        println!("   No peers given; the share syncs once a member connects to this node.");
    } else {
        println!("   Peers: {}", peers.join(", "));
    }

    Ok(())
}

pub async fn show_status(verbose: bool) -> Result<()> {
    let config = Config::load().await?;

    if config.shares().is_empty() {
        println!("No folders shared.");
        println!("Share a folder with: slyshare add <path>");
        return Ok(());
    }

    println!("📂 Share Status\n");

    for share_config in config.shares() {
        println!(
            "  {} ({})",
            share_config.display_name().bold(),
            share_config.path.display()
        );
        println!("    ID: {}", share_config.id);
        println!("    Access: {}", share_config.access);
        println!("    Peers: {}", share_config.peers.len());

        // The daemon may be writing these logs; only read them.
        let snapshot = match ShareSnapshot::load(&share_config.path) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                println!("    {}", "Not scanned yet".yellow());
                println!();
                continue;
            }
            Err(e) => {
                println!("    {} {}", "Unavailable:".red(), e);
                println!();
                continue;
            }
        };

        let live: Vec<_> = snapshot.records.iter().filter(|r| !r.deleted).collect();
        let total: u64 = live.iter().filter_map(|r| r.size).sum();
        println!("    Version: {}", snapshot.version);
        println!("    Files: {} ({} bytes)", live.len(), total);

        if verbose {
            for record in &snapshot.records {
                let marker = if record.deleted { "deleted".red() } else { "ok".green() };
                println!(
                    "      [{}] {} {} bytes {}",
                    marker,
                    record.path,
                    record.size.unwrap_or(0),
                    record.hash_hex()
                );
            }
        }

        println!();
    }

    Ok(())
}

pub async fn run_daemon() -> Result<()> {
    info!("Starting SlyShare daemon...");

    let config = Config::load().await?;
    let identity = Identity::load_or_generate(&config.identity_path()?)?;

    println!("🚀 SlyShare daemon starting...");
    println!("Node ID: {}", identity.peer_id());
    println!("Listening on port: {}", config.listen_port);

    let share_count = config.shares().len();
    let service = crate::p2p::P2PService::new(&identity, config).await?;

    println!("Bound to: {}", service.local_addr()?);
    println!("💚 SlyShare daemon is running. Press Ctrl+C to stop.");
    println!("📂 Serving {} share(s)", share_count);

    tokio::select! {
        result = service.run() => result?,
        signal = tokio::signal::ctrl_c() => signal?,
    }

    println!("\n🛑 SlyShare daemon stopping...");
    Ok(())
}
