//! # Configuration Management
//!
//! This module handles SlyShare's configuration system, including:
//! - TOML-based configuration files
//! - Share management (owned and joined shares, per-peer access)
//! - Node settings such as the listen port and sync intervals
//!
//! The configuration is stored in a platform-appropriate directory
//! (e.g., `~/.config/slyshare/` on Linux), overridable with the
//! `SLYSHARE_CONFIG_DIR` environment variable.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::protocol::AccessLevel;
use crate::store::VacuumPolicy;

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "SLYSHARE_CONFIG_DIR";

/// Main configuration structure for a SlyShare node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    #[serde(default = "default_node_name")]
    pub node_name: String,
    pub listen_port: u16,
    /// Interval at which idle sessions re-request the peer's manifest.
    #[serde(default = "default_manifest_poll_secs")]
    pub manifest_poll_secs: u64,
    /// Interval between rescans of local share folders.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_vacuum_min_entries")]
    pub vacuum_min_entries: u64,
    #[serde(default = "default_vacuum_bloat_ratio")]
    pub vacuum_bloat_ratio: u64,
    #[serde(default)]
    pub shares: Vec<ShareConfig>,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

/// A folder shared with other peers.
///
/// The secret is held at `access`; peers are granted `peer_access[peer]` or
/// `default_peer_access`, capped at the held level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShareConfig {
    pub id: String,
    pub path: PathBuf,
    pub name: Option<String>,
    /// Hex-encoded share secret.
    pub secret: String,
    pub access: AccessLevel,
    #[serde(default = "default_peer_access")]
    pub default_peer_access: AccessLevel,
    /// Peer addresses (`host:port`) to dial for this share.
    #[serde(default)]
    pub peers: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub peer_access: HashMap<String, AccessLevel>,
}

fn default_node_name() -> String {
    "slyshare".to_string()
}

fn default_manifest_poll_secs() -> u64 {
    30
}

fn default_scan_interval_secs() -> u64 {
    10
}

fn default_vacuum_min_entries() -> u64 {
    VacuumPolicy::default().min_entries
}

fn default_vacuum_bloat_ratio() -> u64 {
    VacuumPolicy::default().bloat_ratio
}

fn default_peer_access() -> AccessLevel {
    AccessLevel::ReadWrite
}

impl ShareConfig {
    pub fn new(id: impl Into<String>, path: PathBuf, secret: [u8; 32], access: AccessLevel) -> Self {
        Self {
            id: id.into(),
            path,
            name: None,
            secret: hex::encode(secret),
            access,
            default_peer_access: default_peer_access(),
            peer_access: HashMap::new(),
            peers: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn secret_bytes(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.secret)?;
        bytes
            .try_into()
            .map_err(|_| anyhow!("Share secret for {} must be 32 bytes", self.id))
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| self.id.clone())
        })
    }
}

impl Config {
    pub async fn init() -> Result<Self> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)?;

        let config_file = config_dir.join("config.toml");

        let config = Self {
            node_id: String::new(), // Will be set by identity generation
            node_name: default_node_name(),
            listen_port: 41337,
            manifest_poll_secs: default_manifest_poll_secs(),
            scan_interval_secs: default_scan_interval_secs(),
            vacuum_min_entries: default_vacuum_min_entries(),
            vacuum_bloat_ratio: default_vacuum_bloat_ratio(),
            shares: Vec::new(),
            config_file_path: config_file,
        };

        config.save().await?;

        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        let config_file = Self::config_dir()?.join("config.toml");

        if !config_file.exists() {
            anyhow::bail!("SlyShare not initialized. Run 'slyshare init' first.");
        }

        let content = tokio::fs::read_to_string(&config_file).await?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file_path = config_file;

        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    /// Share a new folder, holding its fresh secret at `read_write`.
    pub fn add_share(&mut self, path: PathBuf, name: Option<String>, secret: [u8; 32]) -> Result<String> {
        if self.shares.iter().any(|s| s.path == path) {
            anyhow::bail!("Folder {} is already shared", path.display());
        }

        let share_id = Uuid::new_v4().to_string();
        let mut share = ShareConfig::new(share_id.clone(), path, secret, AccessLevel::ReadWrite);
        share.name = name;
        self.shares.push(share);

        Ok(share_id)
    }

    /// Join an existing share with a secret held at `access`.
    pub fn join_share(
        &mut self,
        share_id: String,
        secret: [u8; 32],
        access: AccessLevel,
        path: PathBuf,
        peers: Vec<String>,
    ) -> Result<()> {
        if access == AccessLevel::Unknown {
            anyhow::bail!("Cannot join a share with access level unknown");
        }
        if self.shares.iter().any(|s| s.id == share_id) {
            anyhow::bail!("Share {} is already configured", share_id);
        }

        let mut share = ShareConfig::new(share_id, path, secret, access);
        share.peers = peers;
        self.shares.push(share);

        Ok(())
    }

    pub fn shares(&self) -> &[ShareConfig] {
        &self.shares
    }

    pub fn share(&self, share_id: &str) -> Option<&ShareConfig> {
        self.shares.iter().find(|s| s.id == share_id)
    }

    pub fn vacuum_policy(&self) -> VacuumPolicy {
        VacuumPolicy {
            min_entries: self.vacuum_min_entries,
            bloat_ratio: self.vacuum_bloat_ratio,
            ..VacuumPolicy::default()
        }
    }

    pub fn manifest_poll(&self) -> Option<Duration> {
        (self.manifest_poll_secs > 0).then(|| Duration::from_secs(self.manifest_poll_secs))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn identity_path(&self) -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("identity.key"))
    }

    fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?
            .join("slyshare");

        Ok(config_dir)
    }
}
