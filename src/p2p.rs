//! # Peer-to-Peer Networking
//!
//! This module runs SlyShare's network side:
//! - a TCP listener accepting sessions for any share this node serves
//! - one dialer per configured peer address of each share, reconnecting with
//!   exponential backoff
//! - periodic rescans of local share folders
//!
//! Every connection is driven by its own [`PeerSession`]; a failing session is logged
//! and never stops the service.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use slyshare::{config::Config, crypto::Identity, p2p::P2PService};
//!
//! async fn start_p2p_service() -> anyhow::Result<()> {
//!     let config = Config::load().await?;
//!     let identity = Identity::load_or_generate(&config.identity_path()?)?;
//!     let service = P2PService::new(&identity, config).await?;
//!     service.run().await
//! }
//! ```

use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crypto::Identity;
use crate::session::PeerSession;
use crate::share::{FolderShare, LocalIdentity, LocalNode, Share, ShareRegistry, ShareResolver};

/// Reconnection behaviour for dialled peers.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

/// Delay before reconnection attempt `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Network service of a SlyShare node.
pub struct P2PService {
    config: Config,
    node: Arc<LocalNode>,
    registry: Arc<ShareRegistry>,
    listener: TcpListener,
    reconnect: ReconnectConfig,
}

impl P2PService {
    /// Open every configured share and bind the listener.
    pub async fn new(identity: &Identity, config: Config) -> Result<Self> {
        info!("Starting P2P service on port {}", config.listen_port);

        let registry = Arc::new(ShareRegistry::new());
        for share_config in config.shares() {
            match FolderShare::open(share_config, &identity.peer_id(), config.vacuum_policy()) {
                Ok(share) => {
                    info!("Serving share {} ({})", share.name(), share.id());
                    registry.insert(Arc::new(share));
                }
                Err(e) => error!("Failed to open share {}: {}", share_config.id, e),
            }
        }

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.listen_port);
        let listener = TcpListener::bind(bind_addr).await?;
        info!("P2P service listening on {}", listener.local_addr()?);

        Ok(Self {
            node: Arc::new(LocalNode {
                name: config.node_name.clone(),
            }),
            config,
            registry,
            listener,
            reconnect: ReconnectConfig::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Scan shares once, start dialers and the scanner, then accept connections forever.
    pub async fn run(self) -> Result<()> {
        for share in self.registry.all() {
            if let Err(e) = share.scan().await {
                warn!("Initial scan of share {} failed: {}", share.id(), e);
            }
        }

        self.start_scanner();
        self.start_dialers();
        self.accept_loop().await
    }

    fn start_scanner(&self) {
        if self.config.scan_interval_secs == 0 {
            return;
        }
        let registry = self.registry.clone();
        let period = Duration::from_secs(self.config.scan_interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                for share in registry.all() {
                    if let Err(e) = share.scan().await {
                        warn!("Scan of share {} failed: {}", share.id(), e);
                    }
                }
            }
        });
    }

    fn start_dialers(&self) {
        for share_config in self.config.shares() {
            let share = match self.registry.get(&share_config.id) {
                Some(share) => share,
                None => continue,
            };
            for address in &share_config.peers {
                let dialer = Dialer {
                    address: address.clone(),
                    share: share.clone(),
                    node: self.node.clone(),
                    reconnect: self.reconnect.clone(),
                    manifest_poll: self.config.manifest_poll(),
                };
                tokio::spawn(dialer.run());
            }
        }
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            let (stream, address) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            info!("Accepted connection from {}", address);

            let resolver: Arc<dyn ShareResolver> = self.registry.clone();
            let node: Arc<dyn LocalIdentity> = self.node.clone();
            let manifest_poll = self.config.manifest_poll();

            tokio::spawn(async move {
                let mut session =
                    PeerSession::acceptor(stream, resolver, node).with_manifest_poll(manifest_poll);
                match session.run().await {
                    Ok(()) => info!("Session with {} ended", address),
                    Err(e) => warn!("Session with {} failed: {}", address, e),
                }
            });
        }
    }
}

/// Keeps one outbound session to `address` alive.
struct Dialer {
    address: String,
    share: Arc<FolderShare>,
    node: Arc<LocalNode>,
    reconnect: ReconnectConfig,
    manifest_poll: Option<Duration>,
}

impl Dialer {
    async fn run(self) {
        let mut attempt: u32 = 0;

        loop {
            match self.connect_once().await {
                Ok(true) => attempt = 0,
                Ok(false) => {}
                Err(e) => warn!("Connection to {} failed: {}", self.address, e),
            }

            attempt = attempt.saturating_add(1);
            let delay = calculate_backoff(attempt, &self.reconnect);
            debug!("Reconnecting to {} in {:?}", self.address, delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection attempt. `Ok(true)` when a session got past the handshake.
    async fn connect_once(&self) -> Result<bool> {
        info!("Connecting to peer at {}", self.address);
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;

        let share: Arc<dyn Share> = self.share.clone();
        let node: Arc<dyn LocalIdentity> = self.node.clone();
        let mut session = PeerSession::initiator(stream, share, node).with_manifest_poll(self.manifest_poll);
        match session.run().await {
            Ok(()) => info!("Session with {} ended", self.address),
            Err(e) => warn!("Session with {} failed: {}", self.address, e),
        }
        Ok(session.peer_name().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ReconnectConfig::default();
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(5));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(10));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(20));
        assert_eq!(calculate_backoff(10, &config), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_first_attempt_uses_initial_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 3.0,
        };
        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(300));
    }
}
