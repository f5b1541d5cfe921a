//! # SlyShare
//!
//! Peer-to-peer shared folder synchronization built in Rust.
//!
//! Peers holding a share's secret connect directly, prove possession of the share key
//! over an encrypted channel, exchange manifests and fetch the files they are missing.
//!
//! ## Core Modules
//!
//! - [`store`] - Append-only persistent key/value log with compaction
//! - [`protocol`] - Messages, access levels and the frame codec
//! - [`manifest`] - File records and manifest reconciliation
//! - [`transport`] - Framed session transport with in-place TLS upgrade
//! - [`session`] - The per-connection peer session state machine
//! - [`share`] - Shares as seen by sessions, and the folder-backed implementation
//! - [`crypto`] - Node identity, share keys and channel proofs
//! - [`p2p`] - Listener, dialers and rescans
//! - [`config`] - Configuration management and storage
//! - [`cli`] - Command-line interface
//!
//! ## Quick Start
//!
//! ```bash
//! # Initialize SlyShare
//! slyshare init
//!
//! # Share a folder
//! slyshare add /path/to/folder --name "My Documents"
//!
//! # On another node, join it
//! slyshare join <share-id> <secret> /path/to/copy --peer host:41337
//!
//! # Start daemon
//! slyshare daemon
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod manifest;
pub mod p2p;
pub mod protocol;
pub mod session;
pub mod share;
pub mod store;
pub mod transport;

pub use config::Config;
pub use crypto::Identity;
pub use error::{LogError, SessionError, WireError};
pub use session::{PeerSession, SessionEvent, SessionState};
pub use store::PersistentLog;
