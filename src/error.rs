//! # Error Types
//!
//! Library-level errors for the storage log, the wire codec and peer sessions.
//! Application code (CLI, configuration, daemon wiring) uses `anyhow` on top of these.

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::{AccessLevel, MessageKind};
use crate::store::VacuumStep;

/// Errors raised by [`crate::store::PersistentLog`].
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{} is not a slyshare log (bad header)", .path.display())]
    BadHeader { path: PathBuf },

    #[error("failed to encode log entry: {0}")]
    Encode(#[from] bincode::Error),

    #[error("log is closed")]
    Closed,

    #[error("vacuum failed while {step}: {source}")]
    Vacuum {
        step: VacuumStep,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while reading or writing protocol frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("empty frame")]
    EmptyFrame,

    #[error("malformed {kind} payload: {source}")]
    Decode {
        kind: MessageKind,
        #[source]
        source: bincode::Error,
    },

    #[error("frame kind {kind} carries a {found} message")]
    KindMismatch { kind: MessageKind, found: MessageKind },

    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
}

/// Errors that end (or abort a step of) a [`crate::session::PeerSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no common protocol version (ours {ours:?}, theirs {theirs:?})")]
    IncompatibleProtocol { ours: Vec<u32>, theirs: Vec<u32> },

    #[error("share {0} is not known here")]
    ShareNotFound(String),

    #[error("peer refused to start: {0}")]
    CannotStart(String),

    #[error("access denied at level {0}")]
    AccessDenied(AccessLevel),

    #[error("secure channel authentication failed")]
    ChannelAuth,

    #[error("clock skew of {skew_ms} ms exceeds the allowed maximum")]
    ClockSkew { skew_ms: i64 },

    #[error("unexpected {0} message")]
    Unexpected(MessageKind),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Share(#[from] anyhow::Error),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Wire(WireError::Io(e))
    }
}
