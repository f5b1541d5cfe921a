//! # Wire Protocol
//!
//! Message types exchanged by peer sessions and the frame codec that carries them.
//!
//! Every frame is a big-endian `u32` length followed by one kind byte and the payload.
//! Kinds `0..=9` are protocol [`Message`]s (bincode payload); the remaining kinds carry
//! the binary stream attached to a `file_data` message:
//!
//! ```text
//! [len: u32][kind: u8][payload ...]
//!   kind 0x80  chunk  raw file bytes
//!   kind 0x81  end    stream finished
//!   kind 0x82  abort  stream failed, payload is a UTF-8 reason
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::manifest::Manifest;

/// Software identifier sent in greetings.
pub const SOFTWARE: &str = concat!("slyshare/", env!("CARGO_PKG_VERSION"));

/// Protocol versions this build speaks.
pub const PROTOCOL_VERSIONS: &[u32] = &[1];

/// Optional capabilities advertised during the handshake.
pub const FEATURES: &[&str] = &["byte-ranges", "manifest-current"];

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Largest chunk of a file stream.
pub const CHUNK_SIZE: usize = 256 * 1024;

const KIND_CHUNK: u8 = 0x80;
const KIND_END: u8 = 0x81;
const KIND_ABORT: u8 = 0x82;

/// Permission level of a peer on a share, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Unknown,
    Untrusted,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown access level '{0}'")]
pub struct ParseAccessError(pub String);

impl AccessLevel {
    pub const ALL: [AccessLevel; 4] = [
        AccessLevel::Unknown,
        AccessLevel::Untrusted,
        AccessLevel::ReadOnly,
        AccessLevel::ReadWrite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Unknown => "unknown",
            AccessLevel::Untrusted => "untrusted",
            AccessLevel::ReadOnly => "read_only",
            AccessLevel::ReadWrite => "read_write",
        }
    }

    /// The next weaker level, if any.
    pub fn weaker(&self) -> Option<AccessLevel> {
        match self {
            AccessLevel::Unknown => None,
            AccessLevel::Untrusted => Some(AccessLevel::Unknown),
            AccessLevel::ReadOnly => Some(AccessLevel::Untrusted),
            AccessLevel::ReadWrite => Some(AccessLevel::ReadOnly),
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = ParseAccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| ParseAccessError(s.to_string()))
    }
}

/// The weaker of the requested and the configured level.
pub fn effective_access(requested: AccessLevel, configured: AccessLevel) -> AccessLevel {
    requested.min(configured)
}

/// [`effective_access`] over level names, failing on anything outside the known set.
pub fn effective_access_str(requested: &str, configured: &str) -> Result<AccessLevel, ParseAccessError> {
    Ok(effective_access(requested.parse()?, configured.parse()?))
}

/// Highest protocol version both sides support.
pub fn negotiate_protocol(ours: &[u32], theirs: &[u32]) -> Option<u32> {
    ours.iter().filter(|v| theirs.contains(v)).max().copied()
}

/// A byte range `[offset, offset + length)` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// Protocol messages. The closed set of kinds a session understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Greeting {
        software: String,
        protocols: Vec<u32>,
        features: Vec<String>,
    },
    Start {
        software: String,
        protocol: u32,
        features: Vec<String>,
        share_id: String,
        access: AccessLevel,
        peer_id: String,
    },
    CannotStart {
        reason: String,
    },
    StartTls {
        peer_id: String,
        access: AccessLevel,
    },
    Identity {
        name: String,
        time_ms: i64,
    },
    GetManifest {
        known_version: Option<u64>,
    },
    Manifest(Manifest),
    ManifestCurrent,
    Get {
        path: String,
        range: Option<ByteRange>,
    },
    /// Header of a file stream; chunk frames and an end (or abort) frame follow.
    FileData {
        path: String,
        range: Option<ByteRange>,
        size: u64,
    },
}

/// Tag of a [`Message`], as written in the frame kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Greeting = 0,
    Start = 1,
    CannotStart = 2,
    StartTls = 3,
    Identity = 4,
    GetManifest = 5,
    Manifest = 6,
    ManifestCurrent = 7,
    Get = 8,
    FileData = 9,
}

impl MessageKind {
    pub fn from_u8(kind: u8) -> Option<Self> {
        let kind = match kind {
            0 => MessageKind::Greeting,
            1 => MessageKind::Start,
            2 => MessageKind::CannotStart,
            3 => MessageKind::StartTls,
            4 => MessageKind::Identity,
            5 => MessageKind::GetManifest,
            6 => MessageKind::Manifest,
            7 => MessageKind::ManifestCurrent,
            8 => MessageKind::Get,
            9 => MessageKind::FileData,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Greeting => "greeting",
            MessageKind::Start => "start",
            MessageKind::CannotStart => "cannot_start",
            MessageKind::StartTls => "starttls",
            MessageKind::Identity => "identity",
            MessageKind::GetManifest => "get_manifest",
            MessageKind::Manifest => "manifest",
            MessageKind::ManifestCurrent => "manifest_current",
            MessageKind::Get => "get",
            MessageKind::FileData => "file_data",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Greeting { .. } => MessageKind::Greeting,
            Message::Start { .. } => MessageKind::Start,
            Message::CannotStart { .. } => MessageKind::CannotStart,
            Message::StartTls { .. } => MessageKind::StartTls,
            Message::Identity { .. } => MessageKind::Identity,
            Message::GetManifest { .. } => MessageKind::GetManifest,
            Message::Manifest(_) => MessageKind::Manifest,
            Message::ManifestCurrent => MessageKind::ManifestCurrent,
            Message::Get { .. } => MessageKind::Get,
            Message::FileData { .. } => MessageKind::FileData,
        }
    }

    /// Our greeting.
    pub fn greeting() -> Self {
        Message::Greeting {
            software: SOFTWARE.to_string(),
            protocols: PROTOCOL_VERSIONS.to_vec(),
            features: FEATURES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    Chunk(Vec<u8>),
    End,
    Abort(String),
    /// A frame kind this build does not know.
    Unsupported(u8),
}

impl Inbound {
    pub fn describe(&self) -> String {
        match self {
            Inbound::Message(msg) => msg.kind().to_string(),
            Inbound::Chunk(data) => format!("chunk ({} bytes)", data.len()),
            Inbound::End => "end".to_string(),
            Inbound::Abort(_) => "abort".to_string(),
            Inbound::Unsupported(kind) => format!("unsupported kind {}", kind),
        }
    }
}

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(payload.len() + 5);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

/// Encode a message as a complete frame.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(message).map_err(WireError::Encode)?;
    if payload.len() + 1 > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload.len() + 1));
    }
    Ok(frame(message.kind() as u8, &payload))
}

pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    frame(KIND_CHUNK, data)
}

pub fn encode_end() -> Vec<u8> {
    frame(KIND_END, &[])
}

pub fn encode_abort(reason: &str) -> Vec<u8> {
    frame(KIND_ABORT, reason.as_bytes())
}

/// Write one encoded frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream between frames.
///
/// Reads exactly the bytes of one frame, never more, so the underlying stream can be
/// handed to a TLS upgrade right after a frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Inbound>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }

    let kind = reader.read_u8().await?;
    let mut payload = vec![0u8; len - 1];
    reader.read_exact(&mut payload).await?;

    decode_frame(kind, payload).map(Some)
}

fn decode_frame(kind: u8, payload: Vec<u8>) -> Result<Inbound, WireError> {
    match kind {
        KIND_CHUNK => Ok(Inbound::Chunk(payload)),
        KIND_END => Ok(Inbound::End),
        KIND_ABORT => Ok(Inbound::Abort(String::from_utf8_lossy(&payload).into_owned())),
        _ => {
            let Some(kind) = MessageKind::from_u8(kind) else {
                return Ok(Inbound::Unsupported(kind));
            };
            let message: Message =
                bincode::deserialize(&payload).map_err(|source| WireError::Decode { kind, source })?;
            if message.kind() != kind {
                return Err(WireError::KindMismatch {
                    kind,
                    found: message.kind(),
                });
            }
            Ok(Inbound::Message(message))
        }
    }
}

impl WireError {
    /// Whether the stream is still aligned on a frame boundary after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WireError::Decode { .. } | WireError::KindMismatch { .. } | WireError::EmptyFrame
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_access_order_and_effective_level() {
        assert!(AccessLevel::Unknown < AccessLevel::Untrusted);
        assert!(AccessLevel::Untrusted < AccessLevel::ReadOnly);
        assert!(AccessLevel::ReadOnly < AccessLevel::ReadWrite);

        for a in AccessLevel::ALL {
            for b in AccessLevel::ALL {
                let effective = effective_access(a, b);
                assert_eq!(effective, effective_access(b, a));
                assert!(effective <= a && effective <= b);
                assert!(effective == a || effective == b);
            }
        }
        assert_eq!(
            effective_access(AccessLevel::ReadWrite, AccessLevel::ReadOnly),
            AccessLevel::ReadOnly
        );
    }

    #[test]
    fn test_effective_access_rejects_unknown_names() {
        assert_eq!(
            effective_access_str("read_write", "untrusted"),
            Ok(AccessLevel::Untrusted)
        );
        assert_eq!(
            effective_access_str("admin", "read_only"),
            Err(ParseAccessError("admin".to_string()))
        );
        assert!(effective_access_str("read_only", "").is_err());
    }

    #[test]
    fn test_negotiate_protocol() {
        assert_eq!(negotiate_protocol(&[1, 2, 3], &[2, 3, 4]), Some(3));
        assert_eq!(negotiate_protocol(&[1], &[2]), None);
        assert_eq!(negotiate_protocol(&[1], &[]), None);
    }

    #[tokio::test]
    async fn test_frames_read_back_in_order() {
        let mut wire = Vec::new();
        wire.extend(encode_message(&Message::greeting()).unwrap());
        wire.extend(encode_chunk(b"abc"));
        wire.extend(encode_end());
        wire.extend(encode_abort("gone"));

        let mut reader = wire.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some(Inbound::Message(Message::greeting()))
        );
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some(Inbound::Chunk(b"abc".to_vec()))
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Inbound::End));
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some(Inbound::Abort("gone".to_string()))
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_unsupported() {
        let wire = frame(42, b"whatever");
        let mut reader = wire.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some(Inbound::Unsupported(42))
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let wire = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let mut reader = &wire[..];
        assert_matches!(read_frame(&mut reader).await, Err(WireError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_mislabelled_message_is_a_recoverable_error() {
        let payload = bincode::serialize(&Message::ManifestCurrent).unwrap();
        let mut wire = frame(MessageKind::Get as u8, &payload);
        wire.extend(encode_end());

        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_matches!(err, WireError::KindMismatch { kind: MessageKind::Get, .. });
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Inbound::End));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_io_error() {
        let wire = encode_chunk(b"abcdef");
        let mut reader = &wire[..wire.len() - 2];
        assert_matches!(read_frame(&mut reader).await, Err(WireError::Io(_)));
    }
}
