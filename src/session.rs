//! # Peer Sessions
//!
//! One [`PeerSession`] drives one connection to a peer for one share:
//!
//! 1. **Handshake**: greetings, protocol negotiation, `start` and `starttls`, which fixes
//!    the effective access level for the session.
//! 2. **Secure channel**: in-place TLS upgrade authenticated with the share key, see
//!    [`crate::transport`].
//! 3. **Identity**: names and clocks are exchanged; too much clock skew ends the session.
//! 4. **Manifest exchange and steady state**: each side may pull the other's manifest,
//!    reconcile it with local records and fetch missing files one at a time.
//!
//! The session never reaches the filesystem directly; everything goes through the
//! [`Share`] it resolved.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::Role;
use crate::error::SessionError;
use crate::manifest::{self, FileRecord, Manifest};
use crate::protocol::{
    self, AccessLevel, ByteRange, Inbound, Message, MessageKind, FEATURES, PROTOCOL_VERSIONS, SOFTWARE,
};
use crate::share::{LocalIdentity, Share, ShareResolver};
use crate::transport::{FileStream, Link, SessionStream};

/// Largest tolerated difference between the peers' clocks.
pub const MAX_CLOCK_SKEW_MS: i64 = 60_000;

/// Lifecycle of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    AccessNegotiated,
    TransportSecured,
    ManifestExchange,
    Steady,
    Closed,
}

/// Progress notifications for whoever runs the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Secured {
        share_id: String,
        peer_id: String,
        access: AccessLevel,
    },
    ManifestReceived {
        version: u64,
        fetch: usize,
        delete: usize,
    },
    Requested {
        path: String,
    },
    FileReceived {
        path: String,
        bytes: u64,
        chunks: usize,
        largest_chunk: usize,
    },
    TransferFailed {
        path: String,
        reason: String,
    },
    /// Nothing left to fetch from the peer.
    Idle,
}

/// Fails when the two clocks are more than [`MAX_CLOCK_SKEW_MS`] apart.
pub fn check_clock_skew(remote_ms: i64, local_ms: i64) -> Result<(), SessionError> {
    let skew_ms = remote_ms.saturating_sub(local_ms);
    if skew_ms.abs() > MAX_CLOCK_SKEW_MS {
        return Err(SessionError::ClockSkew { skew_ms });
    }
    Ok(())
}

/// An incoming file stream.
struct Transfer {
    path: String,
    range: Option<ByteRange>,
    /// Expected content bytes.
    length: u64,
    writer: Option<tokio::fs::File>,
    /// Whole-file transfers only.
    hasher: Option<blake3::Hasher>,
    bytes: u64,
    chunks: usize,
    largest_chunk: usize,
    /// Set once the transfer is known to be unusable; remaining chunks are drained.
    failure: Option<String>,
}

impl Transfer {
    fn discard(path: String, reason: impl Into<String>) -> Self {
        Self {
            path,
            range: None,
            length: 0,
            writer: None,
            hasher: None,
            bytes: 0,
            chunks: 0,
            largest_chunk: 0,
            failure: Some(reason.into()),
        }
    }
}

/// Session with one peer over one stream.
pub struct PeerSession<S> {
    role: Role,
    link: Link<S>,
    state: SessionState,
    identity: Arc<dyn LocalIdentity>,
    resolver: Option<Arc<dyn ShareResolver>>,
    share: Option<Arc<dyn Share>>,
    peer_id: Option<String>,
    peer_name: Option<String>,
    peer_software: Option<String>,
    access: AccessLevel,
    protocol: u32,
    /// Whether this side requests the peer's manifest.
    pulling: bool,
    remote_version: Option<u64>,
    remote_records: HashMap<String, FileRecord>,
    fetch: BTreeSet<String>,
    in_flight: Option<String>,
    transfer: Option<Transfer>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    manifest_poll: Option<Duration>,
}

impl<S: SessionStream> PeerSession<S> {
    fn new(role: Role, stream: S, identity: Arc<dyn LocalIdentity>) -> Self {
        Self {
            role,
            link: Link::new(stream),
            state: SessionState::Connecting,
            identity,
            resolver: None,
            share: None,
            peer_id: None,
            peer_name: None,
            peer_software: None,
            access: AccessLevel::Unknown,
            protocol: 0,
            pulling: false,
            remote_version: None,
            remote_records: HashMap::new(),
            fetch: BTreeSet::new(),
            in_flight: None,
            transfer: None,
            events: None,
            manifest_poll: None,
        }
    }

    /// Session that opened `stream` and asks the peer for `share`.
    pub fn initiator(stream: S, share: Arc<dyn Share>, identity: Arc<dyn LocalIdentity>) -> Self {
        let mut session = Self::new(Role::Initiator, stream, identity);
        session.share = Some(share);
        session
    }

    /// Session for an accepted `stream`; the share is looked up from the peer's `start`.
    pub fn acceptor(stream: S, resolver: Arc<dyn ShareResolver>, identity: Arc<dyn LocalIdentity>) -> Self {
        let mut session = Self::new(Role::Acceptor, stream, identity);
        session.resolver = Some(resolver);
        session
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Re-request the peer's manifest on this interval while idle.
    pub fn with_manifest_poll(mut self, interval: Option<Duration>) -> Self {
        self.manifest_poll = interval;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn peer_software(&self) -> Option<&str> {
        self.peer_software.as_deref()
    }

    /// Run the session until the peer disconnects or a fatal error occurs.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let result = self.drive().await;
        self.state = SessionState::Closed;
        if let Some(in_flight) = self.in_flight.take() {
            debug!("Session closed with {} in flight", in_flight);
        }
        self.link = Link::Closed;
        result
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let share = self.handshake().await?;
        self.secure(&share).await?;
        self.exchange_identity().await?;
        self.start_manifest_exchange(&share)?;
        self.steady(&share).await
    }

    /// Greetings and `start`/`starttls`. Returns the share the session is about.
    async fn handshake(&mut self) -> Result<Arc<dyn Share>, SessionError> {
        self.state = SessionState::Handshaking;
        self.link.send(&Message::greeting()).await?;

        let (software, theirs) = match self.expect(MessageKind::Greeting).await? {
            Message::Greeting { software, protocols, .. } => (software, protocols),
            other => return Err(SessionError::Unexpected(other.kind())),
        };
        self.protocol = protocol::negotiate_protocol(PROTOCOL_VERSIONS, &theirs).ok_or_else(|| {
            SessionError::IncompatibleProtocol {
                ours: PROTOCOL_VERSIONS.to_vec(),
                theirs: theirs.clone(),
            }
        })?;
        debug!("Peer runs {} (protocol {})", software, self.protocol);
        self.peer_software = Some(software);

        let share = match self.role {
            Role::Initiator => self.start_as_initiator().await?,
            Role::Acceptor => self.start_as_acceptor().await?,
        };
        self.state = SessionState::AccessNegotiated;
        Ok(share)
    }

    async fn start_as_initiator(&mut self) -> Result<Arc<dyn Share>, SessionError> {
        let share = self.share.clone().ok_or(SessionError::Closed)?;
        self.link
            .send(&Message::Start {
                software: SOFTWARE.to_string(),
                protocol: self.protocol,
                features: FEATURES.iter().map(|f| f.to_string()).collect(),
                share_id: share.id().to_string(),
                access: share.held_access(),
                peer_id: share.peer_id().to_string(),
            })
            .await?;

        loop {
            match self.link.receive().await {
                Ok(Inbound::Message(Message::StartTls { peer_id, access })) => {
                    if access == AccessLevel::Unknown || access > share.held_access() {
                        return Err(SessionError::AccessDenied(access));
                    }
                    self.peer_id = Some(peer_id);
                    self.access = access;
                    return Ok(share);
                }
                Ok(Inbound::Message(Message::CannotStart { reason })) => {
                    return Err(SessionError::CannotStart(reason));
                }
                Ok(other) => debug!("Discarding {} while waiting for starttls", other.describe()),
                Err(SessionError::Wire(e)) if e.is_recoverable() => {
                    warn!("Skipping bad frame while waiting for starttls: {}", e)
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn start_as_acceptor(&mut self) -> Result<Arc<dyn Share>, SessionError> {
        let (protocol, share_id, requested, peer_id) = match self.expect(MessageKind::Start).await? {
            Message::Start {
                protocol,
                share_id,
                access,
                peer_id,
                ..
            } => (protocol, share_id, access, peer_id),
            other => return Err(SessionError::Unexpected(other.kind())),
        };
        if !PROTOCOL_VERSIONS.contains(&protocol) {
            return Err(SessionError::IncompatibleProtocol {
                ours: PROTOCOL_VERSIONS.to_vec(),
                theirs: vec![protocol],
            });
        }
        self.protocol = protocol;

        let share = match self.resolver.as_ref().and_then(|r| r.lookup(&share_id)) {
            Some(share) => share,
            None => {
                info!("Peer {} asked for unknown share {}", peer_id, share_id);
                self.link
                    .send(&Message::CannotStart {
                        reason: format!("unknown share {}", share_id),
                    })
                    .await?;
                return Err(SessionError::ShareNotFound(share_id));
            }
        };

        let effective = protocol::effective_access(requested, share.access_level(&peer_id));
        if effective == AccessLevel::Unknown {
            info!("Refusing peer {} on share {}", peer_id, share_id);
            self.link
                .send(&Message::CannotStart {
                    reason: "access denied".to_string(),
                })
                .await?;
            return Err(SessionError::AccessDenied(effective));
        }

        self.link
            .send(&Message::StartTls {
                peer_id: share.peer_id().to_string(),
                access: effective,
            })
            .await?;
        self.peer_id = Some(peer_id);
        self.access = effective;
        self.share = Some(share.clone());
        Ok(share)
    }

    async fn secure(&mut self, share: &Arc<dyn Share>) -> Result<(), SessionError> {
        let key = share
            .key(self.access)
            .ok_or(SessionError::AccessDenied(self.access))?;
        self.link.upgrade(self.role, share.tls_identity(), &key).await?;
        self.state = SessionState::TransportSecured;

        let peer_id = self.peer_id.clone().unwrap_or_default();
        info!(
            "Secure session with {} on share {} ({})",
            peer_id,
            share.id(),
            self.access
        );
        self.emit(SessionEvent::Secured {
            share_id: share.id().to_string(),
            peer_id,
            access: self.access,
        });
        Ok(())
    }

    async fn exchange_identity(&mut self) -> Result<(), SessionError> {
        self.link
            .send(&Message::Identity {
                name: self.identity.display_name(),
                time_ms: self.identity.now_ms(),
            })
            .await?;

        let (name, time_ms) = match self.expect(MessageKind::Identity).await? {
            Message::Identity { name, time_ms } => (name, time_ms),
            other => return Err(SessionError::Unexpected(other.kind())),
        };
        check_clock_skew(time_ms, self.identity.now_ms())?;
        debug!("Peer identifies as {}", name);
        self.peer_name = Some(name);
        Ok(())
    }

    fn start_manifest_exchange(&mut self, share: &Arc<dyn Share>) -> Result<(), SessionError> {
        // Read-only peers may not push changes, so the acceptor only pulls from writers.
        self.pulling = match self.role {
            Role::Initiator => true,
            Role::Acceptor => self.access == AccessLevel::ReadWrite,
        };

        if self.pulling {
            self.state = SessionState::ManifestExchange;
            self.send(&Message::GetManifest { known_version: None })?;
        } else {
            self.state = SessionState::Steady;
        }
        debug!(
            "Manifest exchange on share {} (pulling: {})",
            share.id(),
            self.pulling
        );
        Ok(())
    }

    async fn steady(&mut self, share: &Arc<dyn Share>) -> Result<(), SessionError> {
        enum Next {
            Frame(Result<Inbound, SessionError>),
            Poll,
        }

        let mut poll = self.manifest_poll.filter(|_| self.pulling).map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            let next = match poll.as_mut() {
                Some(interval) => tokio::select! {
                    frame = self.link.receive() => Next::Frame(frame),
                    _ = interval.tick() => Next::Poll,
                },
                None => Next::Frame(self.link.receive().await),
            };

            match next {
                Next::Poll => {
                    if self.in_flight.is_none() && self.fetch.is_empty() {
                        self.send(&Message::GetManifest {
                            known_version: self.remote_version,
                        })?;
                    }
                }
                Next::Frame(Ok(frame)) => match self.handle(share, frame).await {
                    Ok(()) => {}
                    // The send loop is gone, so the transport is dead.
                    Err(SessionError::Closed) => return Ok(()),
                    Err(e) => warn!("Error handling message from {}: {}", self.peer_label(), e),
                },
                Next::Frame(Err(SessionError::Closed)) => {
                    info!("Peer {} disconnected", self.peer_label());
                    return Ok(());
                }
                Next::Frame(Err(SessionError::Wire(e))) if e.is_recoverable() => {
                    warn!("Skipping bad frame from {}: {}", self.peer_label(), e);
                }
                Next::Frame(Err(e)) => return Err(e),
            }
        }
    }

    async fn handle(&mut self, share: &Arc<dyn Share>, frame: Inbound) -> Result<(), SessionError> {
        match frame {
            Inbound::Message(Message::GetManifest { known_version }) => {
                self.serve_manifest(share, known_version)
            }
            Inbound::Message(Message::Manifest(manifest)) => self.on_manifest(share, manifest).await,
            Inbound::Message(Message::ManifestCurrent) => {
                if self.state == SessionState::ManifestExchange {
                    self.state = SessionState::Steady;
                }
                if self.in_flight.is_none() && self.fetch.is_empty() {
                    self.emit(SessionEvent::Idle);
                }
                Ok(())
            }
            Inbound::Message(Message::Get { path, range }) => self.serve_file(share, path, range).await,
            Inbound::Message(Message::FileData { path, range, size }) => {
                self.begin_transfer(share, path, range, size).await
            }
            Inbound::Chunk(data) => self.on_chunk(&data).await,
            Inbound::End => self.finish_transfer(share).await,
            Inbound::Abort(reason) => {
                if let Some(mut transfer) = self.transfer.take() {
                    transfer.failure = Some(format!("peer aborted: {}", reason));
                    self.settle(share, transfer).await?;
                }
                Ok(())
            }
            Inbound::Unsupported(kind) => {
                debug!("Ignoring unsupported frame kind {}", kind);
                Ok(())
            }
            Inbound::Message(other) => Err(SessionError::Unexpected(other.kind())),
        }
    }

    fn serve_manifest(&mut self, share: &Arc<dyn Share>, known_version: Option<u64>) -> Result<(), SessionError> {
        if self.access < AccessLevel::ReadOnly {
            warn!("Refusing manifest to {} at access {}", self.peer_label(), self.access);
            return Ok(());
        }
        if known_version == Some(share.version()) {
            return self.send(&Message::ManifestCurrent);
        }
        self.send(&Message::Manifest(share.manifest()))
    }

    async fn on_manifest(&mut self, share: &Arc<dyn Share>, manifest: Manifest) -> Result<(), SessionError> {
        if !self.pulling {
            warn!("Ignoring unrequested manifest from {}", self.peer_label());
            return Ok(());
        }
        if self.state == SessionState::ManifestExchange {
            self.state = SessionState::Steady;
        }

        let manifest = Manifest {
            files: manifest
                .files
                .into_iter()
                .filter(|record| {
                    let ok = record.is_well_formed();
                    if !ok {
                        warn!("Ignoring malformed record for {}", record.path);
                    }
                    ok
                })
                .collect(),
            ..manifest
        };

        let plan = manifest::reconcile(&manifest, |path| share.by_path(path));
        debug!(
            "Manifest v{} from {}: {} to fetch, {} to delete",
            manifest.version,
            self.peer_label(),
            plan.fetch.len(),
            plan.delete.len()
        );

        for record in &plan.delete {
            if let Err(e) = share.apply_deletion(record.clone()).await {
                warn!("Failed to delete {}: {}", record.path, e);
            }
        }

        self.remote_version = Some(manifest.version);
        self.emit(SessionEvent::ManifestReceived {
            version: manifest.version,
            fetch: plan.fetch.len(),
            delete: plan.delete.len(),
        });
        self.remote_records = manifest
            .files
            .into_iter()
            .map(|record| (record.path.clone(), record))
            .collect();
        self.fetch = plan.fetch;
        if let Some(in_flight) = &self.in_flight {
            self.fetch.remove(in_flight);
        }

        self.request_next()
    }

    /// Ask for one random path from the fetch set, or report idle when it is empty.
    fn request_next(&mut self) -> Result<(), SessionError> {
        if self.in_flight.is_some() {
            return Ok(());
        }

        let next = self.fetch.iter().choose(&mut rand::thread_rng()).cloned();
        match next {
            Some(path) => {
                self.fetch.remove(&path);
                self.send(&Message::Get {
                    path: path.clone(),
                    range: None,
                })?;
                debug!("Requested {} from {}", path, self.peer_label());
                self.in_flight = Some(path.clone());
                self.emit(SessionEvent::Requested { path });
            }
            None => self.emit(SessionEvent::Idle),
        }
        Ok(())
    }

    async fn serve_file(
        &mut self,
        share: &Arc<dyn Share>,
        path: String,
        range: Option<ByteRange>,
    ) -> Result<(), SessionError> {
        if self.access < AccessLevel::ReadOnly {
            warn!("Refusing {} to {} at access {}", path, self.peer_label(), self.access);
            return Ok(());
        }
        if !share.by_path(&path).map_or(false, |record| !record.deleted) {
            warn!("Refusing {} to {}: not in the manifest", path, self.peer_label());
            self.send(&Message::FileData { path, range, size: 0 })?;
            return self.queue()?.abort("not in the manifest");
        }

        let mut reader = match share.read_file(&path).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Cannot serve {}: {}", path, e);
                self.send(&Message::FileData { path, range, size: 0 })?;
                return self.queue()?.abort(&e.to_string());
            }
        };

        let (offset, length) = match range {
            Some(range) => {
                let offset = range.offset.min(reader.size);
                (offset, range.length.min(reader.size - offset))
            }
            None => (0, reader.size),
        };
        if offset > 0 {
            reader
                .file
                .seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| SessionError::Share(e.into()))?;
        }

        debug!("Serving {} ({} bytes at {}) to {}", path, length, offset, self.peer_label());
        self.queue()?.stream(FileStream {
            header: Message::FileData {
                path,
                range,
                size: reader.size,
            },
            reader: Box::new(reader.file),
            length,
        })
    }

    async fn begin_transfer(
        &mut self,
        share: &Arc<dyn Share>,
        path: String,
        range: Option<ByteRange>,
        size: u64,
    ) -> Result<(), SessionError> {
        if let Some(mut previous) = self.transfer.take() {
            previous.failure = Some("superseded by another stream".to_string());
            self.settle(share, previous).await?;
        }

        if self.in_flight.as_deref() != Some(path.as_str()) {
            warn!("Discarding unsolicited stream of {} from {}", path, self.peer_label());
            self.transfer = Some(Transfer::discard(path, "unsolicited"));
            return Ok(());
        }

        let (offset, length) = match range {
            Some(range) => (range.offset, range.length.min(size.saturating_sub(range.offset))),
            None => (0, size),
        };

        let writer = match range {
            Some(_) => share.write_file(&path, offset).await,
            None => share.stage_file(&path).await,
        };
        let transfer = match writer {
            Ok(writer) => Transfer {
                path,
                range,
                length,
                writer: Some(writer),
                hasher: range.is_none().then(blake3::Hasher::new),
                bytes: 0,
                chunks: 0,
                largest_chunk: 0,
                failure: None,
            },
            Err(e) => {
                warn!("Cannot write {}: {}", path, e);
                Transfer::discard(path, e.to_string())
            }
        };
        self.transfer = Some(transfer);
        Ok(())
    }

    async fn on_chunk(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let transfer = match self.transfer.as_mut() {
            Some(transfer) => transfer,
            None => {
                debug!("Dropping chunk outside of a stream");
                return Ok(());
            }
        };

        transfer.chunks += 1;
        transfer.largest_chunk = transfer.largest_chunk.max(data.len());
        transfer.bytes += data.len() as u64;
        if transfer.failure.is_some() {
            return Ok(());
        }

        if let Some(hasher) = transfer.hasher.as_mut() {
            hasher.update(data);
        }
        if let Some(writer) = transfer.writer.as_mut() {
            if let Err(e) = writer.write_all(data).await {
                transfer.failure = Some(format!("write failed: {}", e));
                transfer.writer = None;
            }
        }
        Ok(())
    }

    async fn finish_transfer(&mut self, share: &Arc<dyn Share>) -> Result<(), SessionError> {
        match self.transfer.take() {
            Some(transfer) => self.settle(share, transfer).await,
            None => {
                debug!("Dropping end marker outside of a stream");
                Ok(())
            }
        }
    }

    /// Close out a transfer, commit it when verified, and move on to the next path.
    async fn settle(&mut self, share: &Arc<dyn Share>, mut transfer: Transfer) -> Result<(), SessionError> {
        if let Some(mut writer) = transfer.writer.take() {
            if let Err(e) = writer.flush().await {
                transfer.failure.get_or_insert(format!("flush failed: {}", e));
            }
        }

        // Unsolicited streams never touched the fetch state.
        if self.in_flight.as_deref() != Some(transfer.path.as_str()) {
            return Ok(());
        }
        self.in_flight = None;

        if transfer.failure.is_none() && transfer.bytes != transfer.length {
            transfer.failure = Some(format!(
                "received {} of {} bytes",
                transfer.bytes, transfer.length
            ));
        }

        if transfer.failure.is_none() && transfer.range.is_none() {
            let remote = self.remote_records.get(&transfer.path).cloned();
            let hash: Option<[u8; 32]> = transfer.hasher.take().map(|h| h.finalize().into());
            match remote {
                Some(record) if record.hash.is_some() && record.hash == hash => {
                    if let Err(e) = share.commit_record(record).await {
                        transfer.failure = Some(format!("commit failed: {}", e));
                    }
                }
                Some(_) => transfer.failure = Some("content hash mismatch".to_string()),
                None => transfer.failure = Some("no record for path".to_string()),
            }
        }

        match transfer.failure {
            None => {
                info!(
                    "Received {} ({} bytes) from {}",
                    transfer.path,
                    transfer.bytes,
                    self.peer_label()
                );
                self.emit(SessionEvent::FileReceived {
                    path: transfer.path,
                    bytes: transfer.bytes,
                    chunks: transfer.chunks,
                    largest_chunk: transfer.largest_chunk,
                });
            }
            Some(reason) => {
                warn!("Transfer of {} failed: {}", transfer.path, reason);
                if transfer.range.is_none() {
                    if let Err(e) = share.discard_staged(&transfer.path).await {
                        warn!("Failed to discard staged {}: {}", transfer.path, e);
                    }
                }
                self.emit(SessionEvent::TransferFailed {
                    path: transfer.path,
                    reason,
                });
            }
        }

        self.request_next()
    }

    /// Block until a message of `kind` arrives, discarding anything else.
    async fn expect(&mut self, kind: MessageKind) -> Result<Message, SessionError> {
        loop {
            match self.link.receive().await {
                Ok(Inbound::Message(message)) if message.kind() == kind => return Ok(message),
                Ok(other) => debug!("Discarding {} while waiting for {}", other.describe(), kind),
                Err(SessionError::Wire(e)) if e.is_recoverable() => {
                    warn!("Skipping bad frame while waiting for {}: {}", kind, e)
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn queue(&self) -> Result<crate::transport::SendQueue, SessionError> {
        self.link.queue().ok_or(SessionError::Closed)
    }

    fn send(&self, message: &Message) -> Result<(), SessionError> {
        self.queue()?.send(message)
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn peer_label(&self) -> String {
        match (&self.peer_name, &self.peer_id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => id.chars().take(8).collect(),
            (None, None) => "peer".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_clock_skew_boundary() {
        let now = 1_700_000_000_000;
        assert!(check_clock_skew(now + 59_000, now).is_ok());
        assert!(check_clock_skew(now - 60_000, now).is_ok());
        assert!(check_clock_skew(now + 60_000, now).is_ok());
        assert_matches!(
            check_clock_skew(now + 61_000, now),
            Err(SessionError::ClockSkew { skew_ms: 61_000 })
        );
        assert_matches!(
            check_clock_skew(now - 61_000, now),
            Err(SessionError::ClockSkew { skew_ms: -61_000 })
        );
    }

    #[test]
    fn test_transfer_discard_is_failed() {
        let transfer = Transfer::discard("a".to_string(), "unsolicited");
        assert!(transfer.writer.is_none());
        assert_eq!(transfer.failure.as_deref(), Some("unsolicited"));
    }
}
