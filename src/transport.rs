//! # Session Transport
//!
//! Carries frames for one peer session. A [`Link`] starts out as a plain stream on
//! which the handshake reads and writes frames directly. After `starttls` it is
//! upgraded in place to TLS, authenticated with a share key, and split into:
//!
//! - a **receive loop** task decoding frames into a bounded channel
//! - a **send loop** task, the only writer, draining one FIFO [`SendQueue`]
//!
//! File streams are queued as jobs, so the send loop reads the file and writes its
//! chunks without ever blocking the session's receive side.

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, warn};

use crate::crypto::{channel_proof, verify_channel_proof, Role, ShareKey, TlsIdentity};
use crate::error::{SessionError, WireError};
use crate::protocol::{self, Inbound, Message, CHUNK_SIZE};

/// TLS exporter label for the channel-binding proof.
const EXPORTER_LABEL: &[u8] = b"EXPORTER-slyshare-share-proof";

const ALPN: &[u8] = b"slyshare/1";

/// Frames buffered between the receive loop and the session.
const INBOUND_BUFFER: usize = 64;

/// Byte streams a session can run over.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A file (or part of one) to stream after a `file_data` header.
pub struct FileStream {
    pub header: Message,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub length: u64,
}

/// Work for the send loop.
pub enum Outbound {
    Frame(Vec<u8>),
    Stream(FileStream),
}

/// Handle to a session's outbound FIFO.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SendQueue {
    pub fn send(&self, message: &Message) -> Result<(), SessionError> {
        self.send_frame(protocol::encode_message(message)?)
    }

    /// Queue an already encoded frame.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| SessionError::Closed)
    }

    /// Terminate a stream whose header was sent but whose file cannot be read.
    pub fn abort(&self, reason: &str) -> Result<(), SessionError> {
        self.send_frame(protocol::encode_abort(reason))
    }

    pub fn stream(&self, stream: FileStream) -> Result<(), SessionError> {
        self.tx
            .send(Outbound::Stream(stream))
            .map_err(|_| SessionError::Closed)
    }
}

/// Secure half of a link: the two loops and their channels.
pub struct SecureLink {
    inbound: mpsc::Receiver<Result<Inbound, WireError>>,
    queue: SendQueue,
    receive_task: JoinHandle<()>,
    // Detached on drop; it exits once the queue is closed and drained.
    _send_task: JoinHandle<()>,
}

impl Drop for SecureLink {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

/// Transport of one session.
pub enum Link<S> {
    /// Handshake phase: synchronous frame writes on the raw stream.
    Direct(S),
    Secure(SecureLink),
    Closed,
}

impl<S: SessionStream> Link<S> {
    pub fn new(stream: S) -> Self {
        Link::Direct(stream)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Link::Secure(_))
    }

    /// Send one message: written directly before the upgrade, queued after.
    pub async fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        match self {
            Link::Direct(stream) => {
                let frame = protocol::encode_message(message)?;
                protocol::write_frame(stream, &frame).await?;
                Ok(())
            }
            Link::Secure(secure) => secure.queue.send(message),
            Link::Closed => Err(SessionError::Closed),
        }
    }

    /// Wait for the next frame.
    pub async fn receive(&mut self) -> Result<Inbound, SessionError> {
        match self {
            Link::Direct(stream) => match protocol::read_frame(stream).await? {
                Some(frame) => Ok(frame),
                None => Err(SessionError::Closed),
            },
            Link::Secure(secure) => match secure.inbound.recv().await {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(e)) => Err(e.into()),
                None => Err(SessionError::Closed),
            },
            Link::Closed => Err(SessionError::Closed),
        }
    }

    /// The outbound queue, once the link is secure.
    pub fn queue(&self) -> Option<SendQueue> {
        match self {
            Link::Secure(secure) => Some(secure.queue.clone()),
            _ => None,
        }
    }

    /// Upgrade the plain stream in place to an authenticated TLS channel.
    ///
    /// The acceptor acts as TLS server with the share certificate. Certificates are
    /// not verified; instead each side proves it holds `key` by sending a keyed hash
    /// of TLS exporter material, which also binds the proof to this TLS session.
    pub async fn upgrade(&mut self, role: Role, tls: &TlsIdentity, key: &ShareKey) -> Result<(), SessionError> {
        let stream = match std::mem::replace(self, Link::Closed) {
            Link::Direct(stream) => stream,
            other => {
                *self = other;
                return Err(SessionError::Tls(rustls::Error::General(
                    "link is not in its plain phase".to_string(),
                )));
            }
        };

        let mut exporter = [0u8; 32];
        let mut tls_stream: TlsStream<S> = match role {
            Role::Acceptor => {
                let acceptor = TlsAcceptor::from(Arc::new(server_config(tls)?));
                let stream = acceptor.accept(stream).await?;
                stream
                    .get_ref()
                    .1
                    .export_keying_material(&mut exporter[..], EXPORTER_LABEL, None)?;
                stream.into()
            }
            Role::Initiator => {
                let connector = TlsConnector::from(Arc::new(client_config()));
                let server_name = rustls::ServerName::try_from("slyshare.local")
                    .map_err(|e| SessionError::Tls(rustls::Error::General(e.to_string())))?;
                let stream = connector.connect(server_name, stream).await?;
                stream
                    .get_ref()
                    .1
                    .export_keying_material(&mut exporter[..], EXPORTER_LABEL, None)?;
                stream.into()
            }
        };
        debug!("TLS established as {:?}", role);

        let proof = channel_proof(key, &exporter, role);
        tls_stream.write_all(&proof).await?;
        tls_stream.flush().await?;

        let mut peer_proof = [0u8; 32];
        tls_stream.read_exact(&mut peer_proof).await?;
        if !verify_channel_proof(key, &exporter, role.peer(), &peer_proof) {
            warn!("Peer failed the share key proof");
            let _ = tls_stream.shutdown().await;
            return Err(SessionError::ChannelAuth);
        }

        let (reader, writer) = tokio::io::split(tls_stream);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let receive_task = tokio::spawn(receive_loop(reader, inbound_tx));
        let send_task = tokio::spawn(send_loop(writer, outbound_rx));

        *self = Link::Secure(SecureLink {
            inbound,
            queue: SendQueue { tx: outbound_tx },
            receive_task,
            _send_task: send_task,
        });
        Ok(())
    }
}

/// Decode frames and hand them to the session until the stream ends.
async fn receive_loop<R>(mut reader: R, inbound: mpsc::Sender<Result<Inbound, WireError>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match protocol::read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if inbound.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Peer closed the stream");
                break;
            }
            Err(e) if e.is_recoverable() => {
                if inbound.send(Err(e)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Receive loop stopping: {}", e);
                let _ = inbound.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Sole writer of a secure link. Runs until every queue handle is dropped.
async fn send_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let result = match item {
            Outbound::Frame(frame) => protocol::write_frame(&mut writer, &frame).await,
            Outbound::Stream(stream) => write_stream(&mut writer, stream).await,
        };
        if let Err(e) = result {
            debug!("Send loop stopping: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Write a `file_data` header, its chunks and the end marker. A read failure ends the
/// stream with an abort frame; only write failures are returned.
async fn write_stream<W>(writer: &mut W, mut stream: FileStream) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    protocol::write_frame(writer, &protocol::encode_message(&stream.header)?).await?;

    let mut remaining = stream.length;
    let mut buf = vec![0u8; CHUNK_SIZE.min(remaining as usize)];
    while remaining > 0 {
        let len = (CHUNK_SIZE as u64).min(remaining) as usize;
        if let Err(e) = stream.reader.read_exact(&mut buf[..len]).await {
            warn!("File stream failed after {} bytes: {}", stream.length - remaining, e);
            return protocol::write_frame(writer, &protocol::encode_abort(&e.to_string())).await;
        }
        protocol::write_frame(writer, &protocol::encode_chunk(&buf[..len])).await?;
        remaining -= len as u64;
    }

    protocol::write_frame(writer, &protocol::encode_end()).await
}

fn server_config(tls: &TlsIdentity) -> Result<rustls::ServerConfig, rustls::Error> {
    let mut config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(tls.cert_der.clone())],
            rustls::PrivateKey(tls.key_der.clone()),
        )?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

fn client_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];
    config
}

/// Accepts any server certificate; the share key proof authenticates the peer.
struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
