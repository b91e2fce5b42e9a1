//! TCP transport: one connection per stream, protocol negotiation, peer hello.
//!
//! Opening a stream, each item being a frame:
//! dialer sends `protocol id`, then `hello`; the listener answers with its own
//! `hello` if it has a handler for that protocol and closes otherwise.
//! `hello` = version (1) + peer id (16) + public key (32).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sluice_core::{Keypair, PeerId, PublicKey, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::framing::{write_frame, FrameReader};

const HELLO_SIZE: usize = 1 + 16 + 32; // version + peer_id + public_key

/// Upper bound for frames read during negotiation.
const NEGOTIATION_MAX_FRAME_LEN: u32 = 1024;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Ordered, reliable, bidirectional frame channel to one remote peer.
pub struct Stream {
    remote: PeerId,
    reader: FrameReader<BoxedRead>,
    writer: BoxedWrite,
}

impl Stream {
    pub fn new(
        remote: PeerId,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::from_parts(remote, FrameReader::new(Box::new(reader)), Box::new(writer))
    }

    /// Keep a reader that may already hold buffered bytes.
    pub fn from_parts(remote: PeerId, reader: FrameReader<BoxedRead>, writer: BoxedWrite) -> Self {
        Self {
            remote,
            reader,
            writer,
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.reader.read_frame().await
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        write_frame(&mut self.writer, payload).await
    }

    /// End our sending side; the remote reads end-of-stream after pending frames.
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    /// Close both directions. Errors are ignored: the peer may already be gone.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("remote", &self.remote).finish()
    }
}

/// Opens outbound streams for a protocol.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn open_stream(&self, addr: SocketAddr, protocol: &str) -> io::Result<Stream>;
}

/// Receives inbound streams for the protocol it was registered under.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: Stream);
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("stream closed during negotiation")]
    Closed,
    #[error("no handler for protocol {0:?}")]
    UnknownProtocol(String),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("malformed hello")]
    MalformedHello,
    #[error("peer id does not match public key")]
    IdentityMismatch,
}

impl From<NegotiationError> for io::Error {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::Io(e) => e,
            NegotiationError::Closed => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

type Handlers = Arc<RwLock<HashMap<String, Arc<dyn StreamHandler>>>>;

/// Local endpoint: identity plus the protocol handlers it serves.
#[derive(Clone)]
pub struct Node {
    keypair: Arc<Keypair>,
    handlers: Handlers,
    max_frame_len: u32,
}

impl Node {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self {
            keypair,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            max_frame_len: u32::MAX,
        }
    }

    /// Ceiling applied to frames on negotiated streams.
    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    /// Install the handler for `protocol`, replacing any previous one.
    pub fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(protocol.to_string(), handler)
            .is_some();
        tracing::debug!(protocol, replaced, "protocol handler installed");
    }

    pub fn is_handling(&self, protocol: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(protocol)
    }

    fn handler_for(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(protocol)
            .cloned()
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(%local, peer = %self.peer_id(), "listening");
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((tcp, from)) => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            match node.accept_stream(tcp).await {
                                Ok((stream, handler)) => handler.handle(stream).await,
                                Err(e) => tracing::debug!(%from, error = %e, "negotiation failed"),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed; listener stopped");
                        break;
                    }
                }
            }
        });
        Ok(local)
    }

    async fn accept_stream(
        &self,
        tcp: TcpStream,
    ) -> Result<(Stream, Arc<dyn StreamHandler>), NegotiationError> {
        let (r, w) = tcp.into_split();
        let mut reader = FrameReader::with_max_frame_len(Box::new(r) as BoxedRead, NEGOTIATION_MAX_FRAME_LEN);
        let mut writer: BoxedWrite = Box::new(w);

        let protocol = reader.read_frame().await?.ok_or(NegotiationError::Closed)?;
        let protocol = String::from_utf8_lossy(&protocol).into_owned();
        let hello = reader.read_frame().await?.ok_or(NegotiationError::Closed)?;
        let remote = parse_hello(&hello)?;
        let Some(handler) = self.handler_for(&protocol) else {
            let _ = writer.shutdown().await;
            return Err(NegotiationError::UnknownProtocol(protocol));
        };
        write_frame(&mut writer, &hello_bytes(&self.keypair)).await?;
        tracing::debug!(%remote, %protocol, "inbound stream opened");
        Ok((self.stream_from(remote, reader, writer), handler))
    }

    async fn connect_stream(&self, addr: SocketAddr, protocol: &str) -> Result<Stream, NegotiationError> {
        let tcp = TcpStream::connect(addr).await?;
        let (r, w) = tcp.into_split();
        let mut reader = FrameReader::with_max_frame_len(Box::new(r) as BoxedRead, NEGOTIATION_MAX_FRAME_LEN);
        let mut writer: BoxedWrite = Box::new(w);

        write_frame(&mut writer, protocol.as_bytes()).await?;
        write_frame(&mut writer, &hello_bytes(&self.keypair)).await?;
        let hello = reader
            .read_frame()
            .await?
            .ok_or_else(|| NegotiationError::UnknownProtocol(protocol.to_string()))?;
        let remote = parse_hello(&hello)?;
        tracing::debug!(%remote, %addr, protocol, "outbound stream opened");
        Ok(self.stream_from(remote, reader, writer))
    }

    fn stream_from(&self, remote: PeerId, reader: FrameReader<BoxedRead>, writer: BoxedWrite) -> Stream {
        Stream::from_parts(remote, reader.with_ceiling(self.max_frame_len), writer)
    }
}

#[async_trait]
impl Dialer for Node {
    async fn open_stream(&self, addr: SocketAddr, protocol: &str) -> io::Result<Stream> {
        Ok(self.connect_stream(addr, protocol).await?)
    }
}

fn hello_bytes(keypair: &Keypair) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.peer_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

fn parse_hello(buf: &[u8]) -> Result<PeerId, NegotiationError> {
    if buf.len() != HELLO_SIZE {
        return Err(NegotiationError::MalformedHello);
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(NegotiationError::Version(buf[0]));
    }
    let mut peer_id = [0u8; 16];
    peer_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    let public_key = PublicKey::from_bytes(public_key);
    let peer_id = PeerId::from_bytes(peer_id);
    if PeerId::from_public_key(public_key.as_bytes()) != peer_id {
        return Err(NegotiationError::IdentityMismatch);
    }
    Ok(peer_id)
}
