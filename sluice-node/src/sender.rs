//! Outbound sender: offer a file to a peer and stream it once approved.

use std::io;
use std::net::SocketAddr;

use sluice_core::events::SendRejectedEvent;
use sluice_core::{Approval, Event, MetadataError, OutboundTransfer, PeerId, PROTOCOL_ID};

use crate::handler::TransferProtocol;
use crate::source::OutgoingFile;
use crate::transport::Dialer;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("stream: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("reading source: {0}")]
    Source(#[source] io::Error),
    #[error("expected peer {expected}, connected to {actual}")]
    PeerMismatch { expected: PeerId, actual: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub bytes_sent: u64,
    /// False when the receiver rejected the offer (or hung up before answering).
    pub accepted: bool,
}

/// Where to send: an address, optionally pinned to the peer expected there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub addr: SocketAddr,
    pub peer: Option<PeerId>,
}

impl PeerAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, peer: None }
    }

    /// Refuse to offer anything unless the hello at `addr` names `peer`.
    pub fn expecting(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl TransferProtocol {
    /// Offer `file` to the peer at `target`. On approval, stream it in
    /// `chunk_size` frames, calling `on_progress(sent, total)` after each one.
    ///
    /// A rejection is not an error: it publishes `send-rejected` and returns
    /// with `accepted: false` and nothing sent. Success means every frame was
    /// written and our side closed; it says nothing about what the receiver kept.
    pub async fn send<D, F>(
        &self,
        dialer: &D,
        target: impl Into<PeerAddr>,
        file: OutgoingFile,
        chunk_size: usize,
        mut on_progress: F,
    ) -> Result<SendReport, SendError>
    where
        D: Dialer + ?Sized,
        F: FnMut(u64, u64) + Send,
    {
        let target = target.into();
        let mut transfer = OutboundTransfer::new(file.metadata());
        let OutgoingFile { name, mut source, .. } = file;

        let mut stream = dialer.open_stream(target.addr, PROTOCOL_ID).await?;
        let peer = stream.remote_peer();
        if let Some(expected) = target.peer.filter(|p| *p != peer) {
            tracing::warn!(%expected, actual = %peer, addr = %target.addr, "unexpected peer, not offering");
            stream.close().await;
            return Err(SendError::PeerMismatch {
                expected,
                actual: peer,
            });
        }
        stream.write_frame(&transfer.metadata_payload()?).await?;
        tracing::info!(%peer, name = %name, size = transfer.total_bytes(), "offer sent");

        let response = stream.read_frame().await?;
        if transfer.on_response(response.as_deref()) == Approval::Reject {
            tracing::info!(%peer, name = %name, "offer rejected");
            self.notifier()
                .publish(&Event::SendRejected(SendRejectedEvent { peer, name }));
            stream.close().await;
            return Ok(SendReport {
                bytes_sent: 0,
                accepted: false,
            });
        }

        let total = transfer.total_bytes();
        loop {
            let read = source
                .read_chunk(chunk_size.max(1))
                .await
                .map_err(SendError::Source)?;
            let Some(chunk) = transfer.offer_chunk(read) else {
                break;
            };
            stream.write_frame(&chunk).await?;
            transfer.record_sent(chunk.len());
            tracing::trace!(%peer, sent = transfer.bytes_sent(), total, "chunk sent");
            on_progress(transfer.bytes_sent(), total);
        }
        stream.close_write().await?;

        tracing::info!(%peer, name = %name, sent = transfer.bytes_sent(), "send finished");
        Ok(SendReport {
            bytes_sent: transfer.bytes_sent(),
            accepted: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{write_frame, FrameReader};
    use crate::transport::Stream;
    use async_trait::async_trait;
    use sluice_core::{EventKind, Keypair, TransferMetadata};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::oneshot;

    /// Hands out one pre-built stream, keeping the far end for the test.
    struct PipeDialer(Mutex<Option<Stream>>);

    #[async_trait]
    impl Dialer for PipeDialer {
        async fn open_stream(&self, _addr: SocketAddr, protocol: &str) -> io::Result<Stream> {
            assert_eq!(protocol, PROTOCOL_ID);
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "already dialed"))
        }
    }

    type FarEnd = (FrameReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>);

    fn dialer() -> (PipeDialer, FrameReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>) {
        let (dialer, (reader, writer)) = dialer_to(Keypair::generate().peer_id());
        (dialer, reader, writer)
    }

    fn dialer_to(peer: PeerId) -> (PipeDialer, FarEnd) {
        let (local, remote) = duplex(64 * 1024);
        let (lr, lw) = split(local);
        let (rr, rw) = split(remote);
        let stream = Stream::new(peer, lr, lw);
        (PipeDialer(Mutex::new(Some(stream))), (FrameReader::new(rr), rw))
    }

    fn hello() -> OutgoingFile {
        OutgoingFile::from_bytes("a.txt", "text/plain", b"hello world".to_vec())
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn approved_send_streams_chunks() {
        let protocol = TransferProtocol::new();
        let (dialer, mut reader, mut writer) = dialer();
        let receiver = tokio::spawn(async move {
            let meta = TransferMetadata::from_payload(&reader.read_frame().await.unwrap().unwrap()).unwrap();
            write_frame(&mut writer, &[1]).await.unwrap();
            let mut frames = Vec::new();
            while let Some(frame) = reader.read_frame().await.unwrap() {
                frames.push(frame);
            }
            (meta, frames)
        });

        let file = hello();
        let mut progress = Vec::new();
        let report = protocol
            .send(&dialer, addr(), file, 4, |sent, total| progress.push((sent, total)))
            .await
            .unwrap();

        assert_eq!(report, SendReport { bytes_sent: 11, accepted: true });
        assert_eq!(progress, vec![(4, 11), (8, 11), (11, 11)]);
        let (meta, frames) = receiver.await.unwrap();
        assert_eq!(meta.name, "a.txt");
        assert_eq!(meta.size, 11);
        assert_eq!(meta.mime_type, "text/plain");
        assert_eq!(frames, vec![b"hell".to_vec(), b"o wo".to_vec(), b"rld".to_vec()]);
    }

    #[tokio::test]
    async fn rejection_publishes_and_sends_nothing() {
        for answer in [Some(vec![0u8]), Some(vec![5u8]), None] {
            let protocol = TransferProtocol::new();
            let rejected = Arc::new(Mutex::new(Vec::new()));
            let r = rejected.clone();
            protocol.subscribe(EventKind::SendRejected, move |e| {
                r.lock().unwrap().push(e.clone());
                Ok(())
            });

            let (dialer, mut reader, mut writer) = dialer();
            let receiver = tokio::spawn(async move {
                reader.read_frame().await.unwrap().unwrap();
                match answer {
                    Some(byte) => write_frame(&mut writer, &byte).await.unwrap(),
                    None => writer.shutdown().await.unwrap(),
                }
                let mut payload_frames = 0;
                while let Ok(Some(_)) = reader.read_frame().await {
                    payload_frames += 1;
                }
                payload_frames
            });

            let report = protocol.send(&dialer, addr(), hello(), 4, |_, _| {}).await.unwrap();
            assert_eq!(report, SendReport { bytes_sent: 0, accepted: false });
            assert_eq!(receiver.await.unwrap(), 0);

            let rejected = rejected.lock().unwrap();
            assert_eq!(rejected.len(), 1);
            match &rejected[0] {
                Event::SendRejected(e) => assert_eq!(e.name, "a.txt"),
                other => panic!("unexpected {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn dial_failure_is_an_error() {
        let protocol = TransferProtocol::new();
        let dialer = PipeDialer(Mutex::new(None));
        let file = OutgoingFile::from_bytes("a", "x", vec![1]);
        let err = protocol.send(&dialer, addr(), file, 4, |_, _| {}).await.unwrap_err();
        assert!(matches!(err, SendError::Io(_)));
    }

    #[tokio::test]
    async fn receiver_gone_mid_transfer_is_an_io_error() {
        let protocol = TransferProtocol::new();
        let (dialer, mut reader, mut writer) = dialer();
        let receiver = tokio::spawn(async move {
            reader.read_frame().await.unwrap().unwrap();
            write_frame(&mut writer, &[1]).await.unwrap();
            // Both halves go, so the pipe is closed in both directions.
            drop(reader);
            drop(writer);
        });

        let file = OutgoingFile::from_bytes("big.bin", "application/octet-stream", vec![7u8; 256 * 1024]);
        let err = protocol
            .send(&dialer, addr(), file, 16 * 1024, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Io(_)), "got {err:?}");
        receiver.await.unwrap();
    }

    #[tokio::test]
    async fn send_returns_while_receiver_keeps_the_stream_open() {
        let protocol = TransferProtocol::new();
        let (dialer, mut reader, mut writer) = dialer();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let receiver = tokio::spawn(async move {
            reader.read_frame().await.unwrap().unwrap();
            write_frame(&mut writer, &[1]).await.unwrap();
            let mut payload = Vec::new();
            while let Some(frame) = reader.read_frame().await.unwrap() {
                payload.extend(frame);
            }
            // Hold our end open until the test is done with the sender.
            let _ = release_rx.await;
            drop(writer);
            payload
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            protocol.send(&dialer, addr(), hello(), 4, |_, _| {}),
        )
        .await
        .expect("send waited on the receiver")
        .unwrap();
        assert_eq!(report, SendReport { bytes_sent: 11, accepted: true });

        release_tx.send(()).unwrap();
        assert_eq!(receiver.await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn wrong_peer_gets_no_offer() {
        let protocol = TransferProtocol::new();
        let actual = Keypair::generate().peer_id();
        let expected = Keypair::generate().peer_id();
        let (dialer, (mut reader, _writer)) = dialer_to(actual);

        let target = PeerAddr::new(addr()).expecting(expected);
        let err = protocol.send(&dialer, target, hello(), 4, |_, _| {}).await.unwrap_err();
        match err {
            SendError::PeerMismatch { expected: e, actual: a } => {
                assert_eq!(e, expected);
                assert_eq!(a, actual);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expected_peer_is_offered_the_file() {
        let protocol = TransferProtocol::new();
        let peer = Keypair::generate().peer_id();
        let (dialer, (mut reader, mut writer)) = dialer_to(peer);
        let receiver = tokio::spawn(async move {
            let meta = TransferMetadata::from_payload(&reader.read_frame().await.unwrap().unwrap()).unwrap();
            write_frame(&mut writer, &[1]).await.unwrap();
            while reader.read_frame().await.unwrap().is_some() {}
            meta.name
        });

        let target = PeerAddr::new(addr()).expecting(peer);
        let report = protocol.send(&dialer, target, hello(), 4, |_, _| {}).await.unwrap();
        assert!(report.accepted);
        assert_eq!(receiver.await.unwrap(), "a.txt");
    }
}
