//! File-offer protocol handler: inbound offers, accept/reject, receive loop.

use std::sync::Arc;

use async_trait::async_trait;
use sluice_core::{
    Approval, Event, EventKind, ListenerError, ListenerId, Notifier, ReceiveSession, Registry,
    TransferId, TransferMetadata, TransferRecord, PROTOCOL_ID,
};
use tokio::sync::Mutex;

use crate::transport::{Node, Stream, StreamHandler};

/// Shared by the transport's per-stream tasks, the receive loops and the
/// application. Cheap to clone.
#[derive(Clone, Default)]
pub struct TransferProtocol {
    registry: Arc<Mutex<Registry<Stream>>>,
    notifier: Arc<Notifier>,
}

impl TransferProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the inbound handler for [`PROTOCOL_ID`]. Calling it again replaces the previous one.
    pub fn register_handler(&self, node: &Node) {
        node.handle(PROTOCOL_ID, Arc::new(self.clone()));
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.notifier.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        self.notifier.unsubscribe(kind, id)
    }

    /// Read the metadata frame and park the stream as an offer.
    /// Returns `None` when the stream ended early or the metadata was malformed;
    /// nothing is published in that case.
    pub async fn handle_inbound(&self, mut stream: Stream) -> Option<TransferId> {
        let peer = stream.remote_peer();
        let first = match stream.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(%peer, "stream closed before metadata");
                stream.close().await;
                return None;
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "reading metadata failed");
                stream.close().await;
                return None;
            }
        };
        let metadata = match TransferMetadata::from_payload(&first) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "dropping offer");
                stream.close().await;
                return None;
            }
        };

        let (id, event) = self.registry.lock().await.insert_offer(peer, metadata, stream);
        tracing::info!(%id, %peer, "incoming offer");
        self.notifier.publish(&event);
        Some(id)
    }

    /// Send the approval byte and start receiving in the background.
    /// Returns false (and does nothing) unless `id` is a pending offer.
    pub async fn accept(&self, id: TransferId) -> bool {
        let Some((mut stream, session, event)) = self.registry.lock().await.begin_accept(id) else {
            tracing::debug!(%id, "accept ignored: not a pending offer");
            return false;
        };
        if let Err(e) = stream.write_frame(&Approval::Accept.to_payload()).await {
            let failed = self.registry.lock().await.fail(session, e.to_string());
            tracing::warn!(%id, error = %e, "sending approval failed");
            self.notifier.publish(&failed);
            stream.close().await;
            return true;
        }
        tracing::info!(%id, name = %session.metadata().name, "accepted");
        self.notifier.publish(&event);

        let this = self.clone();
        tokio::spawn(async move { this.receive(stream, session).await });
        true
    }

    /// Send the reject byte and close. Returns false unless `id` is a pending offer.
    pub async fn reject(&self, id: TransferId) -> bool {
        let Some((mut stream, event)) = self.registry.lock().await.reject(id) else {
            tracing::debug!(%id, "reject ignored: not a pending offer");
            return false;
        };
        // The sender treats a closed stream as a rejection too.
        if let Err(e) = stream.write_frame(&Approval::Reject.to_payload()).await {
            tracing::debug!(%id, error = %e, "sending rejection failed");
        }
        tracing::info!(%id, "rejected");
        self.notifier.publish(&event);
        stream.close().await;
        true
    }

    async fn receive(&self, mut stream: Stream, mut session: ReceiveSession) {
        let id = session.id();
        let outcome = loop {
            if session.is_complete() {
                break Ok(());
            }
            match stream.read_frame().await {
                Ok(Some(frame)) if frame.is_empty() => continue,
                Ok(Some(frame)) => {
                    tracing::trace!(%id, len = frame.len(), "payload frame");
                    let progress = self.registry.lock().await.record_frame(&mut session, frame);
                    self.notifier.publish(&progress);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let event = match outcome {
            Ok(()) => {
                let (received, size) = (session.received_bytes(), session.metadata().size);
                if received < size {
                    tracing::warn!(%id, received, size, "stream ended before declared size");
                } else {
                    tracing::info!(%id, received, "transfer complete");
                }
                self.registry.lock().await.complete(session)
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "transfer failed");
                self.registry.lock().await.fail(session, e.to_string())
            }
        };
        self.notifier.publish(&event);
        stream.close().await;
    }

    pub async fn record(&self, id: TransferId) -> Option<TransferRecord> {
        self.registry.lock().await.get(id).cloned()
    }

    pub async fn records(&self) -> Vec<TransferRecord> {
        self.registry.lock().await.records()
    }

    pub async fn pending(&self) -> Vec<TransferId> {
        self.registry.lock().await.pending()
    }

    /// Evict a finished transfer once its payload has been consumed.
    pub async fn remove(&self, id: TransferId) -> Option<TransferRecord> {
        self.registry.lock().await.remove(id)
    }

    pub async fn prune_finished(&self) -> usize {
        self.registry.lock().await.prune_finished()
    }
}

#[async_trait]
impl StreamHandler for TransferProtocol {
    async fn handle(&self, stream: Stream) {
        self.handle_inbound(stream).await;
    }
}
