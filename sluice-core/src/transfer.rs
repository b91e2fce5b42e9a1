//! Transfer registry: inbound transfer records and their state machine.
//!
//! Host-driven like the rest of the core. The host feeds in offers, decisions
//! and received frames; the registry updates state and returns the [`Event`]s
//! the host should publish. It never publishes itself, so the host can release
//! its lock before listeners run.
//!
//! `S` is whatever the host uses as a stream. The registry parks it while the
//! record waits in `Offer`, and hands it out together with a [`ReceiveSession`]
//! on accept. From then on the session holder is the only writer for that ID.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use crate::events::{CompleteEvent, DecisionEvent, ErrorEvent, Event, OfferEvent, ProgressEvent};
use crate::identity::{PeerId, TransferId};
use crate::protocol::TransferMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Offer,
    Receiving,
    Done,
    Rejected,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Done | TransferStatus::Rejected | TransferStatus::Error
        )
    }
}

/// Snapshot of one inbound transfer as held by the registry.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: TransferId,
    pub metadata: TransferMetadata,
    pub status: TransferStatus,
    pub received_bytes: u64,
    pub from_peer: PeerId,
    /// Set when the record is created and restamped when receiving begins.
    pub started_at: Instant,
}

struct Entry<S> {
    record: TransferRecord,
    stream: Option<S>,
}

/// Exclusive receive-side state for one accepted transfer. Chunks are kept
/// apart and only concatenated on completion.
#[derive(Debug)]
pub struct ReceiveSession {
    id: TransferId,
    metadata: TransferMetadata,
    from_peer: PeerId,
    chunks: Vec<Vec<u8>>,
    received_bytes: u64,
    started_at: Instant,
}

impl ReceiveSession {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// The declared size has been reached. The last frame may overshoot it;
    /// the overshoot is kept.
    pub fn is_complete(&self) -> bool {
        self.received_bytes >= self.metadata.size
    }

    fn push(&mut self, chunk: Vec<u8>) {
        self.received_bytes += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    fn into_payload(self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Transfer rate in Mbps: `bytes * 8 / (seconds * 1024 * 1024)`, 0 when no time has elapsed.
pub fn rate_mbps(received_bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    (received_bytes as f64 * 8.0) / (elapsed_secs * 1024.0 * 1024.0)
}

pub struct Registry<S> {
    entries: HashMap<TransferId, Entry<S>>,
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Record a parsed offer and park its stream. Returns the new ID and the
    /// `incoming-offer` event.
    pub fn insert_offer(
        &mut self,
        from_peer: PeerId,
        metadata: TransferMetadata,
        stream: S,
    ) -> (TransferId, Event) {
        let mut id = TransferId::generate(&from_peer, SystemTime::now());
        while self.entries.contains_key(&id) {
            id = TransferId::generate(&from_peer, SystemTime::now());
        }
        let event = Event::IncomingOffer(OfferEvent {
            id,
            name: metadata.name.clone(),
            size: metadata.size,
            mime_type: metadata.mime_type.clone(),
            from_peer,
        });
        self.entries.insert(
            id,
            Entry {
                record: TransferRecord {
                    id,
                    metadata,
                    status: TransferStatus::Offer,
                    received_bytes: 0,
                    from_peer,
                    started_at: Instant::now(),
                },
                stream: Some(stream),
            },
        );
        (id, event)
    }

    /// `Offer -> Receiving`. Hands out the parked stream and an exclusive
    /// session. `None` if the ID is unknown or no longer an offer.
    pub fn begin_accept(&mut self, id: TransferId) -> Option<(S, ReceiveSession, Event)> {
        let entry = self.entries.get_mut(&id)?;
        if entry.record.status != TransferStatus::Offer {
            return None;
        }
        let stream = entry.stream.take()?;
        let now = Instant::now();
        entry.record.status = TransferStatus::Receiving;
        entry.record.started_at = now;
        let record = &entry.record;
        let session = ReceiveSession {
            id,
            metadata: record.metadata.clone(),
            from_peer: record.from_peer,
            chunks: Vec::new(),
            received_bytes: 0,
            started_at: now,
        };
        let event = Event::IncomingAccepted(DecisionEvent {
            id,
            name: record.metadata.name.clone(),
            from_peer: record.from_peer,
        });
        Some((stream, session, event))
    }

    /// `Offer -> Rejected`. Hands out the parked stream so the host can send
    /// the reject byte and close it. `None` if not an offer.
    pub fn reject(&mut self, id: TransferId) -> Option<(S, Event)> {
        let entry = self.entries.get_mut(&id)?;
        if entry.record.status != TransferStatus::Offer {
            return None;
        }
        let stream = entry.stream.take()?;
        entry.record.status = TransferStatus::Rejected;
        let event = Event::IncomingRejected(DecisionEvent {
            id,
            name: entry.record.metadata.name.clone(),
            from_peer: entry.record.from_peer,
        });
        Some((stream, event))
    }

    /// Append one received payload frame and return the `incoming-progress` event.
    pub fn record_frame(&mut self, session: &mut ReceiveSession, chunk: Vec<u8>) -> Event {
        session.push(chunk);
        if let Some(entry) = self.entries.get_mut(&session.id) {
            entry.record.received_bytes = session.received_bytes;
        }
        Event::IncomingProgress(ProgressEvent {
            id: session.id,
            name: session.metadata.name.clone(),
            from_peer: session.from_peer,
            received_bytes: session.received_bytes,
            total_bytes: session.metadata.size,
            rate_mbps: rate_mbps(
                session.received_bytes,
                session.started_at.elapsed().as_secs_f64(),
            ),
        })
    }

    /// `Receiving -> Done`. Concatenates the chunks into the delivered payload.
    pub fn complete(&mut self, session: ReceiveSession) -> Event {
        if let Some(entry) = self.entries.get_mut(&session.id) {
            entry.record.status = TransferStatus::Done;
            entry.record.received_bytes = session.received_bytes;
        }
        let id = session.id;
        let name = session.metadata.name.clone();
        let mime_type = session.metadata.mime_type.clone();
        let from_peer = session.from_peer;
        Event::IncomingComplete(CompleteEvent {
            id,
            name,
            from_peer,
            mime_type,
            payload: session.into_payload(),
        })
    }

    /// `Receiving -> Error`. Received chunks are discarded.
    pub fn fail(&mut self, session: ReceiveSession, message: impl Into<String>) -> Event {
        if let Some(entry) = self.entries.get_mut(&session.id) {
            entry.record.status = TransferStatus::Error;
            entry.record.received_bytes = session.received_bytes;
        }
        Event::IncomingError(ErrorEvent {
            id: session.id,
            message: message.into(),
        })
    }

    pub fn get(&self, id: TransferId) -> Option<&TransferRecord> {
        self.entries.get(&id).map(|e| &e.record)
    }

    pub fn records(&self) -> Vec<TransferRecord> {
        self.entries.values().map(|e| e.record.clone()).collect()
    }

    /// IDs still waiting for accept/reject.
    pub fn pending(&self) -> Vec<TransferId> {
        self.entries
            .values()
            .filter(|e| e.record.status == TransferStatus::Offer)
            .map(|e| e.record.id)
            .collect()
    }

    /// Evict a finished record. Records still in `Offer` or `Receiving` stay.
    pub fn remove(&mut self, id: TransferId) -> Option<TransferRecord> {
        if !self.entries.get(&id)?.record.status.is_terminal() {
            return None;
        }
        self.entries.remove(&id).map(|e| e.record)
    }

    /// Evict every finished record. Returns how many were removed.
    pub fn prune_finished(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.record.status.is_terminal());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}
