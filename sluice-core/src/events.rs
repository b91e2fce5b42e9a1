//! Event notifier: typed lifecycle events and per-kind listener lists.
//!
//! Dispatch is synchronous, in registration order. A listener that returns an
//! error or panics is logged and skipped; the remaining listeners still run
//! and the publisher never sees the failure.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::identity::{PeerId, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IncomingOffer,
    IncomingAccepted,
    IncomingProgress,
    IncomingComplete,
    IncomingRejected,
    IncomingError,
    SendRejected,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::IncomingOffer,
        EventKind::IncomingAccepted,
        EventKind::IncomingProgress,
        EventKind::IncomingComplete,
        EventKind::IncomingRejected,
        EventKind::IncomingError,
        EventKind::SendRejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IncomingOffer => "incoming-offer",
            EventKind::IncomingAccepted => "incoming-accepted",
            EventKind::IncomingProgress => "incoming-progress",
            EventKind::IncomingComplete => "incoming-complete",
            EventKind::IncomingRejected => "incoming-rejected",
            EventKind::IncomingError => "incoming-error",
            EventKind::SendRejected => "send-rejected",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfferEvent {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub from_peer: PeerId,
}

/// Payload of `incoming-accepted` and `incoming-rejected`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionEvent {
    pub id: TransferId,
    pub name: String,
    pub from_peer: PeerId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub id: TransferId,
    pub name: String,
    pub from_peer: PeerId,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub rate_mbps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteEvent {
    pub id: TransferId,
    pub name: String,
    pub from_peer: PeerId,
    pub mime_type: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub id: TransferId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendRejectedEvent {
    pub peer: PeerId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    IncomingOffer(OfferEvent),
    IncomingAccepted(DecisionEvent),
    IncomingProgress(ProgressEvent),
    IncomingComplete(CompleteEvent),
    IncomingRejected(DecisionEvent),
    IncomingError(ErrorEvent),
    SendRejected(SendRejectedEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::IncomingOffer(_) => EventKind::IncomingOffer,
            Event::IncomingAccepted(_) => EventKind::IncomingAccepted,
            Event::IncomingProgress(_) => EventKind::IncomingProgress,
            Event::IncomingComplete(_) => EventKind::IncomingComplete,
            Event::IncomingRejected(_) => EventKind::IncomingRejected,
            Event::IncomingError(_) => EventKind::IncomingError,
            Event::SendRejected(_) => EventKind::SendRejected,
        }
    }
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Listener = Arc<dyn Fn(&Event) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned by [`Notifier::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct Notifier {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns false if `id` was not registered for `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(l, _)| *l != id);
        list.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invoke every listener registered for the event's kind.
    /// The list is snapshotted first so listeners may (un)subscribe while being called.
    pub fn publish(&self, event: &Event) {
        let kind = event.kind();
        let snapshot: Vec<(ListenerId, Listener)> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event = %kind, listener = id.0, error = %e, "listener failed");
                }
                Err(_) => {
                    tracing::warn!(event = %kind, listener = id.0, "listener panicked");
                }
            }
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("Notifier").field("listeners", &counts).finish()
    }
}
