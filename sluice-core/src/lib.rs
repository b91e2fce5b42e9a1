//! Sluice file-offer protocol core.
//! Host-driven: no I/O; host feeds frames and decisions in and publishes the events it gets back.

pub mod events;
pub mod identity;
pub mod outbound;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use events::{Event, EventKind, ListenerError, ListenerId, Notifier};
pub use identity::{Keypair, ParsePeerIdError, PeerId, PublicKey, TransferId};
pub use outbound::{mime_type_for, ByteSource, MemorySource, OutboundTransfer, SendState};
pub use protocol::{Approval, MetadataError, TransferMetadata, PROTOCOL_ID, PROTOCOL_VERSION};
pub use transfer::{rate_mbps, ReceiveSession, Registry, TransferRecord, TransferStatus};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameDecoder, FrameEncodeError};
