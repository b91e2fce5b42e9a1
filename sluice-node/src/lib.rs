//! Sluice node: tokio host for the file-offer protocol core.
//! Owns sockets, tasks and files; the protocol state lives in `sluice_core`.

pub mod config;
pub mod downloads;
pub mod framing;
pub mod handler;
pub mod keystore;
pub mod logging;
pub mod sender;
pub mod source;
pub mod transport;

pub use config::Config;
pub use framing::FrameReader;
pub use handler::TransferProtocol;
pub use sender::{PeerAddr, SendError, SendReport};
pub use source::{ChunkSource, OutgoingFile, ReaderSource};
pub use transport::{Dialer, NegotiationError, Node, Stream, StreamHandler};
