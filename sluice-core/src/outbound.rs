//! Outbound side: sequential byte sources and the sender's state machine.
//!
//! The host drives [`OutboundTransfer`]: write the metadata frame, feed the
//! approval response, then hand over chunks it read (`offer_chunk`, or
//! `next_chunk` for an in-memory [`ByteSource`]) and report each completed
//! write with `record_sent`. Reading files is the host's job.

use std::io;
use std::path::Path;

use crate::protocol::{Approval, MetadataError, TransferMetadata};

/// Default payload chunk size. Any size works; frames carry explicit lengths.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A source read front to back exactly once.
pub trait ByteSource {
    fn total_len(&self) -> u64;

    /// Read up to `max` bytes. `Ok(None)` once the source is exhausted.
    fn read_next(&mut self, max: usize) -> io::Result<Option<Vec<u8>>>;
}

/// In-memory source.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl ByteSource for MemorySource {
    fn total_len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_next(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        if self.pos >= self.data.len() || max == 0 {
            return Ok(None);
        }
        let end = (self.pos + max).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(chunk))
    }
}

/// Best-effort MIME type from the file extension.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    AwaitApproval,
    Streaming,
    Done,
}

/// Sender-side session: await-approval, streaming, done.
#[derive(Debug)]
pub struct OutboundTransfer {
    metadata: TransferMetadata,
    state: SendState,
    sent: u64,
}

impl OutboundTransfer {
    pub fn new(metadata: TransferMetadata) -> Self {
        Self {
            metadata,
            state: SendState::AwaitApproval,
            sent: 0,
        }
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    pub fn metadata_payload(&self) -> Result<Vec<u8>, MetadataError> {
        self.metadata.to_payload()
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    /// Feed the receiver's response frame (`None` if the stream ended first).
    /// Only meaningful while awaiting approval; later calls change nothing.
    pub fn on_response(&mut self, response: Option<&[u8]>) -> Approval {
        if self.state != SendState::AwaitApproval {
            return match self.state {
                SendState::Streaming => Approval::Accept,
                _ => Approval::Reject,
            };
        }
        let approval = Approval::from_response(response);
        self.state = match approval {
            Approval::Accept => SendState::Streaming,
            Approval::Reject => SendState::Done,
        };
        approval
    }

    /// Feed the host's latest read. Returns the chunk to write, or `None` once
    /// the source is exhausted (the transfer is then `Done`) or if streaming
    /// was never approved.
    pub fn offer_chunk(&mut self, read: Option<Vec<u8>>) -> Option<Vec<u8>> {
        if self.state != SendState::Streaming {
            return None;
        }
        match read {
            Some(chunk) if !chunk.is_empty() => Some(chunk),
            _ => {
                self.state = SendState::Done;
                None
            }
        }
    }

    /// `offer_chunk` over an in-memory source.
    pub fn next_chunk<B>(&mut self, source: &mut B, chunk_size: usize) -> io::Result<Option<Vec<u8>>>
    where
        B: ByteSource + ?Sized,
    {
        if self.state != SendState::Streaming {
            return Ok(None);
        }
        let read = source.read_next(chunk_size.max(1))?;
        Ok(self.offer_chunk(read))
    }

    /// Account for a chunk that has been written to the stream.
    pub fn record_sent(&mut self, len: usize) {
        self.sent += len as u64;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    pub fn total_bytes(&self) -> u64 {
        self.metadata.size
    }
}
