//! Async frame reader/writer over raw byte streams.

use std::io;

use sluice_core::wire::{encode_frame, FrameDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of each raw read from the underlying stream.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Turns whatever chunk sizes the transport delivers into complete frames.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    scratch: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, u32::MAX)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: u32) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::with_max_frame_len(max_frame_len),
            scratch: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Same reader with a new frame ceiling. Already buffered bytes carry over.
    pub fn with_ceiling(mut self, max_frame_len: u32) -> Self {
        self.decoder.set_max_frame_len(max_frame_len);
        self
    }

    /// Next frame payload, or `Ok(None)` at end of stream. Bytes of an
    /// unfinished frame left at end of stream are dropped.
    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self
                .decoder
                .next_frame()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::trace!(
                        buffered = self.decoder.buffered(),
                        "stream ended inside a frame"
                    );
                }
                return Ok(None);
            }
            self.decoder.push(&self.scratch[..n]);
        }
    }
}

/// Write one frame (length prefix + payload) and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}
