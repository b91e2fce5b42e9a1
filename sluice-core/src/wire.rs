//! Framing: length-prefix (4 bytes BE) + opaque payload.
//!
//! The codec itself enforces no maximum beyond what fits in the `u32` length
//! field. [`FrameDecoder`] accepts an optional ceiling so a host can refuse
//! oversized announcements before buffering them.

pub const LEN_SIZE: usize = 4;

/// Encode a payload into a single frame: 4 bytes BE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload does not fit a u32 length prefix")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the payload slice and the number of bytes consumed.
/// Call with partial buffer; returns NeedMore if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    let len = peek_len(bytes).ok_or(FrameDecodeError::NeedMore)? as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

fn peek_len(bytes: &[u8]) -> Option<u32> {
    let head: [u8; LEN_SIZE] = bytes.get(..LEN_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(head))
}

/// Error decoding a frame (need more bytes, or announced length over the ceiling).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: u32, max: u32 },
}

/// Push-based frame assembler. Raw chunks of any size go in, complete payloads
/// come out in the order they were encoded.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(u32::MAX)
    }

    pub fn with_max_frame_len(max_frame_len: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Change the ceiling; bytes already buffered are kept.
    pub fn set_max_frame_len(&mut self, max_frame_len: u32) {
        self.max_frame_len = max_frame_len;
    }

    /// Append a raw chunk as delivered by the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete payload, or `Ok(None)` if more bytes are needed.
    /// The length field is only consumed together with its payload.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameDecodeError> {
        if let Some(len) = peek_len(&self.buf) {
            if len > self.max_frame_len {
                return Err(FrameDecodeError::TooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }
        }
        let consumed = match decode_frame(&self.buf) {
            Ok((_, n)) => n,
            Err(FrameDecodeError::NeedMore) => return Ok(None),
            Err(e) => return Err(e),
        };
        let payload = self.buf[LEN_SIZE..consumed].to_vec();
        self.buf.drain(..consumed);
        Ok(Some(payload))
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
