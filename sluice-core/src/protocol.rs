//! Sluice wire protocol: identifier, version, metadata and approval frames.
//!
//! A session on one stream is:
//! metadata frame (sender to receiver), approval frame (receiver to sender),
//! then zero or more payload frames (sender to receiver).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Protocol identifier negotiated with the transport when a stream opens.
pub const PROTOCOL_ID: &str = "/sluice/file-offer/1.0.0";

/// Transport hello version. Bumped when the hello layout changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Describes the offered file. Sent once, as the first frame, encoded as UTF-8 JSON
/// `{"name", "size", "type", "ts"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Milliseconds since the Unix epoch when the offer was made.
    #[serde(rename = "ts")]
    pub created_at: u64,
}

impl TransferMetadata {
    /// Metadata stamped with the current wall-clock time.
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
            created_at,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, MetadataError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a metadata frame payload. Invalid UTF-8 and invalid JSON are both errors.
    pub fn from_payload(payload: &[u8]) -> Result<Self, MetadataError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("malformed metadata: {0}")]
    Json(#[from] serde_json::Error),
}

/// Receiver's answer to an offer, carried as a single-byte frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    Accept,
    Reject,
}

impl Approval {
    pub fn to_payload(self) -> [u8; 1] {
        match self {
            Approval::Accept => [1],
            Approval::Reject => [0],
        }
    }

    /// Interpret the response frame. Anything other than a first byte of 1,
    /// including a closed stream or an empty frame, is a rejection.
    pub fn from_response(response: Option<&[u8]>) -> Self {
        match response.and_then(|r| r.first()) {
            Some(1) => Approval::Accept,
            _ => Approval::Reject,
        }
    }
}
