//! Files offered by this node, read asynchronously one chunk at a time.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use sluice_core::outbound::mime_type_for;
use sluice_core::{ByteSource, MemorySource, TransferMetadata};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A byte source read front to back exactly once, without blocking the runtime.
#[async_trait]
pub trait ChunkSource: Send {
    fn total_len(&self) -> u64;

    /// Read up to `max` bytes. `Ok(None)` once the source is exhausted.
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Vec<u8>>>;
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn total_len(&self) -> u64 {
        ByteSource::total_len(self)
    }

    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        self.read_next(max)
    }
}

/// Reads exactly `len` bytes from an async reader. A reader that ends early
/// is an `UnexpectedEof` error; bytes past `len` are never read.
pub struct ReaderSource<R> {
    inner: R,
    len: u64,
    read: u64,
}

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
    pub fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            len,
            read: 0,
        }
    }
}

impl ReaderSource<tokio::fs::File> {
    /// Open `path` and take its current length as the size to send.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self::new(file, len))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkSource for ReaderSource<R> {
    fn total_len(&self) -> u64 {
        self.len
    }

    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        let remaining = self.len - self.read;
        if remaining == 0 || max == 0 {
            return Ok(None);
        }
        let want = remaining.min(max as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {} of {} bytes", self.read, self.len),
            ));
        }
        buf.truncate(filled);
        self.read += filled as u64;
        Ok(Some(buf))
    }
}

/// A named, typed source ready to be offered.
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub source: Box<dyn ChunkSource>,
}

impl OutgoingFile {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        source: impl ChunkSource + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            source: Box::new(source),
        }
    }

    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(name, mime_type, MemorySource::new(data))
    }

    /// Offer a file from disk under its own file name, typed by extension.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let source = ReaderSource::open(path).await?;
        Ok(Self::new(name, mime_type_for(path), source))
    }

    pub fn metadata(&self) -> TransferMetadata {
        TransferMetadata::new(self.name.clone(), self.source.total_len(), self.mime_type.clone())
    }
}

impl std::fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.source.total_len())
            .finish()
    }
}
