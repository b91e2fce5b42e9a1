//! Writing received payloads into the download directory.

use std::io;
use std::path::{Path, PathBuf};

use sluice_core::events::CompleteEvent;

use crate::handler::TransferProtocol;

/// Save a completed transfer under `dir` and evict its record either way.
/// A failed write is logged and yields `None`; the caller keeps serving.
pub async fn store(protocol: &TransferProtocol, dir: &Path, done: &CompleteEvent) -> Option<PathBuf> {
    let saved = match save(dir, done).await {
        Ok(path) => {
            tracing::info!(id = %done.id, path = %path.display(), bytes = done.payload.len(), "saved");
            Some(path)
        }
        Err(e) => {
            tracing::warn!(id = %done.id, name = %done.name, dir = %dir.display(), error = %e, "cannot save received file");
            None
        }
    };
    protocol.remove(done.id).await;
    saved
}

/// Write the payload under `dir`, keeping only the file-name part of the offered
/// name and never overwriting an existing file.
pub async fn save(dir: &Path, done: &CompleteEvent) -> io::Result<PathBuf> {
    let name = Path::new(&done.name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.bin", done.id));
    let mut path = dir.join(&name);
    let mut n = 1;
    while tokio::fs::try_exists(&path).await.unwrap_or(false) {
        path = dir.join(format!("{name}.{n}"));
        n += 1;
    }
    tokio::fs::write(&path, &done.payload).await?;
    Ok(path)
}
