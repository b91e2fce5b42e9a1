//! Persisted node identity: the raw 32-byte X25519 secret in one file.

use std::io;
use std::path::Path;

use sluice_core::Keypair;

/// Load the keypair at `path`, or generate one and save it there.
pub async fn load_or_create(path: &Path) -> io::Result<Keypair> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: expected 32 bytes, found {}", path.display(), bytes.len()),
                )
            })?;
            Ok(Keypair::from_secret_bytes(secret))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            save(path, &keypair).await?;
            tracing::info!(path = %path.display(), peer = %keypair.peer_id(), "generated identity");
            Ok(keypair)
        }
        Err(e) => Err(e),
    }
}

async fn save(path: &Path, keypair: &Keypair) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, keypair.secret_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
