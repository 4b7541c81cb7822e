use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use super::error::SyncError;
use super::local::LocalError;

/// Read side of a cloud backend. One implementation per backend kind.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Change token of the remote bookmarks directory. `None` means the
    /// directory did not exist; it has been created before returning.
    async fn fetch_directory_state(&self) -> Result<Option<String>, SyncError>;

    /// Remote file name to checksum. Files whose checksum the server cannot
    /// tell carry a sentinel recognized by [`SyncClient::is_checksum_sentinel`].
    async fn fetch_remote_checksums(&self) -> Result<HashMap<String, String>, SyncError>;

    fn is_checksum_sentinel(&self, _checksum: &str) -> bool {
        false
    }

    /// Downloads `name` over `destination`, returning once it is fully written.
    async fn download_file(&self, name: &str, destination: &Path) -> Result<(), SyncError>;

    /// Takes the write lease of the remote directory.
    async fn open_edit_session(&self) -> Result<Box<dyn EditSession>, SyncError>;

    /// Hashes content with the same algorithm the server uses.
    fn compute_checksum(&self, bytes: &[u8]) -> String;

    async fn compute_file_checksum(&self, path: &Path) -> Result<String, SyncError>;
}

/// Write access to the remote directory while the lease is held.
#[async_trait]
pub trait EditSession: Send {
    async fn put(&mut self, name: &str, bytes: Vec<u8>, checksum: &str) -> Result<(), SyncError>;

    /// Deleting a missing file succeeds.
    async fn delete(&mut self, name: &str) -> Result<(), SyncError>;

    /// Makes the server store `checksum` for a file it had no checksum for.
    async fn explicitly_set_checksum(
        &mut self,
        _name: &str,
        _checksum: &str,
    ) -> Result<(), SyncError> {
        Ok(())
    }

    /// Stops the heartbeat and releases the lease. Failures are logged.
    async fn close(self: Box<Self>);
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

pub async fn sha1_file_hex(path: &Path) -> Result<String, SyncError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| LocalError::io(path, err))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|err| LocalError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
