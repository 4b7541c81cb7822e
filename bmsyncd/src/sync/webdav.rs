use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bmsync_core::{DavClient, DavOptions};
use url::Url;

use super::backend::{EditSession, SyncClient, sha1_file_hex, sha1_hex};
use super::error::SyncError;
use super::lease::{Heartbeat, LEASE_REFRESH, LEASE_VALIDITY, remaining_validity};
use super::local::is_bookmark_file;

const BOOKMARKS_DIR: &str = "bookmarks";
const LOCK_FILE: &str = ".lock";
const KML_CONTENT_TYPE: &str = "application/vnd.google-earth.kml+xml";

/// Stands in for the checksum of files uploaded by other clients, which the
/// server stores without one. Not valid hex, so it never equals a real SHA-1.
pub const SENTINEL_CHECKSUM: &str = "unknown";

#[derive(Debug, Clone)]
pub struct WebDavSettings {
    pub server: String,
    pub login_name: String,
    pub app_password: String,
    /// Directory under the user's files holding `bookmarks/` and `.lock`.
    pub remote_dir: String,
    /// Ask the server to compute missing checksums instead of reporting the
    /// sentinel.
    pub recompute_checksums: bool,
    pub dav: DavOptions,
}

/// Nextcloud flavoured WebDAV backend.
pub struct WebDavSyncClient {
    dav: DavClient,
    root: Vec<Url>,
    bookmarks: Url,
    lock: Url,
    recompute_checksums: bool,
}

impl WebDavSyncClient {
    pub fn new(settings: WebDavSettings) -> Result<Self, SyncError> {
        let dav = DavClient::with_options(
            &settings.server,
            &settings.login_name,
            &settings.app_password,
            settings.dav,
        )?;
        let segments: Vec<&str> = settings
            .remote_dir
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        // Every ancestor collection, outermost first, so a missing tree can be
        // created level by level.
        let root = (1..=segments.len())
            .map(|depth| dav.url_for(&segments[..depth]))
            .collect::<Result<Vec<_>, _>>()?;
        let mut bookmark_segments = segments.clone();
        bookmark_segments.push(BOOKMARKS_DIR);
        let bookmarks = dav.url_for(&bookmark_segments)?;
        let mut lock_segments = segments;
        lock_segments.push(LOCK_FILE);
        let lock = dav.url_for(&lock_segments)?;
        Ok(Self {
            dav,
            root,
            bookmarks,
            lock,
            recompute_checksums: settings.recompute_checksums,
        })
    }

    fn file_url(&self, name: &str) -> Url {
        let mut url = self.bookmarks.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(name);
        }
        url
    }
}

#[async_trait]
impl SyncClient for WebDavSyncClient {
    async fn fetch_directory_state(&self) -> Result<Option<String>, SyncError> {
        if let Some(etag) = self.dav.etag(&self.bookmarks).await? {
            return Ok(Some(etag));
        }
        tracing::info!(collection = %self.bookmarks, "creating remote bookmarks directory");
        for collection in self.root.iter().chain(std::iter::once(&self.bookmarks)) {
            self.dav.make_collection(collection).await?;
        }
        Ok(None)
    }

    async fn fetch_remote_checksums(&self) -> Result<HashMap<String, String>, SyncError> {
        let entries = self.dav.list_checksums(&self.bookmarks).await?;
        let mut out = HashMap::with_capacity(entries.len());
        for entry in entries {
            if !is_bookmark_file(Path::new(&entry.name)) {
                continue;
            }
            let checksum = match entry.sha1 {
                Some(sha1) => sha1,
                None if self.recompute_checksums => {
                    match self.dav.recalculate_sha1(&self.file_url(&entry.name)).await? {
                        Some(sha1) => sha1,
                        None => SENTINEL_CHECKSUM.to_string(),
                    }
                }
                None => SENTINEL_CHECKSUM.to_string(),
            };
            out.insert(entry.name, checksum);
        }
        Ok(out)
    }

    fn is_checksum_sentinel(&self, checksum: &str) -> bool {
        checksum == SENTINEL_CHECKSUM
    }

    async fn download_file(&self, name: &str, destination: &Path) -> Result<(), SyncError> {
        let bytes = self
            .dav
            .download_to(&self.file_url(name), destination)
            .await?;
        tracing::debug!(name, bytes, "downloaded bookmark file");
        Ok(())
    }

    async fn open_edit_session(&self) -> Result<Box<dyn EditSession>, SyncError> {
        let session = WebDavEditSession::acquire(
            self.dav.clone(),
            self.bookmarks.clone(),
            self.lock.clone(),
        )
        .await?;
        Ok(Box::new(session))
    }

    fn compute_checksum(&self, bytes: &[u8]) -> String {
        sha1_hex(bytes)
    }

    async fn compute_file_checksum(&self, path: &Path) -> Result<String, SyncError> {
        sha1_file_hex(path).await
    }
}

/// Write session guarded by the `.lock` marker file.
pub struct WebDavEditSession {
    dav: DavClient,
    bookmarks: Url,
    lock: Url,
    heartbeat: Option<Heartbeat>,
}

impl WebDavEditSession {
    pub async fn acquire(dav: DavClient, bookmarks: Url, lock: Url) -> Result<Self, SyncError> {
        if let Some(marker) = dav.last_modified(&lock).await? {
            if let Some(remaining) = remaining_validity(marker.age(), LEASE_VALIDITY) {
                return Err(SyncError::LockAlreadyHeld { remaining });
            }
        }
        touch_marker(&dav, &lock).await?;
        let heartbeat_dav = dav.clone();
        let heartbeat_lock = lock.clone();
        let heartbeat = Heartbeat::spawn(LEASE_REFRESH, move || {
            let dav = heartbeat_dav.clone();
            let lock = heartbeat_lock.clone();
            async move { touch_marker(&dav, &lock).await }
        });
        tracing::debug!(marker = %lock, "lease acquired");
        Ok(Self {
            dav,
            bookmarks,
            lock,
            heartbeat: Some(heartbeat),
        })
    }

    fn file_url(&self, name: &str) -> Url {
        let mut url = self.bookmarks.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(name);
        }
        url
    }
}

async fn touch_marker(dav: &DavClient, lock: &Url) -> Result<(), bmsync_core::DavError> {
    dav.put_bytes(lock, Vec::new(), "text/plain", None).await
}

#[async_trait]
impl EditSession for WebDavEditSession {
    async fn put(&mut self, name: &str, bytes: Vec<u8>, checksum: &str) -> Result<(), SyncError> {
        self.dav
            .put_bytes(&self.file_url(name), bytes, KML_CONTENT_TYPE, Some(checksum))
            .await?;
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> Result<(), SyncError> {
        self.dav.delete(&self.file_url(name)).await?;
        Ok(())
    }

    async fn explicitly_set_checksum(&mut self, name: &str, checksum: &str) -> Result<(), SyncError> {
        match self.dav.recalculate_sha1(&self.file_url(name)).await? {
            Some(stored) if stored == checksum => {}
            Some(stored) => tracing::warn!(
                name,
                local = checksum,
                remote = %stored,
                "server computed a different checksum than the downloaded copy"
            ),
            None => tracing::warn!(name, "server did not store a checksum"),
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        match self.dav.delete(&self.lock).await {
            Ok(_) => tracing::debug!(marker = %self.lock, "lease released"),
            Err(err) => tracing::warn!(error = %err, "failed to release lease"),
        }
    }
}

impl Drop for WebDavEditSession {
    fn drop(&mut self) {
        // Only reached without `close`, e.g. when the sync task is aborted.
        let Some(heartbeat) = self.heartbeat.take() else {
            return;
        };
        drop(heartbeat);
        let dav = self.dav.clone();
        let lock = self.lock.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = dav.delete(&lock).await {
                    tracing::warn!(error = %err, "failed to release abandoned lease");
                }
            });
        }
    }
}

#[cfg(test)]
#[path = "webdav_tests.rs"]
mod tests;
