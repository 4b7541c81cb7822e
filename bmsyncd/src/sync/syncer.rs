use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::backend::{EditSession, SyncClient};
use super::dirty::DirtyQueue;
use super::error::SyncError;
use super::hub::SyncHub;
use super::local::{BookmarkStore, DocumentSink, is_bookmark_file, remote_name};
use super::state::SyncStateStore;

/// What one sync cycle changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted_remote: usize,
    pub deleted_local: usize,
    pub conflicts: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        *self == SyncReport::default()
    }
}

/// Reconciles the local bookmarks folder with one account's cloud directory.
pub struct Syncer {
    account_id: u64,
    client: Arc<dyn SyncClient>,
    files: Arc<dyn BookmarkStore>,
    state: SyncStateStore,
    queue: Arc<DirtyQueue>,
    hub: Arc<SyncHub>,
    sink: Arc<dyn DocumentSink>,
}

impl Syncer {
    /// Loads the account's dirty set and registers it with the hub. The first
    /// cycle of a new engine always rescans: files may have changed while no
    /// engine was watching them.
    pub async fn new(
        account_id: u64,
        client: Arc<dyn SyncClient>,
        files: Arc<dyn BookmarkStore>,
        state: SyncStateStore,
        hub: Arc<SyncHub>,
        sink: Arc<dyn DocumentSink>,
    ) -> Result<Self, SyncError> {
        let queue = Arc::new(DirtyQueue::load(account_id, state.clone()).await?);
        state.set_dirty_cache_valid(account_id, false).await?;
        hub.register(account_id, Arc::clone(&queue)).await;
        Ok(Self {
            account_id,
            client,
            files,
            state,
            queue,
            hub,
            sink,
        })
    }

    pub fn account_id(&self) -> u64 {
        self.account_id
    }

    pub fn queue(&self) -> &Arc<DirtyQueue> {
        &self.queue
    }

    pub async fn mark_file_changed(&self, path: &Path) -> Result<(), SyncError> {
        self.queue.mark(path).await?;
        Ok(())
    }

    /// Changes stop being tracked for this account; the next engine built for
    /// it starts with a full rescan.
    pub async fn on_sync_disabled(&self) -> Result<(), SyncError> {
        self.hub.unregister(self.account_id).await;
        self.state
            .set_dirty_cache_valid(self.account_id, false)
            .await?;
        Ok(())
    }

    /// Rebuilds the dirty set from the folder: every local file plus every
    /// cached path, minus files whose content still matches the cache.
    pub async fn rescan(&self) -> Result<(), SyncError> {
        let local: BTreeSet<PathBuf> = self.files.list_files().await?.into_iter().collect();
        let cached = self.state.checksums(self.account_id).await?;
        let mut dirty = local.clone();
        for (path, checksum) in &cached {
            if local.contains(path)
                && self.client.compute_file_checksum(path).await? == *checksum
            {
                dirty.remove(path);
            } else {
                dirty.insert(path.clone());
            }
        }
        self.queue
            .mark_many(dirty.iter().map(PathBuf::as_path))
            .await?;
        self.state
            .set_dirty_cache_valid(self.account_id, true)
            .await?;
        tracing::debug!(
            account_id = self.account_id,
            dirty = self.queue.len(),
            "dirty set rebuilt"
        );
        Ok(())
    }

    /// Forgets everything known about the remote side, so every local file
    /// is treated as never synced.
    pub async fn reset(&self) -> Result<(), SyncError> {
        self.state.reset(self.account_id).await?;
        self.queue.clear().await?;
        self.rescan().await
    }

    pub async fn perform_sync(&self) -> Result<SyncReport, SyncError> {
        let meta = self.state.load_meta(self.account_id).await?;
        if !meta.dirty_cache_valid {
            self.rescan().await?;
        }

        let remote_token = self.client.fetch_directory_state().await?;
        let mut known_token = meta.dir_token;
        if remote_token.is_none() {
            // The whole directory is gone. Deleting every unchanged local file
            // would be wrong, so start over and upload everything.
            tracing::info!(
                account_id = self.account_id,
                "remote bookmarks directory missing, resetting sync state"
            );
            self.reset().await?;
            known_token = None;
        }

        let remote_changed = remote_token != known_token;
        if !remote_changed && self.queue.is_empty() {
            return Ok(SyncReport::default());
        }

        let mut session = self.client.open_edit_session().await?;
        let result = self.run_locked(session.as_mut(), remote_changed).await;
        session.close().await;
        let (report, new_token) = result?;

        self.state
            .set_dir_token(self.account_id, new_token.as_deref())
            .await?;
        self.state
            .set_dirty_cache_valid(self.account_id, true)
            .await?;
        Ok(report)
    }

    async fn run_locked(
        &self,
        session: &mut dyn EditSession,
        remote_changed: bool,
    ) -> Result<(SyncReport, Option<String>), SyncError> {
        // Stays false if the cycle dies half way, forcing a rescan.
        self.state
            .set_dirty_cache_valid(self.account_id, false)
            .await?;

        let mut report = SyncReport::default();
        if remote_changed {
            let mut remote = self.client.fetch_remote_checksums().await?;
            while let Some(claim) = self.queue.claim_next() {
                match self
                    .reconcile(claim.path(), &mut remote, session, &mut report)
                    .await
                {
                    Ok(()) => claim.ack().await?,
                    Err(err) => {
                        claim.requeue();
                        return Err(err);
                    }
                }
            }
            let cached = self.state.checksums(self.account_id).await?;
            self.sweep_remote_deletions(&cached, &remote, &mut report)
                .await?;
            self.download_changed(&cached, &remote, session, &mut report)
                .await?;
        } else {
            while let Some(claim) = self.queue.claim_next() {
                match self.push_local(claim.path(), session, &mut report).await {
                    Ok(()) => claim.ack().await?,
                    Err(err) => {
                        claim.requeue();
                        return Err(err);
                    }
                }
            }
        }

        // Read while still holding the lease so no foreign change slips in
        // between our last write and the stored token.
        let token = self.client.fetch_directory_state().await?;
        tracing::info!(
            account_id = self.account_id,
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            deleted_remote = report.deleted_remote,
            deleted_local = report.deleted_local,
            conflicts = report.conflicts,
            "sync cycle finished"
        );
        Ok((report, token))
    }

    fn is_tracked(&self, path: &Path) -> bool {
        is_bookmark_file(path) && path.parent() == Some(self.files.bookmarks_dir())
    }

    /// Handles one dirty file while the remote side has changed too.
    async fn reconcile(
        &self,
        path: &Path,
        remote: &mut HashMap<String, String>,
        session: &mut dyn EditSession,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        if !self.is_tracked(path) {
            return Ok(());
        }
        let name = remote_name(path)?;
        let cached = self.state.checksum(self.account_id, path).await?;
        let local_exists = self.files.exists(path).await;

        match (local_exists, remote.get(&name).cloned()) {
            (true, Some(remote_sum)) => {
                let bytes = self.files.read(path).await?;
                let current = self.client.compute_checksum(&bytes);
                if current == remote_sum {
                    self.state
                        .set_checksum(self.account_id, path, &current)
                        .await?;
                } else if cached.as_deref() == Some(remote_sum.as_str()) {
                    // Nobody else touched it: ours wins.
                    session.put(&name, bytes, &current).await?;
                    self.state
                        .set_checksum(self.account_id, path, &current)
                        .await?;
                    remote.insert(name, current);
                    report.uploaded += 1;
                } else if cached.as_deref() == Some(current.as_str()) {
                    // Unchanged locally, only the remote copy moved on: not a
                    // conflict, the download phase fetches it.
                } else {
                    self.resolve_conflict(path).await?;
                    report.conflicts += 1;
                }
            }
            (true, None) => {
                let bytes = self.files.read(path).await?;
                let current = self.client.compute_checksum(&bytes);
                if cached.as_deref() == Some(current.as_str()) {
                    // Unchanged here and deleted remotely.
                    self.delete_local(path, report).await?;
                } else {
                    session.put(&name, bytes, &current).await?;
                    self.state
                        .set_checksum(self.account_id, path, &current)
                        .await?;
                    remote.insert(name, current);
                    report.uploaded += 1;
                }
            }
            (false, Some(remote_sum)) => {
                if cached.as_deref() == Some(remote_sum.as_str()) {
                    session.delete(&name).await?;
                    self.state.remove_checksum(self.account_id, path).await?;
                    remote.remove(&name);
                    report.deleted_remote += 1;
                }
            }
            (false, None) => {
                self.state.remove_checksum(self.account_id, path).await?;
            }
        }
        Ok(())
    }

    /// Handles one dirty file while the remote side is unchanged.
    async fn push_local(
        &self,
        path: &Path,
        session: &mut dyn EditSession,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        if !self.is_tracked(path) {
            return Ok(());
        }
        let name = remote_name(path)?;
        let cached = self.state.checksum(self.account_id, path).await?;
        if self.files.exists(path).await {
            let bytes = self.files.read(path).await?;
            let current = self.client.compute_checksum(&bytes);
            if cached.as_deref() != Some(current.as_str()) {
                session.put(&name, bytes, &current).await?;
                self.state
                    .set_checksum(self.account_id, path, &current)
                    .await?;
                report.uploaded += 1;
            }
        } else if cached.is_some() {
            session.delete(&name).await?;
            self.state.remove_checksum(self.account_id, path).await?;
            report.deleted_remote += 1;
        }
        Ok(())
    }

    /// Deletes local files that were synced before and are gone remotely.
    async fn sweep_remote_deletions(
        &self,
        cached: &HashMap<PathBuf, String>,
        remote: &HashMap<String, String>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        for path in cached.keys() {
            let Ok(name) = remote_name(path) else {
                continue;
            };
            if remote.contains_key(&name) {
                continue;
            }
            if self.queue.contains(path) {
                // Edited again during this cycle; uploaded next time.
                continue;
            }
            self.delete_local(path, report).await?;
        }
        Ok(())
    }

    async fn download_changed(
        &self,
        cached: &HashMap<PathBuf, String>,
        remote: &HashMap<String, String>,
        session: &mut dyn EditSession,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        for (name, remote_sum) in remote {
            let local = self.files.path_for(name);
            if local.parent() != Some(self.files.bookmarks_dir()) {
                tracing::warn!(name = %name, "skipping remote entry outside the bookmarks folder");
                continue;
            }
            let known = cached.get(&local);
            if known == Some(remote_sum) {
                continue;
            }

            let temp = self.files.temp_path_for(name);
            self.client.download_file(name, &temp).await?;
            let downloaded = self.client.compute_file_checksum(&temp).await?;

            // The download took a while; a fresh local edit must not be
            // overwritten.
            if self.queue.contains(&local) && self.files.exists(&local).await {
                let current = self.client.compute_file_checksum(&local).await?;
                if Some(&current) != known && current != downloaded {
                    self.resolve_conflict(&local).await?;
                    report.conflicts += 1;
                }
            }

            self.files.move_into_place(&temp, &local).await?;
            self.state
                .set_checksum(self.account_id, &local, &downloaded)
                .await?;
            self.hub.notify_others(self.account_id, &local).await;
            self.sink.reload(&local);
            if self.client.is_checksum_sentinel(remote_sum) {
                session.explicitly_set_checksum(name, &downloaded).await?;
            }
            report.downloaded += 1;
        }
        Ok(())
    }

    async fn delete_local(&self, path: &Path, report: &mut SyncReport) -> Result<(), SyncError> {
        self.files.delete(path).await?;
        self.state.remove_checksum(self.account_id, path).await?;
        self.sink.remove(path);
        self.hub.notify_others(self.account_id, path).await;
        report.deleted_local += 1;
        Ok(())
    }

    /// Keeps the local copy under a new name so the remote one can take the
    /// original name.
    async fn resolve_conflict(&self, path: &Path) -> Result<(), SyncError> {
        let renamed = self.files.add_suffix(path).await?;
        self.state.remove_checksum(self.account_id, path).await?;
        self.queue.mark(&renamed).await?;
        self.hub.notify_others(self.account_id, &renamed).await;
        self.hub.notify_others(self.account_id, path).await;
        self.sink.reload(&renamed);
        tracing::warn!(
            account_id = self.account_id,
            path = %path.display(),
            kept_as = %renamed.display(),
            "conflicting edits, kept local copy under a new name"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "syncer_tests.rs"]
mod tests;
