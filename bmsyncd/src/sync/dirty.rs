use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::state::{StateError, SyncStateStore};

/// Work queue of locally changed files for one account.
///
/// Producers (watcher, sibling accounts) call [`DirtyQueue::mark`] at any
/// time; the single draining sync cycle takes paths with
/// [`DirtyQueue::claim_next`]. A claimed path only leaves the persisted set
/// once it is acked, so a crash mid-cycle never loses it.
pub struct DirtyQueue {
    account_id: u64,
    store: SyncStateStore,
    pending: Mutex<BTreeSet<PathBuf>>,
    // Orders persisted inserts against ack deletes.
    persist: tokio::sync::Mutex<()>,
}

impl DirtyQueue {
    pub async fn load(account_id: u64, store: SyncStateStore) -> Result<Self, StateError> {
        let pending = store.dirty_files(account_id).await?;
        Ok(Self {
            account_id,
            store,
            pending: Mutex::new(pending),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    fn pending(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.pending.lock().expect("dirty set lock poisoned")
    }

    pub async fn mark(&self, path: &Path) -> Result<(), StateError> {
        self.mark_many([path]).await
    }

    pub async fn mark_many<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a Path>,
    ) -> Result<(), StateError> {
        let added: Vec<&Path> = {
            let mut pending = self.pending();
            paths
                .into_iter()
                .filter(|path| pending.insert(path.to_path_buf()))
                .collect()
        };
        if added.is_empty() {
            return Ok(());
        }
        let _guard = self.persist.lock().await;
        self.store.add_dirty(self.account_id, added).await
    }

    /// Drops every pending path, in memory and on disk.
    pub async fn clear(&self) -> Result<(), StateError> {
        let _guard = self.persist.lock().await;
        self.pending().clear();
        self.store.clear_dirty(self.account_id).await
    }

    pub fn claim_next(&self) -> Option<Claim<'_>> {
        let path = self.pending().pop_first()?;
        Some(Claim {
            queue: self,
            path,
            resolved: false,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.pending().contains(path)
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.pending().iter().cloned().collect()
    }
}

/// A path taken off the queue. Resolve it with [`Claim::ack`] after the file
/// was handled, or [`Claim::requeue`] on failure. Dropping an unresolved claim
/// puts the path back.
pub struct Claim<'a> {
    queue: &'a DirtyQueue,
    path: PathBuf,
    resolved: bool,
}

impl Claim<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ack(mut self) -> Result<(), StateError> {
        self.resolved = true;
        let queue = self.queue;
        let _guard = queue.persist.lock().await;
        // Marked again while in flight: keep the persisted row.
        if queue.pending().contains(&self.path) {
            return Ok(());
        }
        queue.store.remove_dirty(queue.account_id, &self.path).await
    }

    pub fn requeue(mut self) {
        self.resolved = true;
        self.queue.pending().insert(self.path.clone());
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(
                account_id = self.queue.account_id,
                path = %self.path.display(),
                "dirty file claim abandoned, returning it to the queue"
            );
            self.queue.pending().insert(self.path.clone());
        }
    }
}
