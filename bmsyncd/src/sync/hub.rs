use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::dirty::DirtyQueue;

/// Shared between the engines of all enabled accounts: routes local file
/// changes to every account's dirty queue.
#[derive(Default)]
pub struct SyncHub {
    queues: RwLock<HashMap<u64, Arc<DirtyQueue>>>,
}

impl SyncHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, account_id: u64, queue: Arc<DirtyQueue>) {
        self.queues.write().await.insert(account_id, queue);
    }

    pub async fn unregister(&self, account_id: u64) -> Option<Arc<DirtyQueue>> {
        self.queues.write().await.remove(&account_id)
    }

    pub async fn accounts(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.queues.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// A bookmark file changed locally: every account has to look at it.
    pub async fn on_file_changed(&self, path: &Path) {
        self.mark_where(path, |_| true).await;
    }

    /// The engine of `account_id` changed `path` on disk; the others have to
    /// look at it.
    pub async fn notify_others(&self, account_id: u64, path: &Path) {
        self.mark_where(path, |id| id != account_id).await;
    }

    async fn mark_where(&self, path: &Path, include: impl Fn(u64) -> bool) {
        let targets: Vec<(u64, Arc<DirtyQueue>)> = self
            .queues
            .read()
            .await
            .iter()
            .filter(|(id, _)| include(**id))
            .map(|(id, queue)| (*id, Arc::clone(queue)))
            .collect();
        for (id, queue) in targets {
            // A lost mark is repaired by the next full rescan.
            if let Err(err) = queue.mark(path).await {
                tracing::warn!(
                    account_id = id,
                    path = %path.display(),
                    error = %err,
                    "failed to persist dirty mark"
                );
            }
        }
    }
}
