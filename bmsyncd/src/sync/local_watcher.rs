use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::hub::SyncHub;
use super::local::is_bookmark_file;

/// Watches the bookmarks folder (not its subdirectories) and reports every
/// bookmark file that was created, written, renamed or removed.
pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for path in map_event(&watch_root, event) {
                let _ = tx.send(path);
            }
        }
        Err(err) => tracing::warn!(error = %err, "file watcher error"),
    })?;
    watcher.watch(root, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

/// Feeds watcher output into every account's dirty queue until the channel
/// closes.
pub fn forward_to_hub(mut rx: mpsc::UnboundedReceiver<PathBuf>, hub: Arc<SyncHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(path) = rx.recv().await {
            tracing::debug!(path = %path.display(), "local bookmark change");
            hub.on_file_changed(&path).await;
        }
    })
}

fn map_event(root: &Path, event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter(|path| is_watched(root, path))
            .collect(),
        _ => Vec::new(),
    }
}

fn is_watched(root: &Path, path: &Path) -> bool {
    path.parent() == Some(root) && is_bookmark_file(path)
}
