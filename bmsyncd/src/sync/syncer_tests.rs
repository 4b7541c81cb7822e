use super::*;
use crate::sync::backend::{sha1_file_hex, sha1_hex};
use crate::sync::local::FsBookmarkStore;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

const SENTINEL: &str = "unknown";

#[derive(Default)]
struct RemoteDir {
    exists: bool,
    version: u64,
    files: HashMap<String, Vec<u8>>,
    foreign: BTreeSet<String>,
    locked_for: Option<Duration>,
    fail_puts: bool,
    sessions_opened: usize,
    explicit_checksums: Vec<(String, String)>,
    /// Local edit applied while the next download is in flight.
    edit_during_download: Option<(PathBuf, String, Arc<DirtyQueue>)>,
}

impl RemoteDir {
    fn bump(&mut self) {
        self.version += 1;
    }
}

/// In-memory cloud directory shared by several simulated devices.
#[derive(Clone, Default)]
struct FakeCloud(Arc<Mutex<RemoteDir>>);

impl FakeCloud {
    fn with_directory() -> Self {
        let cloud = FakeCloud::default();
        cloud.lock().exists = true;
        cloud
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteDir> {
        self.0.lock().unwrap()
    }

    fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().files.keys().cloned().collect();
        names.sort();
        names
    }

    /// A file uploaded by a client that does not send checksums.
    fn upload_foreign(&self, name: &str, bytes: &[u8]) {
        let mut remote = self.lock();
        remote.files.insert(name.to_string(), bytes.to_vec());
        remote.foreign.insert(name.to_string());
        remote.bump();
    }
}

#[async_trait]
impl SyncClient for FakeCloud {
    async fn fetch_directory_state(&self) -> Result<Option<String>, SyncError> {
        let mut remote = self.lock();
        if !remote.exists {
            remote.exists = true;
            return Ok(None);
        }
        Ok(Some(format!("etag-{}", remote.version)))
    }

    async fn fetch_remote_checksums(&self) -> Result<HashMap<String, String>, SyncError> {
        let remote = self.lock();
        Ok(remote
            .files
            .iter()
            .map(|(name, bytes)| {
                let checksum = if remote.foreign.contains(name) {
                    SENTINEL.to_string()
                } else {
                    sha1_hex(bytes)
                };
                (name.clone(), checksum)
            })
            .collect())
    }

    fn is_checksum_sentinel(&self, checksum: &str) -> bool {
        checksum == SENTINEL
    }

    async fn download_file(&self, name: &str, destination: &Path) -> Result<(), SyncError> {
        let bytes = self
            .file(name)
            .ok_or_else(|| SyncError::Unexpected(format!("{name} not found")))?;
        let edit = self.lock().edit_during_download.take();
        if let Some((path, content, queue)) = edit {
            std::fs::write(&path, content).unwrap();
            queue.mark(&path).await.unwrap();
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(destination, bytes).unwrap();
        Ok(())
    }

    async fn open_edit_session(&self) -> Result<Box<dyn EditSession>, SyncError> {
        let mut remote = self.lock();
        if let Some(remaining) = remote.locked_for {
            return Err(SyncError::LockAlreadyHeld { remaining });
        }
        remote.sessions_opened += 1;
        Ok(Box::new(FakeSession(self.clone())))
    }

    fn compute_checksum(&self, bytes: &[u8]) -> String {
        sha1_hex(bytes)
    }

    async fn compute_file_checksum(&self, path: &Path) -> Result<String, SyncError> {
        sha1_file_hex(path).await
    }
}

struct FakeSession(FakeCloud);

#[async_trait]
impl EditSession for FakeSession {
    async fn put(&mut self, name: &str, bytes: Vec<u8>, checksum: &str) -> Result<(), SyncError> {
        let mut remote = self.0.lock();
        if remote.fail_puts {
            return Err(SyncError::Network("connection reset".into()));
        }
        assert_eq!(sha1_hex(&bytes), checksum);
        remote.files.insert(name.to_string(), bytes);
        remote.foreign.remove(name);
        remote.bump();
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> Result<(), SyncError> {
        let mut remote = self.0.lock();
        if remote.files.remove(name).is_some() {
            remote.bump();
        }
        Ok(())
    }

    async fn explicitly_set_checksum(&mut self, name: &str, checksum: &str) -> Result<(), SyncError> {
        let mut remote = self.0.lock();
        remote.foreign.remove(name);
        remote
            .explicit_checksums
            .push((name.to_string(), checksum.to_string()));
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(&'static str, PathBuf)>>,
}

impl DocumentSink for RecordingSink {
    fn reload(&self, path: &Path) {
        self.events
            .lock()
            .unwrap()
            .push(("reload", path.to_path_buf()));
    }

    fn remove(&self, path: &Path) {
        self.events
            .lock()
            .unwrap()
            .push(("remove", path.to_path_buf()));
    }
}

/// One simulated device: its own bookmarks folder, state database and hub.
struct Device {
    dir: TempDir,
    state: SyncStateStore,
    sink: Arc<RecordingSink>,
    syncer: Syncer,
}

impl Device {
    async fn new(cloud: &FakeCloud) -> Self {
        let dir = tempdir().unwrap();
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let state = SyncStateStore::from_pool(pool);
        state.init().await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let syncer = Syncer::new(
            1,
            Arc::new(cloud.clone()),
            Arc::new(FsBookmarkStore::new(dir.path())),
            state.clone(),
            Arc::new(SyncHub::new()),
            sink.clone(),
        )
        .await
        .unwrap();
        Self {
            dir,
            state,
            sink,
            syncer,
        }
    }

    /// A new engine over the same folder and state, as after a daemon restart.
    async fn restart(&mut self, cloud: &FakeCloud) {
        self.syncer = Syncer::new(
            1,
            Arc::new(cloud.clone()),
            Arc::new(FsBookmarkStore::new(self.dir.path())),
            self.state.clone(),
            Arc::new(SyncHub::new()),
            self.sink.clone(),
        )
        .await
        .unwrap();
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Writes a file the way the map app would and reports the change.
    async fn edit(&self, name: &str, content: &str) {
        std::fs::write(self.path(name), content).unwrap();
        self.syncer.mark_file_changed(&self.path(name)).await.unwrap();
    }

    async fn remove(&self, name: &str) {
        std::fs::remove_file(self.path(name)).unwrap();
        self.syncer.mark_file_changed(&self.path(name)).await.unwrap();
    }

    fn read(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.path(name)).ok()
    }

    async fn cached(&self, name: &str) -> Option<String> {
        self.state.checksum(1, &self.path(name)).await.unwrap()
    }

    async fn sync(&self) -> SyncReport {
        self.syncer.perform_sync().await.unwrap()
    }
}

fn kml(category: &str, placemark: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<kml><Document><name>{category}</name><Placemark><name>{placemark}</name></Placemark></Document></kml>\n"
    )
}

#[tokio::test]
async fn first_sync_to_missing_directory_uploads_everything() {
    let cloud = FakeCloud::default();
    let device = Device::new(&cloud).await;
    std::fs::write(device.path("a.kml"), kml("A", "one")).unwrap();
    std::fs::write(device.path("b.kml"), kml("B", "two")).unwrap();
    // Left over from an earlier sync against a directory that was deleted
    // since; must not turn into a local deletion.
    device
        .state
        .set_checksum(1, &device.path("a.kml"), &sha1_hex(kml("A", "one").as_bytes()))
        .await
        .unwrap();
    device.state.set_dirty_cache_valid(1, true).await.unwrap();

    let report = device.sync().await;

    assert_eq!(report.uploaded, 2);
    assert_eq!(report.deleted_local, 0);
    assert_eq!(cloud.names(), vec!["a.kml", "b.kml"]);
    assert!(device.read("a.kml").is_some());
    let meta = device.state.load_meta(1).await.unwrap();
    assert!(meta.dirty_cache_valid);
    assert!(meta.dir_token.is_some());
}

#[tokio::test]
async fn second_cycle_without_changes_is_a_no_op() {
    let cloud = FakeCloud::with_directory();
    let device = Device::new(&cloud).await;
    device.edit("a.kml", &kml("A", "one")).await;

    device.sync().await;
    let opened = cloud.lock().sessions_opened;
    let report = device.sync().await;

    assert!(report.is_empty());
    assert_eq!(cloud.lock().sessions_opened, opened);
}

#[tokio::test]
async fn new_remote_file_is_downloaded() {
    let cloud = FakeCloud::with_directory();
    let first = Device::new(&cloud).await;
    let second = Device::new(&cloud).await;
    first.edit("trip.kml", &kml("Trip", "hotel")).await;
    first.sync().await;

    let report = second.sync().await;

    assert_eq!(report.downloaded, 1);
    assert_eq!(second.read("trip.kml"), Some(kml("Trip", "hotel")));
    assert_eq!(
        second.cached("trip.kml").await,
        Some(sha1_hex(kml("Trip", "hotel").as_bytes()))
    );
    let events = second.sink.events.lock().unwrap().clone();
    assert_eq!(events, vec![("reload", second.path("trip.kml"))]);
}

#[tokio::test]
async fn concurrent_edits_keep_both_copies() {
    let cloud = FakeCloud::with_directory();
    let first = Device::new(&cloud).await;
    let second = Device::new(&cloud).await;
    first.edit("trip.kml", &kml("Trip", "h1")).await;
    first.sync().await;
    second.sync().await;

    second.edit("trip.kml", &kml("Trip", "h2")).await;
    first.edit("trip.kml", &kml("Trip", "h3")).await;
    first.sync().await;
    let report = second.sync().await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(second.read("trip.kml"), Some(kml("Trip", "h3")));
    assert_eq!(second.read("trip (1).kml"), Some(kml("Trip (1)", "h2")));
    assert_eq!(cloud.names(), vec!["trip (1).kml", "trip.kml"]);
    assert_eq!(
        cloud.file("trip (1).kml"),
        Some(kml("Trip (1)", "h2").into_bytes())
    );
    assert_eq!(
        second.cached("trip.kml").await,
        Some(sha1_hex(kml("Trip", "h3").as_bytes()))
    );
}

#[tokio::test]
async fn local_deletion_of_synced_file_deletes_remote() {
    let cloud = FakeCloud::with_directory();
    let device = Device::new(&cloud).await;
    device.edit("old.kml", &kml("Old", "x")).await;
    device.sync().await;

    device.remove("old.kml").await;
    let report = device.sync().await;

    assert_eq!(report.deleted_remote, 1);
    assert!(cloud.names().is_empty());
    assert_eq!(device.cached("old.kml").await, None);
}

#[tokio::test]
async fn local_deletion_is_applied_while_remote_also_changed() {
    let cloud = FakeCloud::with_directory();
    let first = Device::new(&cloud).await;
    let second = Device::new(&cloud).await;
    first.edit("old.kml", &kml("Old", "x")).await;
    first.sync().await;
    second.sync().await;

    first.edit("new.kml", &kml("New", "y")).await;
    first.sync().await;
    second.remove("old.kml").await;
    let report = second.sync().await;

    assert_eq!(report.deleted_remote, 1);
    assert_eq!(report.downloaded, 1);
    assert_eq!(cloud.names(), vec!["new.kml"]);
    assert_eq!(second.cached("old.kml").await, None);
}

#[tokio::test]
async fn remote_deletion_removes_unchanged_local_copy() {
    let cloud = FakeCloud::with_directory();
    let first = Device::new(&cloud).await;
    let second = Device::new(&cloud).await;
    first.edit("a.kml", &kml("A", "x")).await;
    first.sync().await;
    second.sync().await;

    first.remove("a.kml").await;
    first.sync().await;
    let report = second.sync().await;

    assert_eq!(report.deleted_local, 1);
    assert_eq!(second.read("a.kml"), None);
    assert_eq!(second.cached("a.kml").await, None);
    let events = second.sink.events.lock().unwrap().clone();
    assert!(events.contains(&("remove", second.path("a.kml"))));
}

#[tokio::test]
async fn remote_deletion_does_not_discard_local_edit() {
    let cloud = FakeCloud::with_directory();
    let first = Device::new(&cloud).await;
    let second = Device::new(&cloud).await;
    first.edit("a.kml", &kml("A", "x")).await;
    first.sync().await;
    second.sync().await;

    first.remove("a.kml").await;
    first.sync().await;
    second.edit("a.kml", &kml("A", "edited")).await;
    let report = second.sync().await;

    assert_eq!(report.uploaded, 1);
    assert_eq!(cloud.file("a.kml"), Some(kml("A", "edited").into_bytes()));
}

#[tokio::test]
async fn failed_upload_keeps_file_dirty() {
    let cloud = FakeCloud::with_directory();
    let device = Device::new(&cloud).await;
    device.edit("a.kml", &kml("A", "x")).await;
    cloud.lock().fail_puts = true;

    let err = device.syncer.perform_sync().await.unwrap_err();

    assert!(matches!(err, SyncError::Network(_)));
    assert!(device.syncer.queue().contains(&device.path("a.kml")));
    assert_eq!(device.state.dirty_files(1).await.unwrap().len(), 1);
    assert!(!device.state.load_meta(1).await.unwrap().dirty_cache_valid);

    cloud.lock().fail_puts = false;
    let report = device.sync().await;
    assert_eq!(report.uploaded, 1);
    assert!(device.state.dirty_files(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn held_lease_leaves_state_untouched() {
    let cloud = FakeCloud::with_directory();
    let device = Device::new(&cloud).await;
    device.edit("a.kml", &kml("A", "x")).await;
    device.state.set_dirty_cache_valid(1, true).await.unwrap();
    cloud.lock().locked_for = Some(Duration::from_millis(15_000));

    let err = device.syncer.perform_sync().await.unwrap_err();

    match err {
        SyncError::LockAlreadyHeld { remaining } => {
            assert_eq!(remaining, Duration::from_millis(15_000))
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(device.syncer.queue().len(), 1);
    assert!(device.state.load_meta(1).await.unwrap().dirty_cache_valid);
}

#[tokio::test]
async fn foreign_upload_gets_real_checksum_after_download() {
    let cloud = FakeCloud::with_directory();
    let device = Device::new(&cloud).await;
    cloud.upload_foreign("web.kml", kml("Web", "x").as_bytes());

    let report = device.sync().await;

    let expected = sha1_hex(kml("Web", "x").as_bytes());
    assert_eq!(report.downloaded, 1);
    assert_eq!(device.cached("web.kml").await, Some(expected.clone()));
    assert_eq!(
        cloud.lock().explicit_checksums,
        vec![("web.kml".to_string(), expected)]
    );
}

#[tokio::test]
async fn rescan_marks_only_files_that_differ_from_cache() {
    let cloud = FakeCloud::with_directory();
    let device = Device::new(&cloud).await;
    std::fs::write(device.path("same.kml"), "same").unwrap();
    std::fs::write(device.path("edited.kml"), "edited").unwrap();
    std::fs::write(device.path("new.kml"), "new").unwrap();
    for (name, content) in [("same.kml", "same"), ("edited.kml", "before"), ("gone.kml", "x")] {
        device
            .state
            .set_checksum(1, &device.path(name), &sha1_hex(content.as_bytes()))
            .await
            .unwrap();
    }

    device.syncer.rescan().await.unwrap();

    let dirty = device.syncer.queue().snapshot();
    assert_eq!(
        dirty,
        vec![
            device.path("edited.kml"),
            device.path("gone.kml"),
            device.path("new.kml"),
        ]
    );
}

#[tokio::test]
async fn cross_account_changes_are_propagated() {
    let cloud_a = FakeCloud::with_directory();
    let cloud_b = FakeCloud::with_directory();
    let dir = tempdir().unwrap();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let state = SyncStateStore::from_pool(pool);
    state.init().await.unwrap();
    let hub = Arc::new(SyncHub::new());
    let files: Arc<dyn BookmarkStore> = Arc::new(FsBookmarkStore::new(dir.path()));
    let sink = Arc::new(RecordingSink::default());
    let account_a = Syncer::new(
        1,
        Arc::new(cloud_a.clone()),
        Arc::clone(&files),
        state.clone(),
        Arc::clone(&hub),
        sink.clone(),
    )
    .await
    .unwrap();
    let account_b = Syncer::new(
        2,
        Arc::new(cloud_b.clone()),
        Arc::clone(&files),
        state.clone(),
        Arc::clone(&hub),
        sink,
    )
    .await
    .unwrap();
    account_a.rescan().await.unwrap();
    account_b.rescan().await.unwrap();

    let other = Device::new(&cloud_a).await;
    other.edit("shared.kml", &kml("Shared", "x")).await;
    other.sync().await;

    account_a.perform_sync().await.unwrap();
    assert!(account_b.queue().contains(&dir.path().join("shared.kml")));

    account_b.perform_sync().await.unwrap();
    assert_eq!(
        cloud_b.file("shared.kml"),
        Some(kml("Shared", "x").into_bytes())
    );
}

#[tokio::test]
async fn edit_made_while_stopped_is_not_overwritten() {
    let cloud = FakeCloud::with_directory();
    let first = Device::new(&cloud).await;
    let mut second = Device::new(&cloud).await;
    first.edit("trip.kml", &kml("Trip", "h1")).await;
    first.sync().await;
    second.sync().await;

    // Nobody is watching the folder while the engine is down.
    std::fs::write(second.path("trip.kml"), kml("Trip", "h2")).unwrap();
    second.restart(&cloud).await;
    first.edit("trip.kml", &kml("Trip", "h3")).await;
    first.sync().await;
    let report = second.sync().await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(second.read("trip.kml"), Some(kml("Trip", "h3")));
    assert_eq!(second.read("trip (1).kml"), Some(kml("Trip (1)", "h2")));
    assert_eq!(
        cloud.file("trip (1).kml"),
        Some(kml("Trip (1)", "h2").into_bytes())
    );
}

#[tokio::test]
async fn remote_names_outside_the_folder_are_skipped() {
    let cloud = FakeCloud::with_directory();
    let device = Device::new(&cloud).await;
    {
        let mut remote = cloud.lock();
        remote
            .files
            .insert("../escaped.kml".to_string(), kml("X", "x").into_bytes());
        remote
            .files
            .insert("sub/nested.kml".to_string(), kml("Y", "y").into_bytes());
        remote.bump();
    }

    let report = device.sync().await;

    assert_eq!(report.downloaded, 0);
    let outside = device.dir.path().parent().unwrap().join("escaped.kml");
    assert!(!outside.exists());
    assert!(!device.path("sub").exists());
}

#[tokio::test]
async fn edit_during_download_is_kept_as_conflict_copy() {
    let cloud = FakeCloud::with_directory();
    let first = Device::new(&cloud).await;
    let second = Device::new(&cloud).await;
    first.edit("trip.kml", &kml("Trip", "h1")).await;
    first.sync().await;
    second.sync().await;

    first.edit("trip.kml", &kml("Trip", "h3")).await;
    first.sync().await;
    cloud.lock().edit_during_download = Some((
        second.path("trip.kml"),
        kml("Trip", "h2"),
        Arc::clone(second.syncer.queue()),
    ));
    let report = second.sync().await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.downloaded, 1);
    assert_eq!(second.read("trip.kml"), Some(kml("Trip", "h3")));
    assert_eq!(second.read("trip (1).kml"), Some(kml("Trip (1)", "h2")));
    assert_eq!(
        second.cached("trip.kml").await,
        Some(sha1_hex(kml("Trip", "h3").as_bytes()))
    );

    second.sync().await;
    assert_eq!(
        cloud.file("trip (1).kml"),
        Some(kml("Trip (1)", "h2").into_bytes())
    );
    assert_eq!(cloud.file("trip.kml"), Some(kml("Trip", "h3").into_bytes()));
}

#[tokio::test]
async fn touched_but_unchanged_file_takes_remote_update() {
    let cloud = FakeCloud::with_directory();
    let first = Device::new(&cloud).await;
    let second = Device::new(&cloud).await;
    first.edit("trip.kml", &kml("Trip", "h1")).await;
    first.sync().await;
    second.sync().await;

    first.edit("trip.kml", &kml("Trip", "h3")).await;
    first.sync().await;
    // Saved again by the app without any change.
    second.edit("trip.kml", &kml("Trip", "h1")).await;
    let report = second.sync().await;

    assert_eq!(report.conflicts, 0);
    assert_eq!(report.downloaded, 1);
    assert_eq!(second.read("trip.kml"), Some(kml("Trip", "h3")));
    assert_eq!(second.read("trip (1).kml"), None);
}
