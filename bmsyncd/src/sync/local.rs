use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub const KML_EXTENSION: &str = "kml";
const TEMP_DIR_NAME: &str = ".bmsync-tmp";

#[derive(Debug, Error)]
pub enum LocalError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no free conflict name for {0}")]
    NoFreeName(PathBuf),
    #[error("not a bookmark file: {0}")]
    NotABookmark(PathBuf),
}

impl LocalError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        LocalError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn is_bookmark_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(KML_EXTENSION))
}

/// Remote name of a local bookmark file: its file name.
pub fn remote_name(path: &Path) -> Result<String, LocalError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| LocalError::NotABookmark(path.to_path_buf()))
}

/// The local bookmark folder as seen by the sync engine. The engine touches
/// local files only through this trait.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    fn bookmarks_dir(&self) -> &Path;

    fn path_for(&self, remote_name: &str) -> PathBuf {
        self.bookmarks_dir().join(remote_name)
    }

    /// Staging location for a download of `remote_name`, on the same
    /// filesystem as the bookmarks folder.
    fn temp_path_for(&self, remote_name: &str) -> PathBuf {
        self.bookmarks_dir().join(TEMP_DIR_NAME).join(remote_name)
    }

    async fn list_files(&self) -> Result<Vec<PathBuf>, LocalError>;

    async fn exists(&self, path: &Path) -> bool;

    async fn read(&self, path: &Path) -> Result<Vec<u8>, LocalError>;

    /// Deleting a missing file succeeds.
    async fn delete(&self, path: &Path) -> Result<(), LocalError>;

    /// Atomically replaces `to` with `from`.
    async fn move_into_place(&self, from: &Path, to: &Path) -> Result<(), LocalError>;

    /// Renames the file and the category inside it to the first free
    /// `name (n)` variant. Returns the new path.
    async fn add_suffix(&self, path: &Path) -> Result<PathBuf, LocalError>;
}

/// Gets told about documents changed underneath the application.
pub trait DocumentSink: Send + Sync {
    fn reload(&self, path: &Path);
    fn remove(&self, path: &Path);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDocumentSink;

impl DocumentSink for LoggingDocumentSink {
    fn reload(&self, path: &Path) {
        tracing::info!(path = %path.display(), "bookmark file updated from cloud");
    }

    fn remove(&self, path: &Path) {
        tracing::info!(path = %path.display(), "bookmark file removed by cloud");
    }
}

#[derive(Debug, Clone)]
pub struct FsBookmarkStore {
    root: PathBuf,
}

impl FsBookmarkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BookmarkStore for FsBookmarkStore {
    fn bookmarks_dir(&self) -> &Path {
        &self.root
    }

    async fn list_files(&self) -> Result<Vec<PathBuf>, LocalError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| LocalError::io(&self.root, err))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| LocalError::io(&self.root, err))?
        {
            let path = entry.path();
            let is_file = entry
                .file_type()
                .await
                .map(|kind| kind.is_file())
                .unwrap_or(false);
            if is_file && is_bookmark_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, LocalError> {
        tokio::fs::read(path)
            .await
            .map_err(|err| LocalError::io(path, err))
    }

    async fn delete(&self, path: &Path) -> Result<(), LocalError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LocalError::io(path, err)),
        }
    }

    async fn move_into_place(&self, from: &Path, to: &Path) -> Result<(), LocalError> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| LocalError::io(parent, err))?;
        }
        tokio::fs::rename(from, to)
            .await
            .map_err(|err| LocalError::io(to, err))
    }

    async fn add_suffix(&self, path: &Path) -> Result<PathBuf, LocalError> {
        let (target, suffix) = self.free_suffixed_path(path).await?;
        let content = self.read(path).await?;
        let renamed = match std::str::from_utf8(&content) {
            Ok(text) => rename_category(text, suffix).into_bytes(),
            Err(_) => content,
        };
        tokio::fs::write(&target, renamed)
            .await
            .map_err(|err| LocalError::io(&target, err))?;
        self.delete(path).await?;
        tracing::info!(
            from = %path.display(),
            to = %target.display(),
            "renamed conflicting bookmark file"
        );
        Ok(target)
    }
}

impl FsBookmarkStore {
    async fn free_suffixed_path(&self, path: &Path) -> Result<(PathBuf, u32), LocalError> {
        for n in 1..=u16::MAX as u32 {
            let candidate = suffixed_path(path, n);
            if !self.exists(&candidate).await {
                return Ok((candidate, n));
            }
        }
        Err(LocalError::NoFreeName(path.to_path_buf()))
    }
}

/// `dir/stem.ext` → `dir/stem (n).ext`
pub fn suffixed_path(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    path.with_file_name(name)
}

/// Appends ` (n)` to the category name: the first `<name>` element after the
/// opening `<Document` tag. Text without one is returned unchanged.
pub fn rename_category(kml: &str, n: u32) -> String {
    let Some(document) = kml.find("<Document") else {
        return kml.to_string();
    };
    let Some(open) = kml[document..].find("<name>").map(|at| document + at) else {
        return kml.to_string();
    };
    let value_start = open + "<name>".len();
    let Some(close) = kml[value_start..].find("</name>").map(|at| value_start + at) else {
        return kml.to_string();
    };
    let mut out = String::with_capacity(kml.len() + 8);
    out.push_str(&kml[..close]);
    out.push_str(&format!(" ({n})"));
    out.push_str(&kml[close..]);
    out
}
