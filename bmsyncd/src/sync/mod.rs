pub mod backend;
pub mod backoff;
pub mod dirty;
pub mod error;
pub mod hub;
pub mod lease;
pub mod local;
pub mod local_watcher;
pub mod scheduler;
pub mod state;
pub mod syncer;
pub mod webdav;

pub use error::SyncError;
pub use syncer::{SyncReport, Syncer};
