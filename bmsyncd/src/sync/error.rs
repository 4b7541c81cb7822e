use std::time::Duration;

use bmsync_core::{DavError, DavErrorClass};
use thiserror::Error;

use super::local::LocalError;
use super::state::StateError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authorization expired, account needs to be signed in again")]
    AuthExpired,
    #[error("remote directory is locked by another device for {remaining:?}")]
    LockAlreadyHeld { remaining: Duration },
    #[error("unexpected error: {0}")]
    Unexpected(String),
    #[error("sync state error: {0}")]
    State(#[from] StateError),
    #[error("local file error: {0}")]
    Local(#[from] LocalError),
}

impl From<DavError> for SyncError {
    fn from(err: DavError) -> Self {
        match err.classification() {
            DavErrorClass::Auth => SyncError::AuthExpired,
            DavErrorClass::Network => SyncError::Network(err.to_string()),
            DavErrorClass::Unexpected => SyncError::Unexpected(err.to_string()),
        }
    }
}

impl SyncError {
    /// Contention and connectivity problems are retried without bothering the
    /// user.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::LockAlreadyHeld { .. }
        )
    }
}
