use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::error::SyncError;
use super::syncer::{SyncReport, Syncer};
use crate::accounts::AccountRegistry;
use crate::db::unix_millis_now;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Runs one sync loop per account. Cycles of one account never overlap;
/// different accounts run concurrently.
pub struct Scheduler {
    interval: Duration,
    registry: AccountRegistry,
    cancel: CancellationToken,
    tasks: Vec<(u64, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new(interval: Duration, registry: AccountRegistry) -> Self {
        Self {
            interval,
            registry,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn spawn_account(&mut self, syncer: Arc<Syncer>) {
        let account_id = syncer.account_id();
        let interval = self.interval;
        let registry = self.registry.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let mut backoff = Backoff::new(interval, MAX_RETRY_DELAY.max(interval), true);
            loop {
                let outcome = syncer.perform_sync().await;
                let delay = next_delay(account_id, interval, &mut backoff, outcome, &registry).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tracing::debug!(account_id, "sync loop stopped");
        });
        self.tasks.push((account_id, handle));
    }

    pub fn accounts(&self) -> Vec<u64> {
        self.tasks.iter().map(|(id, _)| *id).collect()
    }

    /// Lets running cycles finish, then stops every loop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (account_id, handle) in self.tasks {
            if let Err(err) = handle.await {
                tracing::warn!(account_id, error = %err, "sync loop panicked");
            }
        }
    }
}

async fn next_delay(
    account_id: u64,
    interval: Duration,
    backoff: &mut Backoff,
    outcome: Result<SyncReport, SyncError>,
    registry: &AccountRegistry,
) -> Duration {
    match outcome {
        Ok(report) => {
            backoff.on_success();
            if !report.is_empty() {
                tracing::debug!(account_id, ?report, "sync cycle applied changes");
            }
            if let Err(err) = registry.set_last_synced(account_id, unix_millis_now()).await {
                tracing::warn!(account_id, error = %err, "failed to record sync time");
            }
            interval
        }
        Err(SyncError::LockAlreadyHeld { remaining }) => {
            tracing::debug!(account_id, ?remaining, "remote directory busy");
            remaining.max(interval)
        }
        Err(err) => {
            let retry = backoff.on_failure().max(interval);
            if err.is_transient() {
                tracing::warn!(account_id, error = %err, ?retry, "sync cycle failed");
            } else {
                tracing::error!(account_id, error = %err, ?retry, "sync cycle failed");
            }
            retry
        }
    }
}
