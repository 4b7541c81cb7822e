use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a lease marker stays valid after its last write.
pub const LEASE_VALIDITY: Duration = Duration::from_secs(20);
/// Heartbeat period. Must stay below [`LEASE_VALIDITY`].
pub const LEASE_REFRESH: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unheld,
    Held,
    Renewing,
    Released,
}

/// Remaining validity of a marker of the given age, or `None` if it expired.
pub fn remaining_validity(age: Duration, validity: Duration) -> Option<Duration> {
    validity.checked_sub(age).filter(|left| !left.is_zero())
}

/// Background task rewriting the lease marker every refresh period.
pub struct Heartbeat {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    state: Arc<Mutex<LeaseState>>,
}

impl Heartbeat {
    pub fn spawn<F, Fut, E>(interval: Duration, mut touch: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let token = CancellationToken::new();
        let state = Arc::new(Mutex::new(LeaseState::Held));
        let task_token = token.clone();
        let task_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                set_state(&task_state, LeaseState::Renewing);
                match touch().await {
                    Ok(()) => tracing::debug!("lease renewed"),
                    Err(err) => tracing::warn!(error = %err, "failed to renew lease"),
                }
                set_state(&task_state, LeaseState::Held);
            }
        });
        Self {
            token,
            handle: Some(handle),
            state,
        }
    }

    pub fn state(&self) -> LeaseState {
        *self.state.lock().expect("lease state lock poisoned")
    }

    /// Cancels the heartbeat and waits until no renewal is in flight.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        set_state(&self.state, LeaseState::Released);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn set_state(state: &Mutex<LeaseState>, next: LeaseState) {
    *state.lock().expect("lease state lock poisoned") = next;
}
