//! Initial-Load Retry Controller.
//!
//! Performs the first full load on session start — session check, active
//! rooms, completed rooms — and retries with exponential backoff
//! (`1000 · 2^retry` ms, capped at 10 seconds). Unlike the poll backstop,
//! failures here are surfaced: each one is published on the status watch as
//! a visible error until retries succeed or exhaust, and success clears it.
//! A missing session is fatal and propagated immediately, never retried.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::ConnectionStatus;
use crate::error::{Result, SyncError};
use crate::model::{Room, SessionId};
use crate::stream::RemoteStore;

const INITIAL_LOAD_BASE_MS: u64 = 1_000;
const INITIAL_LOAD_CAP_MS: u64 = 10_000;

/// Delay before initial-load retry number `retry` (zero-based).
pub fn initial_load_delay(retry: u32) -> Duration {
    let factor = 1u64 << retry.min(10);
    Duration::from_millis((INITIAL_LOAD_BASE_MS.saturating_mul(factor)).min(INITIAL_LOAD_CAP_MS))
}

/// Everything the engine needs to start reconciling.
#[derive(Debug)]
pub struct InitialState {
    pub session: SessionId,
    pub active: Vec<Room>,
    pub completed: Vec<Room>,
}

/// Bootstraps state on session start, retrying transient failures.
pub struct InitialLoad {
    store: Arc<dyn RemoteStore>,
    max_retries: u32,
}

impl InitialLoad {
    pub fn new(store: Arc<dyn RemoteStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Run the first full load.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Unauthenticated`] without retrying when the
    /// session check fails, or the last transient error once the retry
    /// budget is exhausted.
    pub async fn run(&self, status_tx: &watch::Sender<ConnectionStatus>) -> Result<InitialState> {
        let mut retry = 0u32;
        loop {
            match self.attempt().await {
                Ok(state) => {
                    status_tx.send_modify(|s| s.last_error = None);
                    debug!(
                        active = state.active.len(),
                        completed = state.completed.len(),
                        "initial load complete"
                    );
                    return Ok(state);
                }
                Err(SyncError::Unauthenticated) => return Err(SyncError::Unauthenticated),
                Err(e) => {
                    status_tx.send_modify(|s| s.last_error = Some(e.to_string()));
                    if retry >= self.max_retries {
                        return Err(e);
                    }
                    let delay = initial_load_delay(retry);
                    warn!(
                        error = %e,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "initial load failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    async fn attempt(&self) -> Result<InitialState> {
        let session = self.store.check_session().await?;
        let active = self.store.fetch_active_rooms().await?;
        let completed = self.store.fetch_completed_rooms().await?;
        Ok(InitialState {
            session,
            active,
            completed,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps_at_ten_seconds() {
        assert_eq!(initial_load_delay(0), Duration::from_millis(1_000));
        assert_eq!(initial_load_delay(1), Duration::from_millis(2_000));
        assert_eq!(initial_load_delay(2), Duration::from_millis(4_000));
        assert_eq!(initial_load_delay(3), Duration::from_millis(8_000));
        assert_eq!(initial_load_delay(4), Duration::from_millis(10_000));
        assert_eq!(initial_load_delay(30), Duration::from_millis(10_000));
    }
}
