//! Periodic Poll Backstop.
//!
//! A fixed-cadence full re-fetch of the watched collections, independent of
//! channel health. It repairs missed push events and bounds UI staleness to
//! the poll interval even during total channel failure. Transient fetch
//! errors are logged and swallowed; persistent failure is only ever
//! escalated through the initial-load path, never from here.

use std::sync::Arc;

use tracing::warn;

use crate::model::Room;
use crate::stream::RemoteStore;

/// Result of one successful poll pass.
#[derive(Debug)]
pub struct PollOutcome {
    pub active: Vec<Room>,
    /// Present only when the completed collection is being watched
    /// (admin mode).
    pub completed: Option<Vec<Room>>,
}

/// Best-effort background refresher over the remote store.
pub struct PollBackstop {
    store: Arc<dyn RemoteStore>,
    include_completed: bool,
}

impl PollBackstop {
    pub fn new(store: Arc<dyn RemoteStore>, include_completed: bool) -> Self {
        Self {
            store,
            include_completed,
        }
    }

    /// Run one poll pass. Returns `None` on any fetch error, which is
    /// logged and otherwise ignored — the next tick tries again.
    pub async fn pass(&self) -> Option<PollOutcome> {
        let active = match self.store.fetch_active_rooms().await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(error = %e, "poll backstop: active-room fetch failed");
                return None;
            }
        };

        let completed = if self.include_completed {
            match self.store.fetch_completed_rooms().await {
                Ok(rooms) => Some(rooms),
                Err(e) => {
                    warn!(error = %e, "poll backstop: completed-room fetch failed");
                    None
                }
            }
        } else {
            None
        };

        Some(PollOutcome { active, completed })
    }
}
