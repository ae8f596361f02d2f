//! Async client handle for the Stock Pit sync core.
//!
//! [`SyncClient`] is a thin handle over a background engine task that owns
//! the [`Reconciler`] and every mutation path into it: the change channel's
//! priority lanes, the poll backstop's ticks, and locally-originated writes.
//! Collection snapshots are published on [`tokio::sync::watch`] channels so
//! readers never contend with the engine.
//!
//! # Example
//!
//! ```rust,ignore
//! let store: Arc<dyn RemoteStore> = connect_store().await;
//! let source: Arc<dyn EventSource> = connect_source().await;
//!
//! let mut client = SyncClient::start(store, source, SyncConfig::new()).await?;
//!
//! let mut rooms = client.watch_rooms();
//! while rooms.changed().await.is_ok() {
//!     render(&rooms.borrow());
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::bootstrap::InitialLoad;
use crate::channel::{BackoffPolicy, ChannelManager, ChannelNotice, ChannelState};
use crate::dispatch;
use crate::error::{Result, SyncError};
use crate::model::{Room, RoomId, RoomResult, SessionId};
use crate::poll::PollBackstop;
use crate::protocol::{ChangeEvent, EntityFilter, EntityKind};
use crate::reconcile::{Effect, Reconciler};
use crate::stream::{EventSource, LocalWrite, RemoteStore, RoomStatusWrite};

/// Default cadence of the poll backstop.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default cadence of the channel health check.
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of initial-load retries before giving up.
const DEFAULT_INITIAL_LOAD_MAX_RETRIES: u32 = 3;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SyncClient`].
///
/// All fields have sensible defaults; use the builder methods to tune them.
///
/// # Example
///
/// ```
/// use stockpit_sync::client::SyncConfig;
/// use std::time::Duration;
///
/// let config = SyncConfig::new()
///     .with_poll_interval(Duration::from_secs(5))
///     .with_admin_mode(true);
/// assert!(config.admin_mode);
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cadence of the poll backstop. Defaults to **10 seconds**.
    pub poll_interval: Duration,
    /// Cadence of the channel health check. Defaults to **5 seconds**.
    pub health_check_interval: Duration,
    /// Channel reconnect backoff parameters.
    pub backoff: BackoffPolicy,
    /// Initial-load retries before [`SyncClient::start`] gives up.
    /// Defaults to **3**.
    pub initial_load_max_retries: u32,
    /// Admin surface mode: also poll and mirror the completed collection.
    pub admin_mode: bool,
    /// Timeout for the graceful shutdown. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl SyncConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            backoff: BackoffPolicy::default(),
            initial_load_max_retries: DEFAULT_INITIAL_LOAD_MAX_RETRIES,
            admin_mode: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the poll backstop cadence.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the channel health-check cadence.
    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the channel reconnect backoff parameters.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the initial-load retry budget.
    #[must_use]
    pub fn with_initial_load_max_retries(mut self, retries: u32) -> Self {
        self.initial_load_max_retries = retries;
        self
    }

    /// Enable the admin surface: mirror the completed collection too.
    #[must_use]
    pub fn with_admin_mode(mut self, admin_mode: bool) -> Self {
        self.admin_mode = admin_mode;
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Connectivity status ─────────────────────────────────────────────

/// Connectivity state published to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    /// Current channel lifecycle state.
    pub channel_state: ChannelState,
    /// Reconnect attempts since the last successful subscribe.
    pub retry_count: u32,
    /// Whether the change channel is currently subscribed.
    pub subscribed: bool,
    /// Most recent error message, cleared on recovery.
    pub last_error: Option<String>,
}

// ── Commands ────────────────────────────────────────────────────────

enum Command {
    LocalWrite(LocalWrite),
    SelectRoom(Option<RoomId>),
    Refresh,
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to a running sync engine.
///
/// Created via [`SyncClient::start`]. All methods are cheap: commands are
/// queued to the engine task over an unbounded channel and snapshot reads
/// clone out of watch channels.
pub struct SyncClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    rooms_rx: watch::Receiver<Vec<Room>>,
    completed_rx: watch::Receiver<Vec<Room>>,
    results_rx: watch::Receiver<HashMap<RoomId, Vec<RoomResult>>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    session: SessionId,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SyncClient {
    /// Perform the initial load and start the engine and channel tasks.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Unauthenticated`] when no valid session exists,
    /// or the last transient error when the initial load exhausts its retry
    /// budget. Transient failures during the bootstrap are also visible on
    /// the status watch.
    pub async fn start(
        store: Arc<dyn RemoteStore>,
        source: Arc<dyn EventSource>,
        config: SyncConfig,
    ) -> Result<Self> {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let loader = InitialLoad::new(Arc::clone(&store), config.initial_load_max_retries);
        let initial = loader.run(&status_tx).await?;
        let session = initial.session;

        let mut reconciler = Reconciler::new();
        reconciler.replace_completed(initial.completed);
        let seed_effects = reconciler.merge_poll_snapshot(initial.active);

        let (rooms_tx, rooms_rx) = watch::channel(reconciler.rooms().to_vec());
        let (completed_tx, completed_rx) = watch::channel(reconciler.completed_rooms().to_vec());
        let (results_tx, results_rx) = watch::channel(HashMap::new());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (critical_tx, critical_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (refilter_tx, refilter_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let manager = ChannelManager::new(
            source,
            config.backoff.clone(),
            base_filters(None),
            critical_tx,
            normal_tx,
            notice_tx,
            config.health_check_interval,
        );
        let channel_task = tokio::spawn(manager.run(refilter_rx));

        let engine = Engine {
            store: Arc::clone(&store),
            poll: PollBackstop::new(store, config.admin_mode),
            reconciler,
            selected_room: None,
            rooms_tx,
            completed_tx,
            results_tx,
            status_tx,
            refilter_tx,
        };
        let task = tokio::spawn(engine.run(
            cmd_rx,
            critical_rx,
            normal_rx,
            notice_rx,
            shutdown_rx,
            channel_task,
            seed_effects,
            config.poll_interval,
        ));

        Ok(Self {
            cmd_tx,
            rooms_rx,
            completed_rx,
            results_rx,
            status_rx,
            session,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    // ── Snapshot reads ──────────────────────────────────────────────

    /// The validated session id from the initial load.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Current active rooms, in insertion order.
    pub fn rooms(&self) -> Vec<Room> {
        self.rooms_rx.borrow().clone()
    }

    /// Current completed rooms.
    pub fn completed_rooms(&self) -> Vec<Room> {
        self.completed_rx.borrow().clone()
    }

    /// Ranked results for one room; empty if never loaded.
    pub fn results(&self, room_id: RoomId) -> Vec<RoomResult> {
        self.results_rx
            .borrow()
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Current connectivity status.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    // ── Watches ─────────────────────────────────────────────────────

    /// Watch the active room collection.
    pub fn watch_rooms(&self) -> watch::Receiver<Vec<Room>> {
        self.rooms_rx.clone()
    }

    /// Watch the completed room collection.
    pub fn watch_completed_rooms(&self) -> watch::Receiver<Vec<Room>> {
        self.completed_rx.clone()
    }

    /// Watch all cached result sets.
    pub fn watch_results(&self) -> watch::Receiver<HashMap<RoomId, Vec<RoomResult>>> {
        self.results_rx.clone()
    }

    /// Watch connectivity status.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Apply a locally-originated write optimistically, ahead of the
    /// corresponding change notification round-tripping back.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`] if the engine has stopped.
    pub fn notify_local_write(&self, write: LocalWrite) -> Result<()> {
        self.send(Command::LocalWrite(write))
    }

    /// Select the room whose results should be watched and mirrored, or
    /// `None` to stop watching results. Resubscribes the change channel
    /// with the new filter set.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`] if the engine has stopped.
    pub fn select_room(&self, room_id: Option<RoomId>) -> Result<()> {
        self.send(Command::SelectRoom(room_id))
    }

    /// Force an immediate poll pass, e.g. right after an external write.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`] if the engine has stopped.
    pub fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    /// Shut down the engine, stopping the channel and poll tasks.
    pub async fn shutdown(&mut self) {
        debug!("SyncClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the engine with a timeout; abort if it does not exit in
        // time so the task cannot detach and run indefinitely.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("engine loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("engine loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("engine loop aborted: {join_err}");
                    }
                }
            }
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| SyncError::NotRunning)
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("session", &self.session)
            .field("status", &*self.status_rx.borrow())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        // `Drop` is synchronous, so the only safe action is to abort the
        // engine task; the channel manager winds down when the engine's
        // refilter sender is dropped with it.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Watched filter set for the current selection.
fn base_filters(selected: Option<RoomId>) -> Vec<EntityFilter> {
    let mut filters = vec![
        EntityFilter::all(EntityKind::Rooms),
        EntityFilter::all(EntityKind::Players),
    ];
    if let Some(room_id) = selected {
        filters.push(EntityFilter::for_room(EntityKind::Results, room_id));
    }
    filters
}

/// The single consumer loop that owns the collections.
struct Engine {
    store: Arc<dyn RemoteStore>,
    poll: PollBackstop,
    reconciler: Reconciler,
    selected_room: Option<RoomId>,
    rooms_tx: watch::Sender<Vec<Room>>,
    completed_tx: watch::Sender<Vec<Room>>,
    results_tx: watch::Sender<HashMap<RoomId, Vec<RoomResult>>>,
    status_tx: watch::Sender<ConnectionStatus>,
    refilter_tx: mpsc::UnboundedSender<Vec<EntityFilter>>,
}

impl Engine {
    /// Exits when:
    /// - The shutdown signal fires
    /// - The handle is dropped (command channel closes and the task is aborted)
    #[allow(clippy::too_many_arguments)]
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut critical_rx: mpsc::UnboundedReceiver<ChangeEvent>,
        mut normal_rx: mpsc::UnboundedReceiver<ChangeEvent>,
        mut notice_rx: mpsc::UnboundedReceiver<ChannelNotice>,
        mut shutdown_rx: oneshot::Receiver<()>,
        channel_task: tokio::task::JoinHandle<()>,
        seed_effects: Vec<Effect>,
        poll_interval: Duration,
    ) {
        debug!("sync engine started");

        // The initial load may already satisfy the completion invariant
        // somewhere; honor it before the first event arrives.
        self.run_effects(seed_effects).await;
        self.publish();

        let mut poll_timer = tokio::time::interval(poll_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick; the initial load just ran.
        poll_timer.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    break;
                }

                // Rooms and players preempt everything else queued.
                Some(event) = critical_rx.recv() => self.handle_event(event).await,

                Some(notice) = notice_rx.recv() => self.handle_notice(notice),

                Some(command) = cmd_rx.recv() => self.handle_command(command).await,

                Some(event) = normal_rx.recv() => self.handle_event(event).await,

                _ = poll_timer.tick() => self.poll_pass().await,
            }
        }

        channel_task.abort();
        debug!("sync engine exited");
    }

    async fn handle_event(&mut self, event: ChangeEvent) {
        let effects = dispatch::dispatch(&mut self.reconciler, event);
        self.run_effects(effects).await;
        self.publish();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::LocalWrite(write) => {
                let effects = self.reconciler.apply_local_write(write);
                self.run_effects(effects).await;
                self.publish();
            }
            Command::SelectRoom(selected) => {
                self.selected_room = selected;
                let _ = self.refilter_tx.send(base_filters(selected));
                if let Some(room_id) = selected {
                    self.run_effects(vec![Effect::RefreshResults(room_id)]).await;
                    self.publish();
                }
            }
            Command::Refresh => self.poll_pass().await,
        }
    }

    fn handle_notice(&mut self, notice: ChannelNotice) {
        self.status_tx.send_modify(|status| {
            status.channel_state = notice.state;
            status.retry_count = notice.retries;
            status.subscribed = notice.state == ChannelState::Subscribed;
            match notice.reason {
                Some(reason) => status.last_error = Some(reason),
                None => {
                    if status.subscribed {
                        status.last_error = None;
                    }
                }
            }
        });
    }

    async fn poll_pass(&mut self) {
        let Some(outcome) = self.poll.pass().await else {
            return;
        };
        if let Some(completed) = outcome.completed {
            self.reconciler.replace_completed(completed);
        }
        let effects = self.reconciler.merge_poll_snapshot(outcome.active);
        self.run_effects(effects).await;
        self.publish();
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::RefreshCompleted => match self.store.fetch_completed_rooms().await {
                    Ok(rooms) => self.reconciler.replace_completed(rooms),
                    Err(e) => warn!(error = %e, "completed-room refresh failed"),
                },

                Effect::RefreshResults(room_id) => {
                    // Results are mirrored only for the selected room.
                    if self.selected_room != Some(room_id) {
                        continue;
                    }
                    match self.store.fetch_results(room_id).await {
                        Ok(results) => self.reconciler.replace_results(room_id, results),
                        Err(e) => warn!(%room_id, error = %e, "result refresh failed"),
                    }
                }

                Effect::WriteCompletion {
                    room_id,
                    completed_at,
                } => {
                    let write = RoomStatusWrite::completion(completed_at);
                    match self.store.write_room_status(room_id, write).await {
                        Ok(()) => queue.push_back(Effect::RefreshCompleted),
                        Err(e) => {
                            // Safe to leave: the invariant is re-evaluated
                            // from scratch on the next player-affecting merge.
                            error!(%room_id, error = %e, "completion write-back failed");
                        }
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let _ = self.rooms_tx.send_replace(self.reconciler.rooms().to_vec());
        let _ = self
            .completed_tx
            .send_replace(self.reconciler.completed_rooms().to_vec());
        let _ = self.results_tx.send_replace(self.reconciler.results_map().clone());
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
    use uuid::Uuid;

    #[test]
    fn config_defaults() {
        let config = SyncConfig::new();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert_eq!(config.initial_load_max_retries, 3);
        assert!(!config.admin_mode);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.backoff.max_retries, 5);
    }

    #[test]
    fn config_builder_methods() {
        let config = SyncConfig::new()
            .with_poll_interval(Duration::from_secs(2))
            .with_health_check_interval(Duration::from_secs(1))
            .with_initial_load_max_retries(7)
            .with_admin_mode(true)
            .with_shutdown_timeout(Duration::from_millis(250));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.health_check_interval, Duration::from_secs(1));
        assert_eq!(config.initial_load_max_retries, 7);
        assert!(config.admin_mode);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn base_filters_without_selection() {
        let filters = base_filters(None);
        assert_eq!(filters.len(), 2);
        assert!(filters.iter().all(|f| f.room_id.is_none()));
    }

    #[test]
    fn base_filters_with_selection_add_results() {
        let room_id = Uuid::new_v4();
        let filters = base_filters(Some(room_id));
        assert_eq!(filters.len(), 3);
        let results = filters
            .iter()
            .find(|f| f.entity == EntityKind::Results)
            .unwrap();
        assert_eq!(results.room_id, Some(room_id));
    }

    #[test]
    fn connection_status_default_is_idle() {
        let status = ConnectionStatus::default();
        assert_eq!(status.channel_state, ChannelState::Idle);
        assert_eq!(status.retry_count, 0);
        assert!(!status.subscribed);
        assert!(status.last_error.is_none());
    }
}
