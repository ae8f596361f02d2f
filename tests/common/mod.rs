#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Stock Pit Sync integration tests.
//!
//! Provides a channel-based [`MockStore`] / [`MockEventSource`] pair plus
//! helpers for constructing domain records and change events.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use stockpit_sync::model::{Player, PlayerId, PlayerStatus, Room, RoomId, RoomResult, RoomStatus};
use stockpit_sync::protocol::{ChangeEvent, ChannelId, EntityFilter, EntityKind, EventKind};
use stockpit_sync::stream::{
    ChangeStream, EventSource, PlayerStatusWrite, RemoteStore, RoomStatusWrite,
};
use stockpit_sync::{BackoffPolicy, SyncConfig, SyncError};

// ── MockStore ───────────────────────────────────────────────────────

/// Mutable backing data behind a [`MockStore`].
#[derive(Default)]
pub struct StoreData {
    pub active: Vec<Room>,
    pub completed: Vec<Room>,
    pub results: HashMap<RoomId, Vec<RoomResult>>,
}

/// A scriptable in-memory [`RemoteStore`].
///
/// Failures are scripted as queues consumed one per call; once a queue is
/// empty the call succeeds against [`StoreData`]. All write-backs are
/// recorded for inspection.
pub struct MockStore {
    pub session: Uuid,
    pub data: Arc<StdMutex<StoreData>>,
    /// Errors returned by the next `check_session` calls, in order.
    pub session_failures: StdMutex<VecDeque<SyncError>>,
    /// Recorded `write_room_status` calls.
    pub room_writes: Arc<StdMutex<Vec<(RoomId, RoomStatusWrite)>>>,
    /// Recorded `write_player_status` calls.
    pub player_writes: Arc<StdMutex<Vec<(PlayerId, PlayerStatusWrite)>>>,
    pub fetch_active_calls: AtomicU32,
    pub fetch_completed_calls: AtomicU32,
    pub fetch_results_calls: AtomicU32,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: Uuid::new_v4(),
            data: Arc::new(StdMutex::new(StoreData::default())),
            session_failures: StdMutex::new(VecDeque::new()),
            room_writes: Arc::new(StdMutex::new(Vec::new())),
            player_writes: Arc::new(StdMutex::new(Vec::new())),
            fetch_active_calls: AtomicU32::new(0),
            fetch_completed_calls: AtomicU32::new(0),
            fetch_results_calls: AtomicU32::new(0),
        })
    }

    /// Queue errors for the next `check_session` calls.
    pub fn fail_sessions(&self, failures: Vec<SyncError>) {
        self.session_failures.lock().unwrap().extend(failures);
    }

    pub fn set_active(&self, rooms: Vec<Room>) {
        self.data.lock().unwrap().active = rooms;
    }

    pub fn set_completed(&self, rooms: Vec<Room>) {
        self.data.lock().unwrap().completed = rooms;
    }

    pub fn set_results(&self, room_id: RoomId, results: Vec<RoomResult>) {
        self.data.lock().unwrap().results.insert(room_id, results);
    }
}

#[async_trait]
impl RemoteStore for MockStore {
    async fn check_session(&self) -> Result<Uuid, SyncError> {
        if let Some(err) = self.session_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.session)
    }

    async fn fetch_active_rooms(&self) -> Result<Vec<Room>, SyncError> {
        self.fetch_active_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.lock().unwrap().active.clone())
    }

    async fn fetch_completed_rooms(&self) -> Result<Vec<Room>, SyncError> {
        self.fetch_completed_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.lock().unwrap().completed.clone())
    }

    async fn fetch_results(&self, room_id: RoomId) -> Result<Vec<RoomResult>, SyncError> {
        self.fetch_results_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .data
            .lock()
            .unwrap()
            .results
            .get(&room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_room_status(
        &self,
        room_id: RoomId,
        write: RoomStatusWrite,
    ) -> Result<(), SyncError> {
        self.room_writes.lock().unwrap().push((room_id, write));
        Ok(())
    }

    async fn write_player_status(
        &self,
        player_id: PlayerId,
        write: PlayerStatusWrite,
    ) -> Result<(), SyncError> {
        self.player_writes.lock().unwrap().push((player_id, write));
        Ok(())
    }
}

// ── MockEventSource ─────────────────────────────────────────────────

/// A channel-based mock change stream.
///
/// Scripted items are consumed first; `None` ends the stream (server-side
/// close). After the script the stream reads from a live channel, so tests
/// can push events while the client runs. Opening a newer subscription
/// drops the previous live sender, which closes the older stream.
pub struct MockChangeStream {
    script: VecDeque<Option<Result<ChangeEvent, SyncError>>>,
    live: mpsc::UnboundedReceiver<ChangeEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ChangeStream for MockChangeStream {
    async fn recv(&mut self) -> Option<Result<ChangeEvent, SyncError>> {
        if let Some(item) = self.script.pop_front() {
            item
        } else {
            self.live.recv().await.map(Ok)
        }
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// A scriptable [`EventSource`].
///
/// Each `subscribe` call pops one script entry: `Err` fails the attempt,
/// `Ok(items)` preloads the returned stream. Once the scripts run out every
/// subscribe succeeds with an empty preload.
pub struct MockEventSource {
    #[allow(clippy::type_complexity)]
    scripts: StdMutex<VecDeque<Result<Vec<Option<Result<ChangeEvent, SyncError>>>, SyncError>>>,
    /// Sender feeding the most recently opened stream.
    push_tx: StdMutex<Option<mpsc::UnboundedSender<ChangeEvent>>>,
    /// One entry per `subscribe` call: channel id and filter set.
    pub subscriptions: Arc<StdMutex<Vec<(ChannelId, Vec<EntityFilter>)>>>,
}

impl MockEventSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(VecDeque::new()),
            push_tx: StdMutex::new(None),
            subscriptions: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    /// Fail the next `count` subscribe attempts.
    pub fn fail_subscribes(&self, count: usize) {
        let mut scripts = self.scripts.lock().unwrap();
        for _ in 0..count {
            scripts.push_back(Err(SyncError::ChannelSubscribe("scripted failure".into())));
        }
    }

    /// Preload the next opened stream with scripted items.
    pub fn script_stream(&self, items: Vec<Option<Result<ChangeEvent, SyncError>>>) {
        self.scripts.lock().unwrap().push_back(Ok(items));
    }

    /// Push a live event into the most recently opened stream.
    pub fn push(&self, event: ChangeEvent) {
        let tx = self.push_tx.lock().unwrap();
        let sender = tx.as_ref().expect("no open subscription to push into");
        sender.send(event).expect("open stream dropped its receiver");
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn subscribe(
        &self,
        channel: ChannelId,
        filters: Vec<EntityFilter>,
    ) -> Result<Box<dyn ChangeStream>, SyncError> {
        self.subscriptions.lock().unwrap().push((channel, filters));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.push_tx.lock().unwrap() = Some(tx);

        Ok(Box::new(MockChangeStream {
            script: VecDeque::from(script),
            live: rx,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

// ── Record builders ─────────────────────────────────────────────────

pub fn room(name: &str, status: RoomStatus) -> Room {
    Room {
        id: Uuid::new_v4(),
        name: name.into(),
        status,
        min_players: 1,
        max_players: 4,
        all_players_completed: false,
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
        completed_at: None,
        players: Vec::new(),
    }
}

pub fn player(room_id: RoomId, status: PlayerStatus) -> Player {
    Player {
        id: Uuid::new_v4(),
        room_id,
        user_id: Uuid::new_v4(),
        status,
        session_id: None,
        completed_at: None,
    }
}

pub fn result(room_id: RoomId, balance: f64) -> RoomResult {
    RoomResult {
        id: Uuid::new_v4(),
        room_id,
        session_id: None,
        final_balance: balance,
        rank: 0,
        profit_pct: 0.0,
    }
}

// ── Event builders ──────────────────────────────────────────────────

pub fn room_event(kind: EventKind, room: &Room) -> ChangeEvent {
    ChangeEvent {
        entity: EntityKind::Rooms,
        kind,
        before: None,
        after: Some(serde_json::to_value(room).expect("room serialization")),
    }
}

pub fn room_delete_event(room_id: RoomId) -> ChangeEvent {
    ChangeEvent {
        entity: EntityKind::Rooms,
        kind: EventKind::Delete,
        before: Some(serde_json::json!({ "id": room_id })),
        after: None,
    }
}

pub fn player_event(kind: EventKind, player: &Player) -> ChangeEvent {
    ChangeEvent {
        entity: EntityKind::Players,
        kind,
        before: None,
        after: Some(serde_json::to_value(player).expect("player serialization")),
    }
}

pub fn result_event(room_id: RoomId) -> ChangeEvent {
    ChangeEvent {
        entity: EntityKind::Results,
        kind: EventKind::Insert,
        before: None,
        after: Some(serde_json::to_value(result(room_id, 11_000.0)).expect("result serialization")),
    }
}

// ── Timing helpers ──────────────────────────────────────────────────

/// Install a test tracing subscriber; later calls are no-ops.
///
/// Run with `RUST_LOG=stockpit_sync=debug` to see engine and channel
/// activity interleaved with test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A configuration with intervals short enough for integration tests.
pub fn fast_config() -> SyncConfig {
    SyncConfig::new()
        .with_poll_interval(Duration::from_millis(50))
        .with_health_check_interval(Duration::from_millis(100))
        .with_backoff(BackoffPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            max_retries: 5,
        })
}

/// Poll `condition` every 10ms until it holds, failing after 3 seconds.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
