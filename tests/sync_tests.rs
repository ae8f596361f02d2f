#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests for [`SyncClient`] against mock store and event source.

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    fast_config, player, player_event, result, room, room_event, wait_for, MockEventSource,
    MockStore,
};
use stockpit_sync::model::{PlayerStatus, RoomStatus};
use stockpit_sync::protocol::{ChangeEvent, EntityKind, EventKind};
use stockpit_sync::stream::{EventSource, LocalWrite, RemoteStore};
use stockpit_sync::{ChannelState, SyncClient, SyncError};

async fn start(
    store: &Arc<MockStore>,
    source: &Arc<MockEventSource>,
    config: stockpit_sync::SyncConfig,
) -> SyncClient {
    common::init_tracing();
    let store: Arc<dyn RemoteStore> = Arc::clone(store) as Arc<dyn RemoteStore>;
    let source: Arc<dyn EventSource> = Arc::clone(source) as Arc<dyn EventSource>;
    SyncClient::start(store, source, config)
        .await
        .expect("client start")
}

/// A config whose poll cadence is long enough to never fire mid-test.
fn no_poll_config() -> stockpit_sync::SyncConfig {
    fast_config().with_poll_interval(Duration::from_secs(60))
}

// ── Initial load ────────────────────────────────────────────────────

#[tokio::test]
async fn start_exposes_initial_state() {
    let store = MockStore::new();
    store.set_active(vec![
        room("alpha", RoomStatus::Open),
        room("beta", RoomStatus::InProgress),
    ]);
    store.set_completed(vec![room("done", RoomStatus::Completed)]);
    let source = MockEventSource::new();

    let client = start(&store, &source, no_poll_config()).await;

    assert_eq!(client.session(), store.session);
    assert_eq!(client.rooms().len(), 2);
    assert_eq!(client.completed_rooms().len(), 1);
    assert_eq!(client.completed_rooms()[0].name, "done");

    wait_for("channel subscribed", || client.status().subscribed).await;
    assert_eq!(client.status().channel_state, ChannelState::Subscribed);
}

#[tokio::test]
async fn initial_load_retries_transient_failure() {
    let store = MockStore::new();
    store.set_active(vec![room("alpha", RoomStatus::Open)]);
    store.fail_sessions(vec![SyncError::StoreRequest("store offline".into())]);
    let source = MockEventSource::new();

    // First attempt fails, second succeeds after the 1s backoff.
    let client = start(&store, &source, no_poll_config()).await;
    assert_eq!(client.rooms().len(), 1);
}

#[tokio::test]
async fn unauthenticated_is_fatal_and_not_retried() {
    let store = MockStore::new();
    store.fail_sessions(vec![SyncError::Unauthenticated]);
    let source = MockEventSource::new();

    let store_dyn: Arc<dyn RemoteStore> = Arc::clone(&store) as Arc<dyn RemoteStore>;
    let source_dyn: Arc<dyn EventSource> = Arc::clone(&source) as Arc<dyn EventSource>;
    let result = SyncClient::start(store_dyn, source_dyn, fast_config()).await;

    assert!(matches!(result, Err(SyncError::Unauthenticated)));
    // Never subscribed: the bootstrap failed before any channel opened.
    assert_eq!(source.subscribe_count(), 0);
    // Only one session check: fatal errors skip the retry loop entirely.
    assert_eq!(store.fetch_active_calls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn initial_load_exhausts_retry_budget() {
    let store = MockStore::new();
    store.fail_sessions(vec![SyncError::StoreRequest("still down".into())]);
    let source = MockEventSource::new();

    let store_dyn: Arc<dyn RemoteStore> = Arc::clone(&store) as Arc<dyn RemoteStore>;
    let source_dyn: Arc<dyn EventSource> = Arc::clone(&source) as Arc<dyn EventSource>;
    let config = fast_config().with_initial_load_max_retries(0);
    let result = SyncClient::start(store_dyn, source_dyn, config).await;

    assert!(matches!(result, Err(SyncError::StoreRequest(_))));
}

// ── Push channel ────────────────────────────────────────────────────

#[tokio::test]
async fn push_event_updates_room() {
    let store = MockStore::new();
    let mut alpha = room("alpha", RoomStatus::Open);
    store.set_active(vec![alpha.clone()]);
    let source = MockEventSource::new();

    let client = start(&store, &source, no_poll_config()).await;
    wait_for("channel subscribed", || client.status().subscribed).await;

    alpha.status = RoomStatus::InProgress;
    alpha.started_at = Some(Utc::now());
    source.push(room_event(EventKind::Update, &alpha));

    wait_for("room advances to in_progress", || {
        client.rooms()[0].status == RoomStatus::InProgress
    })
    .await;
    assert!(client.rooms()[0].started_at.is_some());
}

#[tokio::test]
async fn stale_push_event_does_not_regress_status() {
    let store = MockStore::new();
    let mut alpha = room("alpha", RoomStatus::InProgress);
    store.set_active(vec![alpha.clone()]);
    let source = MockEventSource::new();

    let client = start(&store, &source, no_poll_config()).await;
    wait_for("channel subscribed", || client.status().subscribed).await;

    // A reordered delivery still claiming the room is open.
    alpha.status = RoomStatus::Open;
    source.push(room_event(EventKind::Update, &alpha));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.rooms()[0].status, RoomStatus::InProgress);
}

#[tokio::test]
async fn malformed_payload_is_dropped_channel_stays_up() {
    let store = MockStore::new();
    let mut alpha = room("alpha", RoomStatus::Open);
    store.set_active(vec![alpha.clone()]);
    let source = MockEventSource::new();

    let client = start(&store, &source, no_poll_config()).await;
    wait_for("channel subscribed", || client.status().subscribed).await;

    source.push(ChangeEvent {
        entity: EntityKind::Rooms,
        kind: EventKind::Update,
        before: None,
        after: Some(serde_json::json!({ "id": "not-a-uuid", "garbage": true })),
    });
    alpha.name = "alpha renamed".into();
    source.push(room_event(EventKind::Update, &alpha));

    wait_for("good event applied after bad one", || {
        client.rooms()[0].name == "alpha renamed"
    })
    .await;
    assert!(client.status().subscribed);
    assert_eq!(source.subscribe_count(), 1);
}

#[tokio::test]
async fn completion_invariant_issues_one_conditional_write_back() {
    let store = MockStore::new();
    let mut pit = room("pit", RoomStatus::InProgress);
    let mut first = player(pit.id, PlayerStatus::InGame);
    let mut second = player(pit.id, PlayerStatus::InGame);
    pit.players = vec![first.clone(), second.clone()];
    store.set_active(vec![pit.clone()]);

    let mut done = pit.clone();
    done.status = RoomStatus::Completed;
    store.set_completed(vec![done]);

    let source = MockEventSource::new();
    let client = start(&store, &source, no_poll_config()).await;
    wait_for("channel subscribed", || client.status().subscribed).await;

    first.status = PlayerStatus::Completed;
    first.completed_at = Some(Utc::now());
    source.push(player_event(EventKind::Update, &first));

    // One player done is not enough.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.room_writes.lock().unwrap().is_empty());

    second.status = PlayerStatus::Completed;
    second.completed_at = Some(Utc::now());
    source.push(player_event(EventKind::Update, &second));

    wait_for("completion write-back recorded", || {
        !store.room_writes.lock().unwrap().is_empty()
    })
    .await;

    let writes = store.room_writes.lock().unwrap();
    assert_eq!(writes.len(), 1);
    let (room_id, write) = &writes[0];
    assert_eq!(*room_id, pit.id);
    assert_eq!(write.status, RoomStatus::Completed);
    assert!(write.unless_completed);
    assert!(write.completed_at.is_some());
    drop(writes);

    // Promoted out of active and into completed after the refresh.
    wait_for("room leaves active collection", || {
        client.rooms().iter().all(|r| r.id != pit.id)
    })
    .await;
    wait_for("room appears in completed collection", || {
        client.completed_rooms().iter().any(|r| r.id == pit.id)
    })
    .await;
}

// ── Poll backstop ───────────────────────────────────────────────────

#[tokio::test]
async fn poll_backstop_repairs_missed_update() {
    let store = MockStore::new();
    let mut alpha = room("alpha", RoomStatus::Open);
    store.set_active(vec![alpha.clone()]);
    let source = MockEventSource::new();

    let client = start(&store, &source, fast_config()).await;

    // No push event at all; only the store changes.
    alpha.status = RoomStatus::InProgress;
    store.set_active(vec![alpha]);

    wait_for("poll pass repairs missed status change", || {
        client.rooms()[0].status == RoomStatus::InProgress
    })
    .await;
    assert!(store.fetch_active_calls.load(Ordering::Relaxed) > 1);
}

#[tokio::test]
async fn poll_snapshot_does_not_regress_pushed_state() {
    let store = MockStore::new();
    let mut alpha = room("alpha", RoomStatus::Open);
    store.set_active(vec![alpha.clone()]);
    let source = MockEventSource::new();

    let client = start(&store, &source, fast_config()).await;
    wait_for("channel subscribed", || client.status().subscribed).await;

    // Push says in_progress; the store replica keeps serving open.
    alpha.status = RoomStatus::InProgress;
    source.push(room_event(EventKind::Update, &alpha));
    wait_for("pushed status applied", || {
        client.rooms()[0].status == RoomStatus::InProgress
    })
    .await;

    // Several poll passes over the stale replica must not undo it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.rooms()[0].status, RoomStatus::InProgress);
}

// ── Reconnection ────────────────────────────────────────────────────

#[tokio::test]
async fn retry_budget_exhaustion_then_health_check_recovery() {
    let store = MockStore::new();
    let mut alpha = room("alpha", RoomStatus::Open);
    store.set_active(vec![alpha.clone()]);
    let source = MockEventSource::new();
    // Initial attempt plus the whole retry budget fails.
    source.fail_subscribes(6);

    let client = start(&store, &source, fast_config()).await;

    wait_for("channel gives up", || {
        client.status().channel_state == ChannelState::Failed
    })
    .await;
    assert!(client.status().last_error.is_some());

    // Data still flows while the channel is down.
    alpha.name = "alpha while down".into();
    store.set_active(vec![alpha]);
    wait_for("poll serves data during channel outage", || {
        client.rooms()[0].name == "alpha while down"
    })
    .await;

    // The scripted failures are exhausted; the health check recovers.
    wait_for("health check restores subscription", || {
        client.status().subscribed
    })
    .await;
    assert!(source.subscribe_count() >= 7);
    assert!(client.status().last_error.is_none());

    // Every attempt carried a fresh channel identity.
    let subs = source.subscriptions.lock().unwrap();
    let ids: HashSet<_> = subs.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids.len(), subs.len());
}

#[tokio::test]
async fn server_close_triggers_resubscribe() {
    let store = MockStore::new();
    let source = MockEventSource::new();
    // First stream ends immediately, as a server-side close.
    source.script_stream(vec![None]);

    let client = start(&store, &source, no_poll_config()).await;

    wait_for("resubscribed after server close", || {
        source.subscribe_count() >= 2
    })
    .await;
    wait_for("channel subscribed again", || client.status().subscribed).await;
}

// ── Local writes ────────────────────────────────────────────────────

#[tokio::test]
async fn local_write_is_visible_before_any_round_trip() {
    let store = MockStore::new();
    let source = MockEventSource::new();
    let client = start(&store, &source, no_poll_config()).await;

    let mine = room("mine", RoomStatus::Open);
    let room_id = mine.id;
    client
        .notify_local_write(LocalWrite::RoomUpserted(mine))
        .unwrap();
    wait_for("optimistic room insert visible", || {
        client.rooms().iter().any(|r| r.id == room_id)
    })
    .await;

    let joiner = player(room_id, PlayerStatus::Joined);
    client
        .notify_local_write(LocalWrite::PlayerUpserted(joiner))
        .unwrap();
    wait_for("optimistic player join visible", || {
        client
            .rooms()
            .iter()
            .any(|r| r.id == room_id && r.players.len() == 1)
    })
    .await;

    client
        .notify_local_write(LocalWrite::RoomRemoved(room_id))
        .unwrap();
    wait_for("optimistic room delete visible", || {
        client.rooms().iter().all(|r| r.id != room_id)
    })
    .await;
}

// ── Result selection ────────────────────────────────────────────────

#[tokio::test]
async fn select_room_loads_ranked_results_and_refilters() {
    let store = MockStore::new();
    let pit = room("pit", RoomStatus::Completed);
    store.set_completed(vec![pit.clone()]);
    store.set_results(
        pit.id,
        vec![result(pit.id, 9_000.0), result(pit.id, 15_000.0)],
    );
    let source = MockEventSource::new();

    let client = start(&store, &source, no_poll_config()).await;
    wait_for("channel subscribed", || client.status().subscribed).await;

    client.select_room(Some(pit.id)).unwrap();

    wait_for("results fetched and ranked", || {
        client.results(pit.id).len() == 2
    })
    .await;
    let results = client.results(pit.id);
    assert_eq!(results[0].rank, 2);
    assert_eq!(results[1].rank, 1);
    assert!((results[1].profit_pct - 50.0).abs() < f64::EPSILON);

    // The resubscription carries a result filter for the selected room.
    wait_for("resubscribed with result filter", || {
        let subs = source.subscriptions.lock().unwrap();
        subs.last().is_some_and(|(_, filters)| {
            filters
                .iter()
                .any(|f| f.entity == EntityKind::Results && f.room_id == Some(pit.id))
        })
    })
    .await;
}

#[tokio::test]
async fn result_event_refreshes_selected_room() {
    let store = MockStore::new();
    let pit = room("pit", RoomStatus::Completed);
    store.set_completed(vec![pit.clone()]);
    store.set_results(pit.id, vec![result(pit.id, 11_000.0)]);
    let source = MockEventSource::new();

    let client = start(&store, &source, no_poll_config()).await;
    wait_for("channel subscribed", || client.status().subscribed).await;

    client.select_room(Some(pit.id)).unwrap();
    wait_for("first result load", || client.results(pit.id).len() == 1).await;

    // A new result lands remotely; the event only says "something changed".
    store.set_results(
        pit.id,
        vec![result(pit.id, 11_000.0), result(pit.id, 13_000.0)],
    );
    wait_for("resubscription settled", || {
        source.subscribe_count() >= 2
    })
    .await;
    source.push(common::result_event(pit.id));

    wait_for("result refresh after change event", || {
        client.results(pit.id).len() == 2
    })
    .await;
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_engine_and_rejects_commands() {
    let store = MockStore::new();
    let source = MockEventSource::new();
    let mut client = start(&store, &source, fast_config()).await;
    wait_for("channel subscribed", || client.status().subscribed).await;

    client.shutdown().await;

    let write = LocalWrite::RoomRemoved(uuid::Uuid::new_v4());
    assert!(matches!(
        client.notify_local_write(write),
        Err(SyncError::NotRunning)
    ));
    assert!(matches!(client.refresh(), Err(SyncError::NotRunning)));
}

#[tokio::test]
async fn refresh_forces_immediate_poll_pass() {
    let store = MockStore::new();
    let mut alpha = room("alpha", RoomStatus::Open);
    store.set_active(vec![alpha.clone()]);
    let source = MockEventSource::new();

    let client = start(&store, &source, no_poll_config()).await;
    let before = store.fetch_active_calls.load(Ordering::Relaxed);

    alpha.status = RoomStatus::Preparing;
    store.set_active(vec![alpha]);
    client.refresh().unwrap();

    wait_for("manual refresh applies store state", || {
        client.rooms()[0].status == RoomStatus::Preparing
    })
    .await;
    assert!(store.fetch_active_calls.load(Ordering::Relaxed) > before);
}
