//! Local State Reconciler.
//!
//! The one place that mutates the mirrored collections. Every update source
//! — push events, poll snapshots, optimistic local writes — funnels through
//! the merge operations here, which are idempotent and commutative with
//! respect to stale or duplicate input: player status is a join-semilattice
//! (terminal statuses absorb), room status only advances, and a non-null
//! completion timestamp is accepted as evidence of completion even when the
//! status field lags. Arbitrary interleavings of the three sources therefore
//! converge to the same state.
//!
//! Merge operations return [`Effect`]s instead of doing I/O, so the whole
//! module is testable synchronously; the engine loop executes the effects
//! against the remote store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{rank_results, Player, PlayerStatus, Room, RoomId, RoomResult, RoomStatus};
use crate::protocol::EventKind;
use crate::stream::LocalWrite;

/// Follow-up work a merge asks the engine to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Re-fetch the completed collection from the store. Completed rooms are
    /// never merged incrementally because their player data is aggregated
    /// server-side; a fresh authoritative fetch always replaces them.
    RefreshCompleted,
    /// Re-fetch results for one room and recompute ranks.
    RefreshResults(RoomId),
    /// The completion invariant fired: mark the room completed remotely.
    WriteCompletion {
        room_id: RoomId,
        completed_at: DateTime<Utc>,
    },
}

/// Owns the authoritative in-memory mirror of rooms, players, and results.
///
/// No other component mutates these collections; everything else reads
/// snapshots or submits merges.
#[derive(Debug, Default)]
pub struct Reconciler {
    active: Vec<Room>,
    completed: Vec<Room>,
    results: HashMap<RoomId, Vec<RoomResult>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Read accessors ──────────────────────────────────────────────

    /// Rooms not yet completed, in insertion order.
    pub fn rooms(&self) -> &[Room] {
        &self.active
    }

    /// Completed rooms, as last fetched from the store.
    pub fn completed_rooms(&self) -> &[Room] {
        &self.completed
    }

    /// Ranked results for one room; empty if never loaded.
    pub fn results(&self, room_id: RoomId) -> &[RoomResult] {
        self.results.get(&room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All cached result sets keyed by room.
    pub fn results_map(&self) -> &HashMap<RoomId, Vec<RoomResult>> {
        &self.results
    }

    // ── Merge operations ────────────────────────────────────────────

    /// Merge a room change notification.
    pub fn apply_room_event(
        &mut self,
        kind: EventKind,
        before: Option<Room>,
        after: Option<Room>,
    ) -> Vec<Effect> {
        if kind == EventKind::Delete {
            let Some(id) = before.as_ref().or(after.as_ref()).map(|r| r.id) else {
                warn!("room delete event without payload, dropping");
                return Vec::new();
            };
            self.remove_room(id);
            return Vec::new();
        }

        let Some(after) = after else {
            warn!(?kind, "room event missing after payload, dropping");
            return Vec::new();
        };
        let room_id = after.id;

        if after.is_completed() {
            // Completed rooms leave the active collection immediately; the
            // authoritative completed list is re-fetched rather than merged.
            self.active.retain(|r| r.id != room_id);
            return vec![Effect::RefreshCompleted];
        }

        if self.completed.iter().any(|r| r.id == room_id) {
            // Locally known terminal; a lower-status event is stale.
            debug!(%room_id, "ignoring stale event for completed room");
            return Vec::new();
        }

        match self.active.iter_mut().find(|r| r.id == room_id) {
            Some(room) => {
                room.name = after.name;
                if after.status > room.status {
                    room.status = after.status;
                }
                room.min_players = after.min_players;
                room.max_players = after.max_players;
                room.all_players_completed = after.all_players_completed;
                room.started_at = after.started_at.or(room.started_at);
                room.ended_at = after.ended_at.or(room.ended_at);
                room.completed_at = after.completed_at.or(room.completed_at);
                // Row-level events usually carry no nested players; keep the
                // local list in that case.
                for incoming in after.players {
                    match room.players.iter_mut().find(|p| p.id == incoming.id) {
                        Some(existing) => {
                            let merged = merge_player(Some(&*existing), incoming);
                            *existing = merged;
                        }
                        None => room.players.push(incoming),
                    }
                }
            }
            None => self.active.push(after),
        }

        self.evaluate_completion(room_id)
    }

    /// Merge a player change notification.
    ///
    /// Event-sourced single-record updates are trusted as current: status is
    /// set verbatim, except that `Completed` never needs reconciliation and
    /// is set unconditionally.
    pub fn apply_player_event(&mut self, kind: EventKind, after: Player) -> Vec<Effect> {
        if kind == EventKind::Delete {
            // Departure arrives as a status update to `left`, not a row
            // delete; an actual delete would race the poll backstop, so it
            // is ignored here and repaired by the next snapshot.
            debug!(player_id = %after.id, "ignoring player delete event");
            return Vec::new();
        }

        let room_id = after.room_id;
        let Some(room) = self.active.iter_mut().find(|r| r.id == room_id) else {
            debug!(%room_id, player_id = %after.id, "player event for unknown room, dropping");
            return Vec::new();
        };

        match room.players.iter_mut().find(|p| p.id == after.id) {
            Some(existing) => {
                if after.status == PlayerStatus::Completed {
                    existing.status = PlayerStatus::Completed;
                } else {
                    existing.status = after.status;
                }
                existing.session_id = after.session_id.or(existing.session_id);
                existing.completed_at = after.completed_at.or(existing.completed_at);
            }
            None => room.players.push(after),
        }

        self.evaluate_completion(room_id)
    }

    /// Merge a full active-room snapshot from the poll backstop.
    ///
    /// The snapshot replaces the active collection, but each fetched player
    /// record is checked against the outgoing state first: a replica that
    /// has not caught up to a write this client just made must not regress a
    /// terminal status (anti-regression merge), and a non-null completion
    /// timestamp coerces a lagging status to `Completed`.
    pub fn merge_poll_snapshot(&mut self, fetched: Vec<Room>) -> Vec<Effect> {
        let outgoing = std::mem::take(&mut self.active);
        let mut effects = Vec::new();
        let mut refresh_completed = false;
        let mut next = Vec::with_capacity(fetched.len());

        for mut room in fetched {
            if self.completed.iter().any(|c| c.id == room.id) {
                // Never present in both collections at once.
                continue;
            }
            let previous = outgoing.iter().find(|r| r.id == room.id);

            room.players = room
                .players
                .into_iter()
                .map(|p| {
                    let current = previous.and_then(|r| r.player(p.id));
                    merge_player(current, p)
                })
                .collect();

            if let Some(previous) = previous {
                if previous.status > room.status {
                    room.status = previous.status;
                }
            }

            if room.is_completed() {
                refresh_completed = true;
                continue;
            }
            next.push(room);
        }

        self.active = next;

        let ids: Vec<RoomId> = self.active.iter().map(|r| r.id).collect();
        for id in ids {
            effects.extend(self.evaluate_completion(id));
        }
        if refresh_completed {
            effects.push(Effect::RefreshCompleted);
        }
        effects
    }

    /// Replace the completed collection with an authoritative fetch.
    pub fn replace_completed(&mut self, rooms: Vec<Room>) {
        for room in &rooms {
            self.active.retain(|a| a.id != room.id);
        }
        self.completed = rooms;
    }

    /// Replace one room's results with a fresh fetch, ranking them.
    pub fn replace_results(&mut self, room_id: RoomId, mut results: Vec<RoomResult>) {
        rank_results(&mut results);
        self.results.insert(room_id, results);
    }

    /// Apply an optimistic local write through the normal merge rules.
    pub fn apply_local_write(&mut self, write: LocalWrite) -> Vec<Effect> {
        match write {
            LocalWrite::RoomUpserted(room) => {
                self.apply_room_event(EventKind::Update, None, Some(room))
            }
            LocalWrite::RoomRemoved(room_id) => {
                self.remove_room(room_id);
                Vec::new()
            }
            LocalWrite::PlayerUpserted(player) => {
                self.apply_player_event(EventKind::Update, player)
            }
        }
    }

    /// Evaluate the completion invariant for one room.
    ///
    /// Fires when the set of non-departed players is non-empty and every
    /// member has (effective) status `Completed` while the room itself is
    /// not. On fire the room is dropped from the active collection
    /// optimistically and a conditional write-back is requested. The
    /// predicate is recomputed from scratch on every call, so a failed
    /// write-back simply retries on the next player-affecting merge.
    pub fn evaluate_completion(&mut self, room_id: RoomId) -> Vec<Effect> {
        let Some(index) = self.active.iter().position(|r| r.id == room_id) else {
            return Vec::new();
        };
        let Some(room) = self.active.get(index) else {
            return Vec::new();
        };
        if room.status == RoomStatus::Completed {
            return Vec::new();
        }

        let mut any = false;
        for player in &room.players {
            match player.effective_status() {
                PlayerStatus::Left => continue,
                PlayerStatus::Completed => any = true,
                _ => return Vec::new(),
            }
        }
        if !any {
            return Vec::new();
        }

        let completed_at = Utc::now();
        debug!(%room_id, "completion invariant satisfied, promoting room");
        self.active.remove(index);
        vec![Effect::WriteCompletion {
            room_id,
            completed_at,
        }]
    }

    fn remove_room(&mut self, room_id: RoomId) {
        self.active.retain(|r| r.id != room_id);
        self.completed.retain(|r| r.id != room_id);
        self.results.remove(&room_id);
    }
}

/// Monotone merge of one player record: a terminal current status absorbs a
/// non-terminal incoming one, and a completion timestamp backfills a lagging
/// status.
fn merge_player(current: Option<&Player>, mut incoming: Player) -> Player {
    if let Some(current) = current {
        if current.status.is_terminal() && !incoming.status.is_terminal() {
            incoming.status = current.status;
            incoming.completed_at = incoming.completed_at.or(current.completed_at);
        }
        incoming.session_id = incoming.session_id.or(current.session_id);
    }
    if incoming.completed_at.is_some() && !incoming.status.is_terminal() {
        incoming.status = PlayerStatus::Completed;
    }
    incoming
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

    fn player(room_id: RoomId, status: PlayerStatus) -> Player {
        Player {
            id: Uuid::new_v4(),
            room_id,
            user_id: Uuid::new_v4(),
            status,
            session_id: None,
            completed_at: None,
        }
    }

    fn room(name: &str, statuses: &[PlayerStatus]) -> Room {
        let id = Uuid::new_v4();
        Room {
            id,
            name: name.into(),
            status: RoomStatus::InProgress,
            min_players: 2,
            max_players: 4,
            all_players_completed: false,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
            completed_at: None,
            players: statuses.iter().map(|s| player(id, *s)).collect(),
        }
    }

    fn seeded(rooms: Vec<Room>) -> Reconciler {
        let mut reconciler = Reconciler::new();
        let effects = reconciler.merge_poll_snapshot(rooms);
        assert!(effects.is_empty(), "seed rooms should not fire effects");
        reconciler
    }

    #[test]
    fn quorum_completion_fires_once_with_one_write_back() {
        let room = room("alpha", &[PlayerStatus::Completed, PlayerStatus::InGame]);
        let room_id = room.id;
        let laggard = room.players[1].clone();
        let mut reconciler = seeded(vec![room]);

        // One player still in game with a departed third: no fire.
        let left = player(room_id, PlayerStatus::Left);
        assert!(reconciler
            .apply_player_event(EventKind::Insert, left)
            .is_empty());

        // Laggard completes: fires exactly once.
        let mut done = laggard;
        done.status = PlayerStatus::Completed;
        done.completed_at = Some(Utc::now());
        let effects = reconciler.apply_player_event(EventKind::Update, done);
        assert_eq!(effects.len(), 1);
        assert!(matches!(
            effects[0],
            Effect::WriteCompletion { room_id: id, .. } if id == room_id
        ));

        // Optimistically dropped from active pending confirmation.
        assert!(reconciler.rooms().iter().all(|r| r.id != room_id));
    }

    #[test]
    fn completion_does_not_fire_with_in_game_player() {
        let room = room("beta", &[PlayerStatus::Completed, PlayerStatus::InGame]);
        let room_id = room.id;
        let mut reconciler = seeded(vec![room]);
        assert!(reconciler.evaluate_completion(room_id).is_empty());
        assert_eq!(reconciler.rooms().len(), 1);
    }

    #[test]
    fn completion_does_not_fire_with_only_departed_players() {
        let room = room("gamma", &[PlayerStatus::Left, PlayerStatus::Left]);
        let room_id = room.id;
        let mut reconciler = seeded(vec![room]);
        assert!(reconciler.evaluate_completion(room_id).is_empty());
    }

    #[test]
    fn poll_snapshot_never_regresses_completed_player() {
        let mut room = room("delta", &[PlayerStatus::InGame, PlayerStatus::InGame]);
        let room_id = room.id;
        let player_id = room.players[0].id;
        let mut reconciler = seeded(vec![room.clone()]);

        // Push event: player 0 completes.
        let mut done = room.players[0].clone();
        done.status = PlayerStatus::Completed;
        let _ = reconciler.apply_player_event(EventKind::Update, done);

        // Stale poll snapshot still says in_game.
        room.players[0].status = PlayerStatus::InGame;
        let _ = reconciler.merge_poll_snapshot(vec![room]);

        let merged = reconciler.rooms()[0].player(player_id).unwrap();
        assert_eq!(merged.status, PlayerStatus::Completed);
        assert_eq!(reconciler.rooms()[0].id, room_id);
    }

    #[test]
    fn poll_snapshot_never_regresses_left_player() {
        let mut room = room("epsilon", &[PlayerStatus::Left, PlayerStatus::InGame]);
        let player_id = room.players[0].id;
        let mut reconciler = seeded(vec![room.clone()]);

        room.players[0].status = PlayerStatus::Joined;
        let _ = reconciler.merge_poll_snapshot(vec![room]);

        let merged = reconciler.rooms()[0].player(player_id).unwrap();
        assert_eq!(merged.status, PlayerStatus::Left);
    }

    #[test]
    fn snapshot_completion_timestamp_coerces_status() {
        let mut room = room("zeta", &[PlayerStatus::Joined, PlayerStatus::InGame]);
        let player_id = room.players[0].id;
        room.players[0].completed_at = Some(Utc::now());
        let mut reconciler = Reconciler::new();

        let _ = reconciler.merge_poll_snapshot(vec![room]);

        let merged = reconciler.rooms()[0].player(player_id).unwrap();
        assert_eq!(merged.status, PlayerStatus::Completed);
    }

    #[test]
    fn applying_same_event_twice_is_idempotent() {
        let room = room("eta", &[PlayerStatus::InGame, PlayerStatus::InGame]);
        let update = room.players[0].clone();
        let mut reconciler = seeded(vec![room]);

        let mut done = update;
        done.status = PlayerStatus::Completed;
        let _ = reconciler.apply_player_event(EventKind::Update, done.clone());
        let snapshot_after_first: Vec<Room> = reconciler.rooms().to_vec();

        let effects = reconciler.apply_player_event(EventKind::Update, done);
        assert!(effects.is_empty());
        let snapshot_after_second: Vec<Room> = reconciler.rooms().to_vec();

        assert_eq!(
            serde_json::to_value(&snapshot_after_first).unwrap(),
            serde_json::to_value(&snapshot_after_second).unwrap()
        );
    }

    #[test]
    fn completed_room_event_moves_room_out_of_active() {
        let mut room = room("theta", &[PlayerStatus::Completed]);
        let room_id = room.id;
        let mut reconciler = seeded(vec![]);
        reconciler.active.push(room.clone());

        room.status = RoomStatus::Completed;
        let effects = reconciler.apply_room_event(EventKind::Update, None, Some(room));
        assert_eq!(effects, vec![Effect::RefreshCompleted]);
        assert!(reconciler.rooms().iter().all(|r| r.id != room_id));
    }

    #[test]
    fn all_players_completed_flag_also_moves_room_out() {
        let mut room = room("iota", &[PlayerStatus::Completed]);
        let mut reconciler = seeded(vec![]);
        reconciler.active.push(room.clone());

        room.all_players_completed = true;
        let effects = reconciler.apply_room_event(EventKind::Update, None, Some(room));
        assert_eq!(effects, vec![Effect::RefreshCompleted]);
        assert!(reconciler.rooms().is_empty());
    }

    #[test]
    fn room_never_in_both_collections() {
        let room = room("kappa", &[PlayerStatus::InGame]);
        let room_id = room.id;
        let mut reconciler = seeded(vec![room.clone()]);

        // The store reports it completed; the active snapshot is stale and
        // still carries it.
        let mut completed = room.clone();
        completed.status = RoomStatus::Completed;
        reconciler.replace_completed(vec![completed]);
        assert!(reconciler.rooms().is_empty());

        let _ = reconciler.merge_poll_snapshot(vec![room]);
        let in_active = reconciler.rooms().iter().any(|r| r.id == room_id);
        let in_completed = reconciler.completed_rooms().iter().any(|r| r.id == room_id);
        assert!(!in_active && in_completed);
    }

    #[test]
    fn room_status_only_advances() {
        let mut room = room("lambda", &[PlayerStatus::InGame]);
        room.status = RoomStatus::InProgress;
        let mut reconciler = seeded(vec![room.clone()]);

        room.status = RoomStatus::Open;
        let _ = reconciler.apply_room_event(EventKind::Update, None, Some(room));
        assert_eq!(reconciler.rooms()[0].status, RoomStatus::InProgress);
    }

    #[test]
    fn room_event_without_players_keeps_local_roster() {
        let room = room("mu", &[PlayerStatus::InGame, PlayerStatus::Joined]);
        let mut reconciler = seeded(vec![room.clone()]);

        let mut bare = room;
        bare.players = Vec::new();
        bare.name = "mu renamed".into();
        let _ = reconciler.apply_room_event(EventKind::Update, None, Some(bare));

        assert_eq!(reconciler.rooms()[0].name, "mu renamed");
        assert_eq!(reconciler.rooms()[0].players.len(), 2);
    }

    #[test]
    fn delete_event_removes_room_everywhere() {
        let room = room("nu", &[PlayerStatus::InGame]);
        let room_id = room.id;
        let mut reconciler = seeded(vec![room.clone()]);
        reconciler.replace_results(room_id, Vec::new());

        let _ = reconciler.apply_room_event(EventKind::Delete, Some(room), None);
        assert!(reconciler.rooms().is_empty());
        assert!(reconciler.results_map().is_empty());
    }

    #[test]
    fn player_event_for_unknown_room_is_dropped() {
        let mut reconciler = Reconciler::new();
        let stray = player(Uuid::new_v4(), PlayerStatus::Completed);
        assert!(reconciler
            .apply_player_event(EventKind::Update, stray)
            .is_empty());
    }

    #[test]
    fn local_write_reflects_immediately() {
        let mut reconciler = Reconciler::new();
        let room = room("xi", &[]);
        let room_id = room.id;

        let _ = reconciler.apply_local_write(LocalWrite::RoomUpserted(room));
        assert_eq!(reconciler.rooms().len(), 1);

        let joiner = player(room_id, PlayerStatus::Joined);
        let _ = reconciler.apply_local_write(LocalWrite::PlayerUpserted(joiner));
        assert_eq!(reconciler.rooms()[0].players.len(), 1);

        let _ = reconciler.apply_local_write(LocalWrite::RoomRemoved(room_id));
        assert!(reconciler.rooms().is_empty());
    }

    #[test]
    fn results_are_ranked_on_replace() {
        let mut reconciler = Reconciler::new();
        let room_id = Uuid::new_v4();
        let results = vec![
            RoomResult {
                id: Uuid::new_v4(),
                room_id,
                session_id: None,
                final_balance: 9_000.0,
                rank: 0,
                profit_pct: 0.0,
            },
            RoomResult {
                id: Uuid::new_v4(),
                room_id,
                session_id: None,
                final_balance: 15_000.0,
                rank: 0,
                profit_pct: 0.0,
            },
        ];
        reconciler.replace_results(room_id, results);

        let ranked = reconciler.results(room_id);
        assert_eq!(ranked[0].rank, 2);
        assert_eq!(ranked[1].rank, 1);
        assert!((ranked[1].profit_pct - 50.0).abs() < f64::EPSILON);
    }
}
