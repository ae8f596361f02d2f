//! Event Dispatcher.
//!
//! Decodes raw change notifications and routes them to the matching
//! [`Reconciler`] operation. A malformed or partial payload is logged and
//! dropped — never an error to the caller — so one bad event cannot affect
//! other in-flight state.
//!
//! Rooms and players are latency-critical and travel on the [`Lane::Critical`]
//! queue, drained ahead of other work by the engine loop. This is a
//! performance preference only; the reconciler tolerates any delivery order.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::model::{Player, Room, RoomResult};
use crate::protocol::{ChangeEvent, EntityKind, EventKind};
use crate::reconcile::{Effect, Reconciler};

/// Priority lane for an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Rooms and players: dispatched ahead of other queued work.
    Critical,
    /// Everything else.
    Normal,
}

/// Which lane an entity's events travel on.
pub fn lane(entity: EntityKind) -> Lane {
    match entity {
        EntityKind::Rooms | EntityKind::Players => Lane::Critical,
        EntityKind::Results => Lane::Normal,
    }
}

/// Decode a change notification and apply it to the reconciler.
///
/// Returns the effects the merge produced; an undecodable event produces
/// none.
pub fn dispatch(reconciler: &mut Reconciler, event: ChangeEvent) -> Vec<Effect> {
    match event.entity {
        EntityKind::Rooms => {
            let before = match event.before {
                Some(value) => match decode::<Room>(value, "rooms.before") {
                    Some(room) => Some(room),
                    None => return Vec::new(),
                },
                None => None,
            };
            let after = match event.after {
                Some(value) => match decode::<Room>(value, "rooms.after") {
                    Some(room) => Some(room),
                    None => return Vec::new(),
                },
                None => None,
            };
            reconciler.apply_room_event(event.kind, before, after)
        }

        EntityKind::Players => {
            let Some(value) = event.after else {
                if event.kind != EventKind::Delete {
                    warn!(kind = ?event.kind, "player event missing after payload, dropping");
                }
                return Vec::new();
            };
            match decode::<Player>(value, "players.after") {
                Some(player) => reconciler.apply_player_event(event.kind, player),
                None => Vec::new(),
            }
        }

        EntityKind::Results => {
            // Results are never merged incrementally; any change just
            // schedules a wholesale re-fetch for that room.
            let Some(value) = event.after.or(event.before) else {
                warn!("result event without payload, dropping");
                return Vec::new();
            };
            match decode::<RoomResult>(value, "results") {
                Some(result) => vec![Effect::RefreshResults(result.room_id)],
                None => Vec::new(),
            }
        }
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value, context: &'static str) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(context, error = %e, "malformed change payload, dropping event");
            None
        }
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
    use crate::model::{PlayerStatus, RoomStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn room_json(id: Uuid) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": "pit-1",
            "status": "open",
            "min_players": 2,
            "max_players": 4,
            "created_at": Utc::now(),
            "players": [],
        })
    }

    #[test]
    fn rooms_and_players_are_critical() {
        assert_eq!(lane(EntityKind::Rooms), Lane::Critical);
        assert_eq!(lane(EntityKind::Players), Lane::Critical);
        assert_eq!(lane(EntityKind::Results), Lane::Normal);
    }

    #[test]
    fn room_insert_is_routed() {
        let mut reconciler = Reconciler::new();
        let id = Uuid::new_v4();
        let event = ChangeEvent {
            entity: EntityKind::Rooms,
            kind: EventKind::Insert,
            before: None,
            after: Some(room_json(id)),
        };
        let effects = dispatch(&mut reconciler, event);
        assert!(effects.is_empty());
        assert_eq!(reconciler.rooms().len(), 1);
        assert_eq!(reconciler.rooms()[0].status, RoomStatus::Open);
    }

    #[test]
    fn malformed_room_payload_is_dropped() {
        let mut reconciler = Reconciler::new();
        let event = ChangeEvent {
            entity: EntityKind::Rooms,
            kind: EventKind::Insert,
            before: None,
            after: Some(serde_json::json!({ "id": "not-a-uuid" })),
        };
        let effects = dispatch(&mut reconciler, event);
        assert!(effects.is_empty());
        assert!(reconciler.rooms().is_empty());
    }

    #[test]
    fn player_event_without_after_is_dropped() {
        let mut reconciler = Reconciler::new();
        let event = ChangeEvent {
            entity: EntityKind::Players,
            kind: EventKind::Update,
            before: None,
            after: None,
        };
        assert!(dispatch(&mut reconciler, event).is_empty());
    }

    #[test]
    fn player_update_is_routed_into_room() {
        let mut reconciler = Reconciler::new();
        let room_id = Uuid::new_v4();
        let _ = dispatch(
            &mut reconciler,
            ChangeEvent {
                entity: EntityKind::Rooms,
                kind: EventKind::Insert,
                before: None,
                after: Some(room_json(room_id)),
            },
        );

        let event = ChangeEvent {
            entity: EntityKind::Players,
            kind: EventKind::Insert,
            before: None,
            after: Some(serde_json::json!({
                "id": Uuid::new_v4(),
                "room_id": room_id,
                "user_id": Uuid::new_v4(),
                "status": "joined",
            })),
        };
        let _ = dispatch(&mut reconciler, event);
        assert_eq!(reconciler.rooms()[0].players.len(), 1);
        assert_eq!(
            reconciler.rooms()[0].players[0].status,
            PlayerStatus::Joined
        );
    }

    #[test]
    fn result_event_schedules_refresh() {
        let mut reconciler = Reconciler::new();
        let room_id = Uuid::new_v4();
        let event = ChangeEvent {
            entity: EntityKind::Results,
            kind: EventKind::Insert,
            before: None,
            after: Some(serde_json::json!({
                "id": Uuid::new_v4(),
                "room_id": room_id,
                "final_balance": 12_500.0,
            })),
        };
        let effects = dispatch(&mut reconciler, event);
        assert_eq!(effects, vec![Effect::RefreshResults(room_id)]);
    }
}
