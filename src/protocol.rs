//! Wire types for the change-notification channel.
//!
//! A change notification is a `{entity, kind, before?, after?}` envelope.
//! Payloads stay as raw [`serde_json::Value`]s here; decoding into typed
//! records happens in [`crate::dispatch`], where a malformed payload is
//! logged and dropped instead of failing the channel.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::RoomId;

/// Identity of one logical subscription channel.
///
/// Regenerated on every (re)subscribe, never reused.
pub type ChannelId = Uuid;

/// The entity collection a change notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Rooms,
    Players,
    Results,
}

/// The kind of change carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    #[default]
    Update,
    Delete,
    /// Wildcard used by subscriptions that watch every change kind.
    Any,
}

/// A raw change notification as delivered by the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    #[serde(default)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
}

/// One watched entity collection, optionally filtered to a single room.
///
/// Rooms and players are always watched unfiltered; results are filtered to
/// the currently selected room, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub entity: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

impl EntityFilter {
    /// Watch every row of an entity collection.
    pub fn all(entity: EntityKind) -> Self {
        Self {
            entity,
            room_id: None,
        }
    }

    /// Watch only rows belonging to one room.
    pub fn for_room(entity: EntityKind, room_id: RoomId) -> Self {
        Self {
            entity,
            room_id: Some(room_id),
        }
    }
}

/// First frame sent on a freshly opened change channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub channel: ChannelId,
    pub filters: Vec<EntityFilter>,
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
    fn change_event_roundtrip_without_payloads() {
        let event = ChangeEvent {
            entity: EntityKind::Rooms,
            kind: EventKind::Delete,
            before: Some(serde_json::json!({ "id": Uuid::nil() })),
            after: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("after"));
        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entity, EntityKind::Rooms);
        assert_eq!(back.kind, EventKind::Delete);
        assert!(back.before.is_some());
        assert!(back.after.is_none());
    }

    #[test]
    fn event_kind_defaults_to_update() {
        let event: ChangeEvent =
            serde_json::from_str(r#"{ "entity": "players" }"#).unwrap();
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.entity, EntityKind::Players);
    }

    #[test]
    fn entity_kind_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&EntityKind::Results).unwrap(),
            "\"results\""
        );
        assert_eq!(serde_json::to_string(&EventKind::Any).unwrap(), "\"any\"");
    }

    #[test]
    fn filter_for_room_serializes_room_id() {
        let room = Uuid::new_v4();
        let filter = EntityFilter::for_room(EntityKind::Results, room);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["entity"], "results");
        assert_eq!(json["room_id"], serde_json::json!(room));

        let unfiltered = serde_json::to_value(EntityFilter::all(EntityKind::Rooms)).unwrap();
        assert!(unfiltered.get("room_id").is_none());
    }
}
