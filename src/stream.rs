//! Seams to the remote store.
//!
//! The sync core talks to the outside world through exactly two traits:
//! [`RemoteStore`] for request/response traffic (fetches, write-backs,
//! session check) and [`EventSource`] for the push channel. Implement both
//! against your backend and pass them to
//! [`SyncClient::start`](crate::client::SyncClient::start); the tests in
//! `tests/` show channel-based mock implementations.
//!
//! # Cancel Safety
//!
//! [`ChangeStream::recv`] **MUST** be cancel-safe because the channel
//! manager drives it inside `tokio::select!`. If `recv` is cancelled before
//! completion, calling it again must not lose events. Channel-backed
//! implementations (wrapping `mpsc::Receiver`) are naturally cancel-safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    Player, PlayerId, PlayerStatus, Room, RoomId, RoomResult, RoomStatus, SessionId,
};
use crate::protocol::{ChangeEvent, ChannelId, EntityFilter};

// ── Write payloads ──────────────────────────────────────────────────

/// Fields for a room status write-back.
///
/// `unless_completed` makes the write conditional: the store must apply it
/// only when the room's current status is not already `completed`. Two
/// clients racing the completion invariant for the same room therefore
/// converge on a single effective write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStatusWrite {
    pub status: RoomStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_players_completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unless_completed: bool,
}

impl RoomStatusWrite {
    /// The write-back issued when the completion invariant fires.
    pub fn completion(completed_at: DateTime<Utc>) -> Self {
        Self {
            status: RoomStatus::Completed,
            all_players_completed: Some(true),
            started_at: None,
            ended_at: None,
            completed_at: Some(completed_at),
            unless_completed: true,
        }
    }
}

/// Fields for a player status write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStatusWrite {
    pub status: PlayerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Optimistic local writes ─────────────────────────────────────────

/// A locally originated write, applied optimistically ahead of the
/// corresponding change notification round-tripping back.
///
/// Action initiators (join/start/end/create/delete) submit these through
/// [`SyncClient::notify_local_write`](crate::client::SyncClient::notify_local_write)
/// so their own writes are visible immediately. The same monotone merge
/// rules apply as for push events, so a late or duplicate echo from the
/// channel is harmless.
#[derive(Debug, Clone)]
pub enum LocalWrite {
    /// A room was created or its fields changed.
    RoomUpserted(Room),
    /// A room was deleted.
    RoomRemoved(RoomId),
    /// A player joined or its membership record changed.
    PlayerUpserted(Player),
}

// ── Traits ──────────────────────────────────────────────────────────

/// Request/response access to the remote store.
///
/// All durable state lives behind this trait; the sync core keeps only an
/// in-memory mirror. Errors other than [`SyncError::Unauthenticated`](crate::error::SyncError::Unauthenticated) are
/// treated as transient by the callers.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Validate the current session.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Unauthenticated`](crate::error::SyncError::Unauthenticated) when no valid session exists.
    /// This is fatal to the owning view and is never retried.
    async fn check_session(&self) -> Result<SessionId>;

    /// Fetch rooms not in terminal completed state, with nested players.
    async fn fetch_active_rooms(&self) -> Result<Vec<Room>>;

    /// Fetch completed rooms. Server-aggregated; includes nested players.
    async fn fetch_completed_rooms(&self) -> Result<Vec<Room>>;

    /// Fetch final results for one room.
    async fn fetch_results(&self, room_id: RoomId) -> Result<Vec<RoomResult>>;

    /// Write room status fields, honoring `unless_completed`.
    async fn write_room_status(&self, room_id: RoomId, write: RoomStatusWrite) -> Result<()>;

    /// Write player status fields.
    async fn write_player_status(&self, player_id: PlayerId, write: PlayerStatusWrite)
        -> Result<()>;
}

/// A live subscription delivering change notifications.
///
/// Returned by [`EventSource::subscribe`]. Dropping or closing the stream
/// unsubscribes.
#[async_trait]
pub trait ChangeStream: Send + 'static {
    /// Receive the next change notification.
    ///
    /// Returns:
    /// - `Some(Ok(event))` — a decoded change notification
    /// - `Some(Err(e))` — a channel error; the caller tears down and retries
    /// - `None` — the channel was closed by the server
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [module docs](self)).
    async fn recv(&mut self) -> Option<Result<ChangeEvent>>;

    /// Close the subscription gracefully.
    async fn close(&mut self) -> Result<()>;
}

/// Factory for change-notification subscriptions.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Open a new subscription for the given entity filters.
    ///
    /// `channel` is the fresh identity minted for this subscription; sources
    /// that multiplex channels over one connection use it to name the
    /// subscription server-side. No replay of historical events is assumed —
    /// the poll backstop covers any gap between channels.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChannelSubscribe`](crate::error::SyncError::ChannelSubscribe) when the subscription cannot
    /// be established.
    async fn subscribe(
        &self,
        channel: ChannelId,
        filters: Vec<EntityFilter>,
    ) -> Result<Box<dyn ChangeStream>>;
}
