//! # Stock Pit Sync
//!
//! Client-side state synchronization core for a turn-paced multiplayer
//! trading simulation.
//!
//! This crate keeps an in-memory mirror of the game's shared state — active
//! rooms, completed rooms, and per-room final results — continuously close
//! to a remote store, combining three input paths through one reconciler:
//!
//! - **Push channel** — a subscription delivering change notifications with
//!   low latency, managed through a reconnecting FSM with backoff and an
//!   independent health check
//! - **Poll backstop** — a periodic full refetch that repairs anything the
//!   channel dropped, merged without regressing newer local state
//! - **Local writes** — optimistic application of this client's own
//!   actions, ahead of the notification round-tripping back
//!
//! ## Features
//!
//! - **Store-agnostic** — implement [`RemoteStore`] and [`EventSource`]
//!   for any backend
//! - **WebSocket built-in** — default `channel-websocket` feature provides
//!   [`WebSocketEventSource`](streams::websocket::WebSocketEventSource)
//! - **Monotone merges** — statuses only advance, so duplicated, stale, or
//!   reordered deliveries converge on the same state
//! - **Watchable snapshots** — collections are published on
//!   [`tokio::sync::watch`] channels
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stockpit_sync::{SyncClient, SyncConfig};
//!
//! let client = SyncClient::start(store, source, SyncConfig::new()).await?;
//! let mut rooms = client.watch_rooms();
//! while rooms.changed().await.is_ok() {
//!     render(&rooms.borrow());
//! }
//! ```

pub mod bootstrap;
pub mod channel;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod poll;
pub mod protocol;
pub mod reconcile;
pub mod stream;
pub mod streams;

// Re-export primary types for ergonomic imports.
pub use channel::{BackoffPolicy, ChannelState};
pub use client::{ConnectionStatus, SyncClient, SyncConfig};
pub use error::{Result, SyncError};
pub use model::{Player, PlayerStatus, Room, RoomId, RoomResult, RoomStatus};
pub use protocol::{ChangeEvent, EntityFilter, EntityKind, EventKind};
pub use reconcile::{Effect, Reconciler};
pub use stream::{ChangeStream, EventSource, LocalWrite, RemoteStore};

#[cfg(feature = "channel-websocket")]
pub use streams::websocket::{WebSocketChangeStream, WebSocketEventSource};
