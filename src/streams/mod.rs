//! Built-in [`ChangeStream`](crate::stream::ChangeStream) and
//! [`EventSource`](crate::stream::EventSource) implementations.
//!
//! Currently one is shipped: a WebSocket-backed change channel behind the
//! `channel-websocket` feature (enabled by default). Anything that can
//! deliver JSON change events can implement the traits directly instead.

#[cfg(feature = "channel-websocket")]
pub mod websocket;

#[cfg(feature = "channel-websocket")]
pub use websocket::{WebSocketChangeStream, WebSocketEventSource, WsStream};
