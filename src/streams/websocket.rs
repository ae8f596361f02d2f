//! WebSocket change channel implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketChangeStream`], a
//! [`ChangeStream`](crate::stream::ChangeStream) implementation that reads
//! JSON-encoded change events off a WebSocket connection, and
//! [`WebSocketEventSource`], the matching
//! [`EventSource`](crate::stream::EventSource) that opens one stream per
//! subscription. Both `ws://` and `wss://` URLs are supported — TLS is
//! handled transparently via
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `channel-websocket` feature is
//! enabled (it is enabled by default).
//!
//! # Wire format
//!
//! Each subscription starts with one text frame carrying a JSON
//! [`SubscribeRequest`]; every subsequent incoming text frame is a JSON
//! [`ChangeEvent`]. Frames that fail to parse are logged and skipped rather
//! than tearing the channel down.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::protocol::{ChangeEvent, ChannelId, EntityFilter, SubscribeRequest};
use crate::stream::{ChangeStream, EventSource};

/// Type alias for the underlying WebSocket stream.
///
/// Made public so that callers can construct a [`WebSocketChangeStream`]
/// from an existing stream via [`WebSocketChangeStream::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`ChangeStream`] backed by a WebSocket connection.
///
/// Wraps a `tokio-tungstenite`
/// [`WebSocketStream`](tokio_tungstenite::WebSocketStream) and decodes each
/// text frame as a JSON [`ChangeEvent`].
///
/// # Construction
///
/// [`WebSocketEventSource`] constructs these as part of
/// [`subscribe`](crate::stream::EventSource::subscribe). To drive one by
/// hand use [`WebSocketChangeStream::connect`], or for custom TLS, proxy, or
/// header setup construct the stream yourself and use
/// [`WebSocketChangeStream::from_stream`].
///
/// # Cancel Safety
///
/// The [`recv`](ChangeStream::recv) method is cancel-safe. Dropping the
/// future returned by `recv` before it completes will not consume or lose
/// any events, making it safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketChangeStream {
    stream: WsStream,
    closed: bool,
}

impl WebSocketChangeStream {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// Supports both `ws://` and `wss://` schemes.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Io`] if the URL is invalid or the connection
    /// cannot be established. When the underlying error is an I/O error its
    /// [`ErrorKind`](std::io::ErrorKind) is preserved; all other errors are
    /// mapped to [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        debug!(url = %url, "connecting change channel WebSocket");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            SyncError::Io(std::io::Error::new(kind, e))
        })?;

        info!(url = %url, "change channel WebSocket established");

        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Establish a new WebSocket connection with a timeout.
    ///
    /// Behaves identically to [`connect`](Self::connect) but fails with
    /// [`SyncError::Timeout`] if the connection is not established within
    /// the given duration.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Timeout`] if the deadline elapses, or any error
    /// that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, SyncError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// Create a [`WebSocketChangeStream`] from an already-established
    /// WebSocket stream.
    ///
    /// Useful when you need custom TLS configuration, proxy headers, or any
    /// other connection setup that [`connect`](Self::connect) does not
    /// expose.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// Send one text frame, e.g. the opening subscribe request.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChannelClosed`] after [`close`](ChangeStream::close),
    /// or [`SyncError::ChannelSubscribe`] if the write fails.
    pub async fn send_text(&mut self, text: String) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::ChannelClosed);
        }
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SyncError::ChannelSubscribe(e.to_string()))
    }
}

#[async_trait]
impl ChangeStream for WebSocketChangeStream {
    async fn recv(&mut self) -> Option<Result<ChangeEvent, SyncError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(SyncError::ChannelReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => match serde_json::from_str::<ChangeEvent>(&text) {
                    Ok(event) => return Some(Ok(event)),
                    Err(e) => {
                        // A garbled frame must not kill a healthy channel;
                        // the poll backstop covers whatever it carried.
                        warn!(error = %e, "dropping undecodable change frame");
                    }
                },
                Message::Close(frame) => {
                    debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                Message::Ping(_) => {
                    // tungstenite auto-queues a Pong reply; nothing to do.
                }
                Message::Pong(_) => {}
                Message::Binary(_) => {
                    warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    // Never produced by the read half; arm kept for
                    // exhaustiveness against future `Message` variants.
                    debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::ChannelReceive(e.to_string()))
    }
}

/// An [`EventSource`] that opens one [`WebSocketChangeStream`] per
/// subscription against a fixed endpoint URL.
///
/// Each [`subscribe`](EventSource::subscribe) call dials the endpoint and
/// sends a JSON [`SubscribeRequest`] naming the channel and its filters as
/// the first frame.
#[derive(Debug, Clone)]
pub struct WebSocketEventSource {
    url: String,
}

impl WebSocketEventSource {
    /// Create a source that subscribes against the given `ws://` or
    /// `wss://` endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The endpoint URL supplied at construction.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSource for WebSocketEventSource {
    async fn subscribe(
        &self,
        channel: ChannelId,
        filters: Vec<EntityFilter>,
    ) -> Result<Box<dyn ChangeStream>, SyncError> {
        let mut stream = WebSocketChangeStream::connect(&self.url)
            .await
            .map_err(|e| SyncError::ChannelSubscribe(e.to_string()))?;

        let request = SubscribeRequest { channel, filters };
        let body = serde_json::to_string(&request)?;
        stream.send_text(body).await?;

        debug!(%channel, "WebSocket subscription opened");
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
#[cfg(feature = "channel-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{EntityKind, EventKind};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[test]
    fn change_stream_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketChangeStream>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let result = WebSocketChangeStream::connect("not-a-valid-url").await;
        let err = result.unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let result = WebSocketChangeStream::connect("ws://127.0.0.1:1").await;
        let err = result.unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        // Non-routable address to guarantee a timeout.
        let result = WebSocketChangeStream::connect_with_timeout(
            "ws://192.0.2.1:1",
            std::time::Duration::from_millis(50),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    fn room_event_json() -> String {
        json!({
            "entity": "rooms",
            "kind": "update",
            "after": {
                "id": uuid::Uuid::new_v4(),
                "name": "pit-1",
                "status": "in_progress",
                "players": []
            }
        })
        .to_string()
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn recv_decodes_change_events() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Text(room_event_json().into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut stream = WebSocketChangeStream::connect(&url).await.unwrap();

        let event = stream.recv().await.unwrap().unwrap();
        assert_eq!(event.entity, EntityKind::Rooms);
        assert_eq!(event.kind, EventKind::Update);
        assert!(event.after.is_some());

        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_undecodable_frames() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("{not json]".into())).await.unwrap();
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text(room_event_json().into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut stream = WebSocketChangeStream::connect(&url).await.unwrap();

        // The garbled and binary frames are skipped, not fatal.
        let event = stream.recv().await.unwrap().unwrap();
        assert_eq!(event.entity, EntityKind::Rooms);
    }

    #[tokio::test]
    async fn recv_returns_none_on_close_frame() {
        let url = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut stream = WebSocketChangeStream::connect(&url).await.unwrap();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_returns_channel_closed() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut stream = WebSocketChangeStream::connect(&url).await.unwrap();
        stream.close().await.unwrap();

        let err = stream.send_text("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, SyncError::ChannelClosed));
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let url =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut stream = WebSocketChangeStream::connect(&url).await.unwrap();
        stream.close().await.unwrap();
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn event_source_sends_subscribe_request_first() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<String>();

        let url = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = seen_tx.send(text.to_string());
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let source = WebSocketEventSource::new(url);
        let channel = uuid::Uuid::new_v4();
        let filters = vec![EntityFilter::all(EntityKind::Rooms)];

        let source: Arc<dyn EventSource> = Arc::new(source);
        let _stream = source.subscribe(channel, filters).await.unwrap();

        let first_frame = seen_rx.await.unwrap();
        let request: SubscribeRequest = serde_json::from_str(&first_frame).unwrap();
        assert_eq!(request.channel, channel);
        assert_eq!(request.filters.len(), 1);
        assert_eq!(request.filters[0].entity, EntityKind::Rooms);
    }
}
