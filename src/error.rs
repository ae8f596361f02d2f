//! Error types for the Stock Pit sync core.

use thiserror::Error;

/// Errors that can occur while synchronizing room state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A request to the remote store failed (fetch or write).
    #[error("store request error: {0}")]
    StoreRequest(String),

    /// Establishing a change-notification channel failed.
    #[error("channel subscribe error: {0}")]
    ChannelSubscribe(String),

    /// Receiving from an established change-notification channel failed.
    #[error("channel receive error: {0}")]
    ChannelReceive(String),

    /// The change-notification channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// Failed to serialize or deserialize a wire payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A change notification carried a payload that could not be decoded.
    #[error("malformed change event: {0}")]
    MalformedEvent(String),

    /// The session is missing or expired. Fatal to the current view; the
    /// caller must redirect out rather than retry.
    #[error("not authenticated")]
    Unauthenticated,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Attempted an operation on a client whose engine loop has stopped.
    #[error("sync engine not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for sync-core operations.
pub type Result<T> = std::result::Result<T, SyncError>;
