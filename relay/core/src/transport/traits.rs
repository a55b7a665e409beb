//! Transport Traits
//!
//! [`SseTransport`] is the write/end contract the event forwarder depends on.
//! It knows nothing about stream policy: it frames events, reports whether the
//! peer is still there and remembers whether a content chunk went out.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Global counter for connection ids
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an outbound SSE connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next connection id
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors that can occur while writing to the client
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone or the transport was ended
    #[error("connection closed")]
    Closed,
    /// The peer stopped reading and the frame could not be queued in time
    #[error("write stalled after {0:?}")]
    Stalled(std::time::Duration),
    /// Payload could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Event name is empty or contains line breaks
    #[error("invalid event name: {0:?}")]
    InvalidEvent(String),
    /// Payload exceeds the frame limit
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Serialized size
        size: usize,
        /// Limit
        max: usize,
    },
}

/// Outbound SSE connection
#[async_trait]
pub trait SseTransport: Send + Sync {
    /// Connection id for logs
    fn connection_id(&self) -> ConnectionId;

    /// Write `event: <event>` with a JSON payload
    ///
    /// Writing an event named `chunk` marks the transport as having written
    /// content.
    async fn send_event(&self, event: &str, payload: &Value) -> Result<(), TransportError>;

    /// Write a comment frame
    async fn send_comment(&self, comment: &str) -> Result<(), TransportError>;

    /// Whether a `chunk` event was written
    fn has_written_chunk(&self) -> bool;

    /// Whether the peer is gone or the transport was ended
    fn is_closed(&self) -> bool;

    /// End the response; further writes fail with [`TransportError::Closed`]
    async fn end(&self);

    /// Resolves when the peer goes away
    ///
    /// Never resolves after a local [`end`](Self::end).
    async fn closed(&self);
}
