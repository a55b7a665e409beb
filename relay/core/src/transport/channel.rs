//! Channel-backed SSE transport
//!
//! Frames are pushed into a bounded tokio channel whose receiver becomes the
//! HTTP response body. Dropping the receiver is how a disconnected client
//! shows up here. A receiver that is kept but never read fills the buffer;
//! writes then wait at most the write timeout and fail with
//! [`TransportError::Stalled`].
//!
//! # Usage
//!
//! ```ignore
//! let (transport, body_rx) = ChannelTransport::pair(64);
//! // hand body_rx to the HTTP layer, transport to the forwarder
//! transport.send_event("chunk", &json!({"index": 0, "text": "Hi"})).await?;
//! transport.end().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use super::frame::{encode_comment, encode_event};
use super::traits::{ConnectionId, SseTransport, TransportError};

/// Default bound on a single frame write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// SSE transport writing into an mpsc channel
pub struct ChannelTransport {
    id: ConnectionId,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    write_timeout: Duration,
    ended: AtomicBool,
    chunk_written: AtomicBool,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl ChannelTransport {
    /// Create a transport and the body receiver it feeds
    #[must_use]
    pub fn pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        Self::pair_with_write_timeout(capacity, DEFAULT_WRITE_TIMEOUT)
    }

    /// Like [`ChannelTransport::pair`] with an explicit per-frame write bound
    #[must_use]
    pub fn pair_with_write_timeout(
        capacity: usize,
        write_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let transport = Arc::new(Self {
            id: ConnectionId::new(),
            tx: Mutex::new(Some(tx)),
            write_timeout,
            ended: AtomicBool::new(false),
            chunk_written: AtomicBool::new(false),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        });
        (transport, rx)
    }

    /// Frames written so far
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Bytes written so far
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tx.lock().clone()
    }

    async fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::Closed)?;
        let len = frame.len() as u64;
        tx.send_timeout(frame, self.write_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => TransportError::Stalled(self.write_timeout),
                SendTimeoutError::Closed(_) => TransportError::Closed,
            })?;
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl SseTransport for ChannelTransport {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn send_event(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        let frame = encode_event(event, payload)?;
        self.write(frame).await?;
        if event == "chunk" {
            self.chunk_written.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn send_comment(&self, comment: &str) -> Result<(), TransportError> {
        self.write(encode_comment(comment)).await
    }

    fn has_written_chunk(&self) -> bool {
        self.chunk_written.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        if self.ended.load(Ordering::Acquire) {
            return true;
        }
        self.tx.lock().as_ref().map_or(true, mpsc::Sender::is_closed)
    }

    async fn end(&self) {
        self.ended.store(true, Ordering::Release);
        let dropped = self.tx.lock().take();
        if dropped.is_some() {
            tracing::debug!(
                conn_id = %self.id,
                frames = self.frames_written(),
                bytes = self.bytes_written(),
                "SSE transport ended"
            );
        }
    }

    async fn closed(&self) {
        match self.sender() {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    }
}
