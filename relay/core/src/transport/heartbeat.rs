//! Heartbeat comments for idle SSE connections
//!
//! Proxies drop SSE responses that stay silent for too long. Until the first
//! content chunk is written, [`HeartbeatTask`] writes `:heartbeat` comments on
//! a fixed interval. It stops by itself once a chunk went out, the transport
//! closes or a write fails, and explicitly via [`HeartbeatTask::stop`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::traits::SseTransport;

/// Heartbeat comment text
pub const HEARTBEAT_COMMENT: &str = "heartbeat";

/// Configuration for heartbeat behavior
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between comments (default: 15 seconds)
    pub interval: Duration,
    /// Whether heartbeats are written at all
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    /// Heartbeats every `interval`
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            enabled: true,
        }
    }

    /// Heartbeats off
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Background heartbeat writer bound to one transport
pub struct HeartbeatTask {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatTask {
    /// Start writing heartbeats
    ///
    /// A disabled config or zero interval yields an inert task.
    #[must_use]
    pub fn spawn(transport: Arc<dyn SseTransport>, config: &HeartbeatConfig) -> Self {
        let stop = CancellationToken::new();
        if !config.enabled || config.interval.is_zero() {
            return Self { stop, handle: None };
        }

        let interval = config.interval;
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if transport.has_written_chunk() || transport.is_closed() {
                            break;
                        }
                        if let Err(e) = transport.send_comment(HEARTBEAT_COMMENT).await {
                            tracing::debug!(
                                conn_id = %transport.connection_id(),
                                error = %e,
                                "Heartbeat write failed"
                            );
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop writing heartbeats
    pub fn stop(&mut self) {
        self.stop.cancel();
        self.handle = None;
    }

    /// Whether the heartbeat loop is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
