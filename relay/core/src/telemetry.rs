//! Telemetry Queue
//!
//! Passive analytics signals need the persisted interaction id, which is
//! created asynchronously while the stream is already running. The queue
//! holds signals in a pending list until [`TelemetryQueue::on_correlation_resolved`]
//! is called, then replays them in enqueue order. After that, signals go
//! straight to a per-session worker task that persists them sequentially.
//!
//! ```text
//! enqueue ──► [pending] ──(resolved)──► worker ──► Persistence::insert_passive_signal
//!                                      ▲
//! enqueue (after resolution) ──────────┘
//! ```
//!
//! Inserts failing with a missing parent row are retried with exponential
//! backoff; any other failure is logged and the signal is dropped. Nothing
//! here ever reaches the client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::persistence::Persistence;

/// Maximum insert attempts per signal
pub const MAX_INSERT_ATTEMPTS: u32 = 3;

/// Backoff before the second attempt; doubles after each failure
pub const INSERT_RETRY_BASE: Duration = Duration::from_millis(100);

/// Passive signal names
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TelemetrySignal {
    /// Upstream accepted the prompt
    PromptReady,
    /// First chunk emitted
    FirstToken,
    /// First-token watchdog fired
    FirstTokenTimeout,
    /// Upstream went silent
    IdleTimeout,
    /// Upstream reported an error
    ProviderError,
    /// Guard fallback chunk emitted
    GuardFallback,
    /// Stream finalized
    Done,
    /// Latency summary
    Latency,
}

impl TelemetrySignal {
    /// Stored signal name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptReady => "prompt_ready",
            Self::FirstToken => "first_token",
            Self::FirstTokenTimeout => "first_token_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::ProviderError => "provider_error",
            Self::GuardFallback => "guard_fallback",
            Self::Done => "done",
            Self::Latency => "latency",
        }
    }
}

impl fmt::Display for TelemetrySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal waiting for its interaction id
#[derive(Clone, Debug, PartialEq)]
pub struct PendingSignal {
    /// Signal name
    pub signal: TelemetrySignal,
    /// Optional numeric value
    pub value: Option<f64>,
    /// Signal metadata
    pub meta: Map<String, Value>,
}

impl PendingSignal {
    fn into_row(self) -> (TelemetrySignal, Map<String, Value>) {
        let mut meta = self.meta;
        if let Some(value) = self.value {
            if let Some(number) = serde_json::Number::from_f64(value) {
                meta.insert("value".to_string(), Value::Number(number));
            }
        }
        (self.signal, meta)
    }
}

struct Job {
    interaction_id: String,
    signal: PendingSignal,
}

/// Outcome of a [`TelemetryQueue::flush`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetryReport {
    /// Signals persisted
    pub delivered: u64,
    /// Signals that failed after retries
    pub failed: u64,
    /// Signals discarded because no interaction id was ever resolved
    pub dropped: u64,
    /// Whether the worker missed the flush deadline
    pub timed_out: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct WorkerStats {
    delivered: u64,
    failed: u64,
}

/// Per-session ordered telemetry buffer
pub struct TelemetryQueue {
    persistence: Arc<dyn Persistence>,
    stream_id: String,
    correlation: Option<String>,
    pending: Vec<PendingSignal>,
    tx: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<WorkerStats>>,
    closed: bool,
}

impl TelemetryQueue {
    /// Create an unresolved queue
    #[must_use]
    pub fn new(persistence: Arc<dyn Persistence>, stream_id: impl Into<String>) -> Self {
        Self {
            persistence,
            stream_id: stream_id.into(),
            correlation: None,
            pending: Vec::new(),
            tx: None,
            worker: None,
            closed: false,
        }
    }

    /// Whether the interaction id is known
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.correlation.is_some()
    }

    /// The resolved interaction id
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation.as_deref()
    }

    /// Signals still waiting for resolution
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue a signal
    pub fn enqueue(&mut self, signal: TelemetrySignal, value: Option<f64>, meta: Map<String, Value>) {
        if self.closed {
            tracing::debug!(stream_id = %self.stream_id, signal = %signal, "Telemetry queue closed, signal ignored");
            return;
        }
        let pending = PendingSignal { signal, value, meta };
        match self.correlation.clone() {
            Some(id) => self.dispatch(id, pending),
            None => self.pending.push(pending),
        }
    }

    /// Record the interaction id and replay pending signals in order
    ///
    /// Resolution happens once. A later, different id is logged as a
    /// mismatch and used for subsequent signals.
    pub fn on_correlation_resolved(&mut self, interaction_id: &str) {
        let id = interaction_id.trim();
        if id.is_empty() {
            return;
        }
        match &self.correlation {
            Some(current) if current == id => {}
            Some(current) => {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    previous = %current,
                    next = %id,
                    "interaction_id_mismatch"
                );
                self.correlation = Some(id.to_string());
            }
            None => {
                self.correlation = Some(id.to_string());
                let pending = std::mem::take(&mut self.pending);
                tracing::debug!(
                    stream_id = %self.stream_id,
                    interaction_id = %id,
                    flushed = pending.len(),
                    "Telemetry correlation resolved"
                );
                for signal in pending {
                    self.dispatch(id.to_string(), signal);
                }
            }
        }
    }

    fn dispatch(&mut self, interaction_id: String, signal: PendingSignal) {
        if self.tx.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            let persistence = Arc::clone(&self.persistence);
            let stream_id = self.stream_id.clone();
            self.worker = Some(tokio::spawn(run_worker(persistence, stream_id, rx)));
            self.tx = Some(tx);
        }
        if let Some(tx) = &self.tx {
            if tx.send(Job { interaction_id, signal }).is_err() {
                tracing::warn!(stream_id = %self.stream_id, "Telemetry worker gone, signal dropped");
            }
        }
    }

    /// Close the queue and wait for queued inserts
    ///
    /// Signals still pending without an interaction id are discarded.
    pub async fn flush(&mut self, timeout: Duration) -> TelemetryReport {
        self.closed = true;
        let mut report = TelemetryReport::default();

        if !self.pending.is_empty() {
            report.dropped = self.pending.len() as u64;
            tracing::warn!(
                stream_id = %self.stream_id,
                dropped = report.dropped,
                "Telemetry discarded without interaction id"
            );
            self.pending.clear();
        }

        self.tx = None;
        if let Some(worker) = self.worker.take() {
            match tokio::time::timeout(timeout, worker).await {
                Ok(Ok(stats)) => {
                    report.delivered = stats.delivered;
                    report.failed = stats.failed;
                }
                Ok(Err(e)) => {
                    tracing::error!(stream_id = %self.stream_id, error = %e, "Telemetry worker panicked");
                }
                Err(_) => {
                    report.timed_out = true;
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Telemetry flush timed out"
                    );
                }
            }
        }
        report
    }
}

impl fmt::Debug for TelemetryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryQueue")
            .field("stream_id", &self.stream_id)
            .field("correlation", &self.correlation)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish()
    }
}

async fn run_worker(
    persistence: Arc<dyn Persistence>,
    stream_id: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    while let Some(job) = rx.recv().await {
        let (signal, meta) = job.signal.into_row();
        if insert_with_retry(persistence.as_ref(), &stream_id, &job.interaction_id, signal, &meta).await {
            stats.delivered += 1;
        } else {
            stats.failed += 1;
        }
    }
    stats
}

async fn insert_with_retry(
    persistence: &dyn Persistence,
    stream_id: &str,
    interaction_id: &str,
    signal: TelemetrySignal,
    meta: &Map<String, Value>,
) -> bool {
    let mut attempt = 1;
    loop {
        match persistence
            .insert_passive_signal(interaction_id, signal.as_str(), meta)
            .await
        {
            Ok(()) => return true,
            Err(e) if e.is_missing_interaction() && attempt < MAX_INSERT_ATTEMPTS => {
                let backoff = INSERT_RETRY_BASE * 2u32.pow(attempt - 1);
                tracing::warn!(
                    stream_id = %stream_id,
                    interaction_id = %interaction_id,
                    signal = %signal,
                    attempt,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "telemetry_fk_retry"
                );
                // Exponential backoff while the parent row commits
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    stream_id = %stream_id,
                    interaction_id = %interaction_id,
                    signal = %signal,
                    attempt,
                    error = %e,
                    "telemetry_failed"
                );
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::persistence::InMemoryPersistence;

    fn meta(key: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("k".to_string(), Value::String(key.to_string()));
        m
    }

    #[tokio::test]
    async fn test_pending_until_resolved_then_ordered() {
        let store = Arc::new(InMemoryPersistence::new());
        store.register_interaction("int-1");
        let mut queue = TelemetryQueue::new(store.clone(), "s-1");

        queue.enqueue(TelemetrySignal::PromptReady, None, meta("a"));
        queue.enqueue(TelemetrySignal::FirstToken, Some(12.0), meta("b"));
        assert_eq!(queue.pending_len(), 2);
        assert!(store.signals().is_empty());

        queue.on_correlation_resolved("int-1");
        assert_eq!(queue.pending_len(), 0);
        queue.enqueue(TelemetrySignal::Done, Some(1.0), Map::new());

        let report = queue.flush(Duration::from_secs(1)).await;
        assert_eq!(report.delivered, 3);
        assert_eq!(
            store.signal_names(),
            vec!["prompt_ready", "first_token", "done"]
        );
        assert_eq!(store.signals()[1].meta["value"], 12.0);
        assert_eq!(store.signals()[1].meta["k"], "b");
    }

    #[tokio::test]
    async fn test_resolution_is_one_way() {
        let store = Arc::new(InMemoryPersistence::new());
        store.register_interaction("int-1");
        let mut queue = TelemetryQueue::new(store.clone(), "s-1");

        queue.enqueue(TelemetrySignal::PromptReady, None, Map::new());
        queue.on_correlation_resolved("int-1");
        queue.on_correlation_resolved("int-1");
        queue.flush(Duration::from_secs(1)).await;

        assert_eq!(store.signal_names(), vec!["prompt_ready"]);
    }

    #[tokio::test]
    async fn test_mismatch_switches_id() {
        let store = Arc::new(InMemoryPersistence::new());
        store.register_interaction("int-1");
        store.register_interaction("int-2");
        let mut queue = TelemetryQueue::new(store.clone(), "s-1");

        queue.on_correlation_resolved("int-1");
        queue.enqueue(TelemetrySignal::PromptReady, None, Map::new());
        queue.on_correlation_resolved("int-2");
        queue.enqueue(TelemetrySignal::Done, None, Map::new());
        queue.flush(Duration::from_secs(1)).await;

        let ids: Vec<String> = store.signals().into_iter().map(|s| s.interaction_id).collect();
        assert_eq!(ids, vec!["int-1", "int-2"]);
        assert_eq!(queue.correlation_id(), Some("int-2"));
    }

    #[tokio::test]
    async fn test_unresolved_signals_are_dropped_on_flush() {
        let store = Arc::new(InMemoryPersistence::new());
        let mut queue = TelemetryQueue::new(store.clone(), "s-1");
        queue.enqueue(TelemetrySignal::PromptReady, None, Map::new());
        queue.enqueue(TelemetrySignal::Done, None, Map::new());

        let report = queue.flush(Duration::from_secs(1)).await;
        assert_eq!(report.dropped, 2);
        assert_eq!(report.delivered, 0);

        queue.enqueue(TelemetrySignal::Latency, None, Map::new());
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_interaction_is_retried() {
        let store = Arc::new(InMemoryPersistence::new());
        store.register_interaction("int-1");
        store.fail_next_inserts_with_missing_interaction(2);
        let mut queue = TelemetryQueue::new(store.clone(), "s-1");

        queue.on_correlation_resolved("int-1");
        queue.enqueue(TelemetrySignal::Done, None, Map::new());
        let report = queue.flush(Duration::from_secs(5)).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(store.signal_names(), vec!["done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let store = Arc::new(InMemoryPersistence::new());
        let mut queue = TelemetryQueue::new(store.clone(), "s-1");

        queue.on_correlation_resolved("ghost");
        queue.enqueue(TelemetrySignal::Done, None, Map::new());
        queue.enqueue(TelemetrySignal::Latency, None, Map::new());
        let report = queue.flush(Duration::from_secs(5)).await;

        assert_eq!(report.failed, 2);
        assert!(store.signals().is_empty());
    }

    #[tokio::test]
    async fn test_backend_errors_are_not_retried() {
        let store = Arc::new(InMemoryPersistence::new());
        store.register_interaction("int-1");
        store.set_fail_signals(true);
        let mut queue = TelemetryQueue::new(store.clone(), "s-1");

        queue.on_correlation_resolved("int-1");
        queue.enqueue(TelemetrySignal::Done, None, Map::new());
        let report = queue.flush(Duration::from_secs(1)).await;
        assert_eq!(report.failed, 1);
    }
}
