//! Event Forwarder
//!
//! The policy engine of a streaming session. It consumes upstream
//! [`ProviderEvent`]s in arrival order, writes wire frames through the
//! [`SseTransport`], feeds the [`TelemetryQueue`] and drives the single
//! finalization path.
//!
//! # Policies
//!
//! - **Chunk emission**: text is sanitized, keepalive `ok` bodies are dropped,
//!   the first chunk disarms the first-token watchdog and stops heartbeats.
//! - **First-token watchdog**: armed on `prompt_ready`; if no chunk follows
//!   within the deadline the session finalizes with `first_token_timeout`.
//! - **Idle timeout**: any upstream event resets it; expiry finalizes with
//!   `idle_timeout`.
//! - **Guard fallback**: a session that reaches finalization without a single
//!   chunk emits one apology chunk first, unless the client is gone.
//! - **Finalization** ([`EventForwarder::send_done`]): runs once, guarded by
//!   [`StreamState::done`]. Every side effect failure is logged and swallowed
//!   so the transport is always closed and reservations always released.
//!
//! Connection loss, shutdown, provider errors and timeouts are all just
//! triggers into `send_done`. Frame writes race the session token and are
//! bounded by the transport's write timeout, so a client that stops reading
//! cannot hold the loop away from those triggers.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{extract_event_text, is_keepalive_artifact, sanitize_output, ControlSignal, ProviderEvent};
use super::state::{CloseClassification, CloseSource, FinishReason, StreamState};
use crate::clock::SharedClock;
use crate::config::StreamConfig;
use crate::dedup::{SessionReservations, TerminalOutcome};
use crate::telemetry::{TelemetryQueue, TelemetryReport, TelemetrySignal};
use crate::transport::{HeartbeatConfig, HeartbeatTask, SseTransport, TransportError};

/// Text of the synthetic chunk sent when a stream produced nothing
pub const GUARD_FALLBACK_TEXT: &str =
    "Sorry, I couldn't send a reply in time. Could you try again in a moment?";

/// Pending interaction-record creation
pub type InteractionBootstrap = JoinHandle<Option<String>>;

/// What a finished session looked like
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    /// Server-assigned stream id
    pub stream_id: String,
    /// Resolved interaction id
    pub interaction_id: Option<String>,
    /// Final finish reason
    pub finish_reason: FinishReason,
    /// Close classification, when the connection closed
    pub close_classification: Option<CloseClassification>,
    /// Chunks emitted, including the guard fallback
    pub chunks: u64,
    /// Bytes emitted
    pub bytes: u64,
    /// Whether the guard fallback chunk was sent
    pub guard_fallback: bool,
    /// Whether the terminal control frame reached the transport
    pub done_frame_written: bool,
    /// Start to first chunk
    pub first_token_latency_ms: Option<u64>,
    /// Start to finalization
    pub total_latency_ms: u64,
    /// Concatenated emitted text
    pub content: String,
    /// Telemetry delivery
    pub telemetry: TelemetryReport,
}

/// Per-session policy engine
pub struct EventForwarder {
    state: StreamState,
    telemetry: TelemetryQueue,
    transport: Arc<dyn SseTransport>,
    heartbeat: HeartbeatTask,
    config: StreamConfig,
    clock: SharedClock,
    watchdog_deadline: Option<Instant>,
    idle_deadline: Instant,
    bootstrap: Option<InteractionBootstrap>,
    reservations: Option<SessionReservations>,
    last_error: Option<String>,
    done_frame_written: bool,
    telemetry_report: TelemetryReport,
    session_cancel: Option<CancellationToken>,
    transport_stalled: bool,
}

impl EventForwarder {
    /// Bind a forwarder to fresh state, a transport and a telemetry queue
    ///
    /// Heartbeats start immediately when enabled.
    #[must_use]
    pub fn new(
        state: StreamState,
        transport: Arc<dyn SseTransport>,
        telemetry: TelemetryQueue,
        config: StreamConfig,
        clock: SharedClock,
    ) -> Self {
        let heartbeat_config = if config.heartbeat_enabled {
            HeartbeatConfig::every(config.heartbeat_interval())
        } else {
            HeartbeatConfig::disabled()
        };
        let heartbeat = HeartbeatTask::spawn(Arc::clone(&transport), &heartbeat_config);
        let idle_deadline = Instant::now() + config.idle_timeout();

        Self {
            state,
            telemetry,
            transport,
            heartbeat,
            config,
            clock,
            watchdog_deadline: None,
            idle_deadline,
            bootstrap: None,
            reservations: None,
            last_error: None,
            done_frame_written: false,
            telemetry_report: TelemetryReport::default(),
            session_cancel: None,
            transport_stalled: false,
        }
    }

    /// Attach the in-flight interaction creation
    #[must_use]
    pub fn with_bootstrap(mut self, bootstrap: InteractionBootstrap) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Attach the reservations released at finalization
    #[must_use]
    pub fn with_reservations(mut self, reservations: SessionReservations) -> Self {
        self.reservations = Some(reservations);
        self
    }

    /// Current stream state
    #[must_use]
    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Whether finalization ran
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.done
    }

    /// Whether the first-token watchdog is armed
    #[must_use]
    pub fn watchdog_armed(&self) -> bool {
        self.watchdog_deadline.is_some()
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    // ========================================================================
    // Session loop
    // ========================================================================

    /// Drive the session to completion
    ///
    /// Stops when finalization ran. `cancel` is the session's abort signal;
    /// it is cancelled on return so the provider stops producing.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ProviderEvent>,
        cancel: CancellationToken,
    ) -> SessionSummary {
        tracing::info!(
            stream_id = %self.state.stream_id,
            conn_id = %self.transport.connection_id(),
            "sse_provider_open"
        );
        self.session_cancel = Some(cancel.clone());

        while !self.state.done {
            let watchdog = self.watchdog_deadline;
            let idle = self.idle_deadline;

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    self.state.set_server_abort_reason("server_abort");
                    self.handle_connection_closed(CloseSource::ServerAbort, None).await;
                }
                () = self.transport.closed() => {
                    self.handle_connection_closed(CloseSource::ReqClose, None).await;
                }
                event = events.recv() => match event {
                    Some(event) => self.forward(event).await,
                    None => self.handle_provider_closed().await,
                },
                result = join_bootstrap(&mut self.bootstrap) => {
                    self.bootstrap = None;
                    self.apply_bootstrap_result(result);
                }
                () = sleep_until_opt(watchdog) => {
                    self.handle_first_token_timeout().await;
                }
                () = tokio::time::sleep_until(idle) => {
                    self.handle_idle_timeout().await;
                }
            }
        }

        cancel.cancel();
        self.summary()
    }

    fn summary(&self) -> SessionSummary {
        let now = self.now();
        SessionSummary {
            stream_id: self.state.stream_id.clone(),
            interaction_id: self.state.interaction_id.clone(),
            finish_reason: self.state.finish_reason.unwrap_or(FinishReason::Unknown),
            close_classification: self.state.close_classification,
            chunks: self.state.chunks_count,
            bytes: self.state.bytes_count,
            guard_fallback: self.state.guard_fallback_sent,
            done_frame_written: self.done_frame_written,
            first_token_latency_ms: self.state.first_token_latency_ms(),
            total_latency_ms: self.state.total_latency_ms(now),
            content: self.state.content(),
            telemetry: self.telemetry_report,
        }
    }

    // ========================================================================
    // Upstream events
    // ========================================================================

    /// Handle one upstream event
    ///
    /// Events arriving after finalization are ignored.
    pub async fn forward(&mut self, event: ProviderEvent) {
        if self.state.done {
            tracing::debug!(kind = event.kind(), "Event after done ignored");
            return;
        }
        let now = self.now();
        self.state.touch(now);
        self.idle_deadline = Instant::now() + self.config.idle_timeout();

        match event {
            ProviderEvent::Control { name, meta, timings } => {
                self.handle_control(name, meta, timings).await;
            }
            ProviderEvent::FirstToken { text } => {
                if self.state.chunks_count == 0 {
                    self.send_chunk(&text, None).await;
                }
            }
            ProviderEvent::Chunk { text, index } => {
                self.send_chunk(&text, index).await;
            }
            ProviderEvent::Delta { text } | ProviderEvent::Token { text } => {
                self.send_chunk(&text, None).await;
            }
            ProviderEvent::Done { meta, timings } => {
                self.handle_provider_done(meta, timings).await;
            }
            ProviderEvent::Error { message } => {
                self.handle_provider_error(&message).await;
            }
            ProviderEvent::Unknown(value) => match extract_event_text(&value) {
                Some(text) => {
                    self.send_chunk(&text, None).await;
                }
                None => tracing::debug!(payload = %value, "Unrecognised provider event"),
            },
        }

        if self.state.done {
            return;
        }
        if self.state.client_closed {
            self.send_done(Some(FinishReason::ClientClosed)).await;
        } else if self.transport_stalled {
            self.send_done(None).await;
        }
    }

    async fn handle_control(
        &mut self,
        name: ControlSignal,
        meta: Option<Map<String, Value>>,
        timings: Option<Map<String, Value>>,
    ) {
        if let Some(meta) = &meta {
            self.capture_interaction_id(meta);
        }
        if let Some(timings) = &timings {
            self.state.merge_latency_marks(timings);
        }

        match name {
            ControlSignal::PromptReady => self.handle_prompt_ready(meta, timings).await,
            ControlSignal::Done => self.handle_provider_done(meta, timings).await,
            ControlSignal::Meta => {
                if let Some(meta) = meta {
                    self.send_meta(meta).await;
                }
            }
            ControlSignal::MemorySaved => {
                self.send_memory_saved(meta.unwrap_or_default()).await;
            }
            ControlSignal::GuardFallbackTrigger => {
                if self.state.saw_chunk {
                    tracing::debug!("Guard fallback trigger after content ignored");
                } else {
                    self.send_done(Some(FinishReason::GuardFallback)).await;
                }
            }
            ControlSignal::Other(name) => {
                tracing::debug!(name = %name, "Unhandled control signal");
            }
        }
    }

    async fn handle_prompt_ready(
        &mut self,
        meta: Option<Map<String, Value>>,
        timings: Option<Map<String, Value>>,
    ) {
        let now = self.now();
        if !self.state.mark_prompt_ready(now) {
            return;
        }
        if !self.state.saw_chunk {
            self.watchdog_deadline = Some(Instant::now() + self.config.first_token_timeout());
        }

        let since_start = now.saturating_sub(self.state.t0);
        tracing::info!(stream_id = %self.state.stream_id, since_start_ms = since_start, "prompt_ready");

        let mut payload = json!({
            "name": "prompt_ready",
            "streamId": self.state.stream_id,
            "at": chrono::Utc::now().to_rfc3339(),
            "sinceStartMs": since_start,
        });
        if let Some(meta) = meta.filter(|m| !m.is_empty()) {
            payload["meta"] = Value::Object(meta);
        }
        if let Some(timings) = timings.filter(|t| !t.is_empty()) {
            payload["timings"] = Value::Object(timings);
        }
        self.write_event("control", &payload).await;

        let mut signal_meta = Map::new();
        signal_meta.insert("since_start_ms".to_string(), json!(since_start));
        self.telemetry
            .enqueue(TelemetrySignal::PromptReady, None, signal_meta);
    }

    async fn handle_provider_done(
        &mut self,
        meta: Option<Map<String, Value>>,
        timings: Option<Map<String, Value>>,
    ) {
        let mut reason = FinishReason::Stop;
        if let Some(meta) = &meta {
            self.capture_interaction_id(meta);
            self.state.merge_done_meta(meta);
            self.state.update_usage_tokens(&Value::Object(meta.clone()));
            if let Some(model) = meta.get("model").and_then(Value::as_str) {
                self.state.model = Some(model.to_string());
            }
            let raw = ["finishReason", "finish_reason", "reason"]
                .iter()
                .find_map(|k| meta.get(*k).and_then(Value::as_str));
            if let Some(raw) = raw {
                let (mapped, original) = FinishReason::from_provider(raw);
                reason = mapped;
                if original.is_some() {
                    self.state.original_finish_reason = original;
                }
            }
        }
        if let Some(timings) = &timings {
            self.state.merge_latency_marks(timings);
        }
        self.state.ensure_finish_reason(reason);
        self.send_done(None).await;
    }

    async fn handle_provider_error(&mut self, message: &str) {
        tracing::error!(stream_id = %self.state.stream_id, error = %message, "provider_error");
        self.last_error = Some(message.to_string());

        let mut meta = Map::new();
        meta.insert("message".to_string(), json!(message));
        self.telemetry
            .enqueue(TelemetrySignal::ProviderError, None, meta);

        self.state.set_finish_reason(FinishReason::Error);
        self.send_done(None).await;
    }

    async fn handle_provider_closed(&mut self) {
        if self.state.done {
            return;
        }
        tracing::debug!(
            stream_id = %self.state.stream_id,
            finish_reason = ?self.state.finish_reason,
            "Provider stream ended without a terminal event"
        );
        self.send_done(None).await;
    }

    fn capture_interaction_id(&mut self, meta: &Map<String, Value>) {
        let id = ["interaction_id", "interactionId"]
            .iter()
            .find_map(|k| meta.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if let Some(id) = id {
            self.resolve_interaction(id.to_string());
        }
    }

    fn resolve_interaction(&mut self, id: String) {
        self.telemetry.on_correlation_resolved(&id);
        self.state.interaction_id = Some(id);
    }

    fn apply_bootstrap_result(&mut self, result: Result<Option<String>, tokio::task::JoinError>) {
        match result {
            Ok(Some(id)) => self.resolve_interaction(id),
            Ok(None) => {
                tracing::debug!(stream_id = %self.state.stream_id, "Interaction bootstrap returned no id");
            }
            Err(e) => {
                tracing::warn!(stream_id = %self.state.stream_id, error = %e, "Interaction bootstrap failed");
            }
        }
    }

    // ========================================================================
    // Outbound frames
    // ========================================================================

    async fn write_event(&mut self, event: &str, payload: &Value) -> bool {
        if self.state.client_closed || self.transport_stalled {
            return false;
        }
        let cancel = self.session_cancel.clone().filter(|c| !c.is_cancelled());
        let send = self.transport.send_event(event, payload);
        let result = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                result = send => result,
                () = cancel.cancelled() => {
                    tracing::warn!(stream_id = %self.state.stream_id, event = event, "Write abandoned on abort");
                    return false;
                }
            },
            None => send.await,
        };
        match result {
            Ok(()) => true,
            Err(TransportError::Stalled(waited)) => {
                self.transport_stalled = true;
                if !self.state.connection_closed {
                    let now = self.now();
                    self.state
                        .mark_connection_closed(CloseSource::ResError, Some("write stalled"), now);
                }
                tracing::warn!(
                    stream_id = %self.state.stream_id,
                    event = event,
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "Client stopped reading, write stalled"
                );
                false
            }
            Err(TransportError::Closed) => {
                let now = self.now();
                let classification =
                    self.state
                        .mark_connection_closed(CloseSource::ResWrite, Some("write after close"), now);
                tracing::warn!(
                    stream_id = %self.state.stream_id,
                    event = event,
                    classification = %classification,
                    "Write failed, connection closed"
                );
                false
            }
            Err(e) => {
                tracing::warn!(stream_id = %self.state.stream_id, event = event, error = %e, "Dropped outbound frame");
                false
            }
        }
    }

    /// Emit a content chunk from upstream
    ///
    /// Returns whether a chunk was recorded.
    pub async fn send_chunk(&mut self, text: &str, index: Option<u64>) -> bool {
        if self.state.done {
            return false;
        }
        self.emit_chunk(text, index).await
    }

    async fn emit_chunk(&mut self, text: &str, index: Option<u64>) -> bool {
        let text = sanitize_output(text);
        if text.is_empty() {
            return false;
        }
        if is_keepalive_artifact(&text) {
            tracing::debug!(stream_id = %self.state.stream_id, "Keepalive artifact dropped");
            return false;
        }

        let now = self.now();
        let record = self.state.record_chunk(&text, index, now);
        self.watchdog_deadline = None;
        self.idle_deadline = Instant::now() + self.config.idle_timeout();

        if record.first_chunk {
            self.heartbeat.stop();
            let latency = self.state.first_token_latency_ms().unwrap_or(0);
            self.state
                .latency_marks
                .insert("first_token_ms".to_string(), json!(latency));
            tracing::info!(
                stream_id = %self.state.stream_id,
                latency_ms = latency,
                chunk_bytes = record.chunk_bytes,
                "sse_first_chunk"
            );
            if !self.state.first_token_telemetry_sent {
                self.state.first_token_telemetry_sent = true;
                let mut meta = Map::new();
                meta.insert("latency_ms".to_string(), json!(latency));
                meta.insert("chunk_bytes".to_string(), json!(record.chunk_bytes));
                #[allow(clippy::cast_precision_loss)]
                self.telemetry
                    .enqueue(TelemetrySignal::FirstToken, Some(latency as f64), meta);
            }
        }
        tracing::debug!(
            stream_id = %self.state.stream_id,
            index = record.chunk_index,
            bytes = record.chunk_bytes,
            "stream_chunk"
        );

        let payload = json!({ "index": record.chunk_index, "text": text });
        self.write_event("chunk", &payload).await;

        if record.first_chunk {
            let latency = json!({
                "streamId": self.state.stream_id,
                "data": {
                    "type": "first_token_latency",
                    "firstTokenLatencyMs": self.state.first_token_latency_ms(),
                }
            });
            self.write_event("meta", &latency).await;
        }
        true
    }

    /// Forward provider metadata as a `meta` frame
    pub async fn send_meta(&mut self, meta: Map<String, Value>) {
        self.state.merge_meta(&meta);
        let payload = json!({ "streamId": self.state.stream_id, "data": meta });
        self.write_event("meta", &payload).await;
    }

    /// Record a memory event and emit a `memory_saved` frame
    pub async fn send_memory_saved(&mut self, meta: Map<String, Value>) {
        self.state.add_memory_event(Value::Object(meta.clone()));
        let payload = json!({ "streamId": self.state.stream_id, "saved": true, "meta": meta });
        self.write_event("memory_saved", &payload).await;
    }

    /// Emit the apology chunk if nothing was emitted yet
    ///
    /// Returns `true` only for the call that emitted it.
    pub async fn ensure_guard_fallback(&mut self, reason: &str) -> bool {
        if self.state.saw_chunk
            || self.state.guard_fallback_sent
            || self.state.client_closed
            || self.transport_stalled
        {
            return false;
        }
        self.state.mark_guard_fallback(reason);
        tracing::warn!(
            stream_id = %self.state.stream_id,
            client_message_id = ?self.state.client_message_id,
            reason = reason,
            "guard_fallback_emit"
        );

        let mut meta = Map::new();
        meta.insert("reason".to_string(), json!(reason));
        self.telemetry
            .enqueue(TelemetrySignal::GuardFallback, None, meta);

        self.emit_chunk(GUARD_FALLBACK_TEXT, None).await;
        true
    }

    // ========================================================================
    // Timeouts and connection loss
    // ========================================================================

    /// First-token watchdog expiry
    pub async fn handle_first_token_timeout(&mut self) {
        self.watchdog_deadline = None;
        if self.state.done || self.state.saw_chunk {
            return;
        }
        self.state.first_token_watchdog_fired = true;

        let now = self.now();
        let since_prompt = self.state.prompt_ready_at.map(|t| now.saturating_sub(t));
        tracing::warn!(
            stream_id = %self.state.stream_id,
            timeout_ms = self.config.first_token_timeout_ms,
            since_prompt_ready_ms = ?since_prompt,
            "first_token_timeout"
        );

        let mut meta = Map::new();
        meta.insert("timeout_ms".to_string(), json!(self.config.first_token_timeout_ms));
        meta.insert("since_prompt_ready_ms".to_string(), json!(since_prompt));
        self.telemetry
            .enqueue(TelemetrySignal::FirstTokenTimeout, None, meta);

        self.state.set_finish_reason(FinishReason::FirstTokenTimeout);
        self.send_done(None).await;
    }

    /// Idle timeout expiry
    pub async fn handle_idle_timeout(&mut self) {
        if self.state.done {
            return;
        }
        let now = self.now();
        let idle_for = now.saturating_sub(self.state.last_event_at);
        tracing::warn!(
            stream_id = %self.state.stream_id,
            idle_ms = idle_for,
            timeout_ms = self.config.idle_timeout_ms,
            "stream_idle_timeout"
        );
        self.state.set_server_abort_reason("idle_timeout");

        let mut meta = Map::new();
        meta.insert("timeout_ms".to_string(), json!(self.config.idle_timeout_ms));
        self.telemetry.enqueue(TelemetrySignal::IdleTimeout, None, meta);

        self.state.set_finish_reason(FinishReason::IdleTimeout);
        self.send_done(None).await;
    }

    /// Connection close signal
    ///
    /// Before finalization this finalizes the session: a client close as
    /// `client_closed`, anything else with the recorded reason or `unknown`.
    pub async fn handle_connection_closed(&mut self, source: CloseSource, error: Option<&str>) {
        let now = self.now();
        let source_name = source.to_string();
        let classification = self.state.mark_connection_closed(source, error, now);
        tracing::info!(
            stream_id = %self.state.stream_id,
            source = %source_name,
            classification = %classification,
            done = self.state.done,
            "Connection closed"
        );
        if self.state.done {
            return;
        }
        if classification == CloseClassification::ClientClosed {
            self.send_done(Some(FinishReason::ClientClosed)).await;
        } else {
            self.send_done(None).await;
        }
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    async fn await_bootstrap(&mut self) {
        let Some(handle) = self.bootstrap.take() else {
            return;
        };
        match tokio::time::timeout(self.config.bootstrap_wait(), handle).await {
            Ok(result) => self.apply_bootstrap_result(result),
            Err(_) => tracing::warn!(
                stream_id = %self.state.stream_id,
                wait_ms = self.config.bootstrap_wait_ms,
                "Interaction bootstrap still pending at finalization"
            ),
        }
    }

    /// Finalize the session
    ///
    /// Runs at most once. `reason` wins over any recorded reason; otherwise
    /// the recorded one is kept, then `first_token_timeout` if the watchdog
    /// fired, then `unknown`.
    pub async fn send_done(&mut self, reason: Option<FinishReason>) {
        let now = self.now();
        if !self.state.mark_done(now) {
            return;
        }
        self.watchdog_deadline = None;
        self.heartbeat.stop();

        let resolved = reason
            .or(self.state.finish_reason)
            .or_else(|| {
                self.state
                    .first_token_watchdog_fired
                    .then_some(FinishReason::FirstTokenTimeout)
            })
            .unwrap_or(FinishReason::Unknown);
        self.state.set_finish_reason(resolved);

        if !self.state.client_closed {
            self.ensure_guard_fallback(resolved.as_str()).await;
        }

        self.await_bootstrap().await;

        let first_token_latency = self.state.first_token_latency_ms();
        let total_latency = self.state.total_latency_ms(now);
        let guard_fallback = self.state.guard_fallback_sent;
        let ok = resolved == FinishReason::Stop && !guard_fallback;

        let status = json!({
            "streamId": self.state.stream_id,
            "data": {
                "type": "llm_status",
                "firstTokenLatencyMs": first_token_latency,
                "chunks": self.state.chunks_count,
                "bytes": self.state.bytes_count,
            }
        });
        self.write_event("meta", &status).await;

        let mut latency = Map::new();
        latency.insert("first_token_latency_ms".to_string(), json!(first_token_latency));
        latency.insert("total_latency_ms".to_string(), json!(total_latency));
        if !self.state.latency_marks.is_empty() {
            latency.insert("marks".to_string(), Value::Object(self.state.latency_marks.clone()));
        }
        self.telemetry.enqueue(TelemetrySignal::Latency, None, latency);

        let payload = self.done_payload(ok, resolved, first_token_latency, total_latency);
        self.done_frame_written = self.write_event("control", &payload).await;

        let mut done_meta = Map::new();
        done_meta.insert("finish_reason".to_string(), json!(resolved.as_str()));
        done_meta.insert("chunks".to_string(), json!(self.state.chunks_count));
        done_meta.insert("bytes".to_string(), json!(self.state.bytes_count));
        done_meta.insert("guard_fallback".to_string(), json!(guard_fallback));
        done_meta.insert(
            "close_classification".to_string(),
            json!(self.state.close_classification.map(CloseClassification::as_str)),
        );
        self.telemetry.enqueue(
            TelemetrySignal::Done,
            Some(if resolved == FinishReason::Stop { 1.0 } else { 0.0 }),
            done_meta,
        );

        tracing::info!(
            stream_id = %self.state.stream_id,
            interaction_id = ?self.state.interaction_id,
            finish_reason = %resolved,
            ok,
            chunks = self.state.chunks_count,
            bytes = self.state.bytes_count,
            guard_fallback,
            first_token_latency_ms = ?first_token_latency,
            total_latency_ms = total_latency,
            close = ?self.state.close_classification,
            "stream_done"
        );

        self.telemetry_report = self
            .telemetry
            .flush(self.config.telemetry_flush_timeout())
            .await;

        if let Some(mut reservations) = self.reservations.take() {
            reservations.finalize(TerminalOutcome {
                finish_reason: resolved.as_str().to_string(),
                interaction_id: self.state.interaction_id.clone(),
                guard_fallback,
            });
        }

        self.transport.end().await;
        tracing::debug!(stream_id = %self.state.stream_id, "stream_end");
    }

    fn done_payload(
        &self,
        ok: bool,
        reason: FinishReason,
        first_token_latency: Option<u64>,
        total_latency: u64,
    ) -> Value {
        let mut meta = self.state.done_meta.clone();
        for (k, v) in &self.state.meta_payload {
            meta.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if !self.state.memory_events.is_empty() {
            meta.insert(
                "memory_events".to_string(),
                Value::Array(self.state.memory_events.clone()),
            );
        }
        meta.insert("finishReason".to_string(), json!(reason.as_str()));
        meta.insert(
            "usage".to_string(),
            json!({
                "input_tokens": self.state.usage.input,
                "output_tokens": self.state.usage.output,
            }),
        );
        if let Some(original) = &self.state.original_finish_reason {
            meta.insert("originalFinishReason".to_string(), json!(original));
        }

        let mut payload = json!({
            "name": "done",
            "streamId": self.state.stream_id,
            "ok": ok,
            "reason": reason.as_str(),
            "finishReason": reason.as_str(),
            "guardFallback": self.state.guard_fallback_sent,
            "interaction_id": self.state.interaction_id,
            "usage": self.state.usage,
            "chunks": self.state.chunks_count,
            "bytes": self.state.bytes_count,
            "firstTokenLatencyMs": first_token_latency,
            "totalLatencyMs": total_latency,
            "sinceStartMs": total_latency,
            "at": chrono::Utc::now().to_rfc3339(),
            "meta": meta,
        });
        if !self.state.latency_marks.is_empty() {
            payload["timings"] = Value::Object(self.state.latency_marks.clone());
        }
        if let Some(error) = &self.last_error {
            payload["error"] = json!({ "message": error });
        }
        payload
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_bootstrap(
    bootstrap: &mut Option<InteractionBootstrap>,
) -> Result<Option<String>, tokio::task::JoinError> {
    match bootstrap {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
