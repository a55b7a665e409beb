//! Per-session stream state
//!
//! [`StreamState`] is the mutable record behind a single streaming response.
//! It is owned exclusively by the session's event forwarder, so it needs no
//! interior locking. All timestamps are milliseconds from the session clock
//! and are set at most once.
//!
//! # Phases
//!
//! ```text
//! created ──► prompt_ready ──► streaming ──► done
//!    │                              ▲          ▲
//!    └──────────────────────────────┘          │
//!    └─────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Why a stream ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Provider finished normally
    Stop,
    /// Provider or internal failure
    Error,
    /// Generic timeout
    Timeout,
    /// No upstream activity within the idle bound
    IdleTimeout,
    /// No first chunk within the watchdog deadline
    FirstTokenTimeout,
    /// The client went away
    ClientClosed,
    /// Upstream asked for the guard fallback
    GuardFallback,
    /// Nothing more specific is known
    Unknown,
}

impl FinishReason {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::FirstTokenTimeout => "first_token_timeout",
            Self::ClientClosed => "client_closed",
            Self::GuardFallback => "guard_fallback",
            Self::Unknown => "unknown",
        }
    }

    /// Map a provider-reported finish reason
    ///
    /// Returns the mapped reason plus the raw value when it had no direct
    /// equivalent.
    #[must_use]
    pub fn from_provider(raw: &str) -> (Self, Option<String>) {
        let normalized = raw.trim().to_ascii_lowercase();
        let mapped = match normalized.as_str() {
            "stop" | "done" | "completed" | "complete" | "end_turn" | "length" => Self::Stop,
            "error" => Self::Error,
            "timeout" => Self::Timeout,
            "idle_timeout" => Self::IdleTimeout,
            "first_token_timeout" => Self::FirstTokenTimeout,
            "client_closed" => Self::ClientClosed,
            "guard_fallback" => Self::GuardFallback,
            "unknown" | "" => Self::Unknown,
            _ => return (Self::Unknown, Some(raw.to_string())),
        };
        (mapped, None)
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the connection ended, as best as can be told
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseClassification {
    /// The client disconnected
    ClientClosed,
    /// An intermediary dropped the connection
    ProxyClosed,
    /// The server ended the stream
    ServerAbort,
    /// Not enough signal to tell
    Unknown,
}

impl CloseClassification {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ProxyClosed => "proxy_closed",
            Self::ServerAbort => "server_abort",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CloseClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal that reported a connection close
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseSource {
    /// Request stream closed (`req.close`)
    ReqClose,
    /// Write to the response failed (`res.write`)
    ResWrite,
    /// Request aborted mid-flight (`req.aborted`)
    ReqAborted,
    /// Response socket errored (`res.error`)
    ResError,
    /// Server initiated the abort (`server.abort`)
    ServerAbort,
    /// Response closed without further detail (`res.close`)
    ResClose,
    /// Anything else
    Other(String),
}

impl CloseSource {
    /// Parse a dotted source name
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "req.close" => Self::ReqClose,
            "res.write" => Self::ResWrite,
            "req.aborted" => Self::ReqAborted,
            "res.error" => Self::ResError,
            "server.abort" => Self::ServerAbort,
            "res.close" => Self::ResClose,
            other => Self::Other(other.to_string()),
        }
    }

    /// Dotted source name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ReqClose => "req.close",
            Self::ResWrite => "res.write",
            Self::ReqAborted => "req.aborted",
            Self::ResError => "res.error",
            Self::ServerAbort => "server.abort",
            Self::ResClose => "res.close",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for CloseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    /// Nothing observed yet
    Created,
    /// Upstream accepted the prompt
    PromptReady,
    /// At least one chunk was recorded
    Streaming,
    /// Finalized
    Done,
}

/// Token usage reported by the provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTokens {
    /// Prompt tokens
    #[serde(rename = "in")]
    pub input: Option<u64>,
    /// Completion tokens
    #[serde(rename = "out")]
    pub output: Option<u64>,
}

/// Bookkeeping returned by [`StreamState::record_chunk`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Index assigned to the chunk
    pub chunk_index: u64,
    /// UTF-8 size of the chunk
    pub chunk_bytes: u64,
    /// Running byte total after this chunk
    pub total_bytes: u64,
    /// Whether this was the first chunk of the session
    pub first_chunk: bool,
    /// When the chunk was recorded
    pub timestamp: u64,
}

// ============================================================================
// Stream state
// ============================================================================

/// Mutable record of one streaming session
#[derive(Clone, Debug)]
pub struct StreamState {
    /// Server-assigned stream id
    pub stream_id: String,
    /// Persisted interaction id, resolved asynchronously
    pub interaction_id: Option<String>,
    /// Caller-supplied idempotency key
    pub client_message_id: Option<String>,
    /// Diagnostic origin of the request
    pub origin: Option<String>,
    /// Model reported by the provider
    pub model: Option<String>,

    /// Creation time
    pub t0: u64,
    /// Upstream accepted the prompt
    pub prompt_ready_at: Option<u64>,
    /// First chunk recorded
    pub first_token_at: Option<u64>,
    /// Most recent upstream activity
    pub last_event_at: u64,
    /// Most recent chunk
    pub last_chunk_at: Option<u64>,
    /// Connection close observed
    pub close_at: Option<u64>,
    /// Finalization
    pub done_at: Option<u64>,

    /// Chunks recorded, including the guard fallback
    pub chunks_count: u64,
    /// UTF-8 bytes recorded
    pub bytes_count: u64,

    /// A chunk was recorded
    pub saw_chunk: bool,
    /// Terminal flag, set exactly once
    pub done: bool,
    /// Guard fallback chunk emitted
    pub guard_fallback_sent: bool,
    /// What triggered the guard fallback
    pub guard_fallback_reason: Option<String>,
    /// Client disconnect observed
    pub client_closed: bool,
    /// Any connection close observed
    pub connection_closed: bool,
    /// First-token watchdog expired
    pub first_token_watchdog_fired: bool,
    /// First-token telemetry already enqueued
    pub first_token_telemetry_sent: bool,

    /// Final or provisional finish reason
    pub finish_reason: Option<FinishReason>,
    /// Raw provider finish reason with no direct mapping
    pub original_finish_reason: Option<String>,
    /// Close classification
    pub close_classification: Option<CloseClassification>,
    /// First close signal seen
    pub close_source: Option<CloseSource>,
    /// First close error message seen
    pub close_error: Option<String>,
    /// Reason the server aborted the stream
    pub server_abort_reason: Option<String>,

    /// Emitted text chunks, in order
    pub content_pieces: Vec<String>,
    /// Provider token usage
    pub usage: UsageTokens,
    /// Free-form latency marks
    pub latency_marks: Map<String, Value>,
    /// Free-form meta, merge only
    pub meta_payload: Map<String, Value>,
    /// Meta from the provider's terminal payload
    pub done_meta: Map<String, Value>,
    /// Memory events, append only
    pub memory_events: Vec<Value>,
}

impl StreamState {
    /// Fresh state created at `now`
    #[must_use]
    pub fn new(stream_id: impl Into<String>, now: u64) -> Self {
        Self {
            stream_id: stream_id.into(),
            interaction_id: None,
            client_message_id: None,
            origin: None,
            model: None,
            t0: now,
            prompt_ready_at: None,
            first_token_at: None,
            last_event_at: now,
            last_chunk_at: None,
            close_at: None,
            done_at: None,
            chunks_count: 0,
            bytes_count: 0,
            saw_chunk: false,
            done: false,
            guard_fallback_sent: false,
            guard_fallback_reason: None,
            client_closed: false,
            connection_closed: false,
            first_token_watchdog_fired: false,
            first_token_telemetry_sent: false,
            finish_reason: None,
            original_finish_reason: None,
            close_classification: None,
            close_source: None,
            close_error: None,
            server_abort_reason: None,
            content_pieces: Vec::new(),
            usage: UsageTokens::default(),
            latency_marks: Map::new(),
            meta_payload: Map::new(),
            done_meta: Map::new(),
            memory_events: Vec::new(),
        }
    }

    /// Set the client message id
    #[must_use]
    pub fn with_client_message_id(mut self, id: Option<String>) -> Self {
        self.client_message_id = id;
        self
    }

    /// Set the diagnostic origin
    #[must_use]
    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> StreamPhase {
        if self.done {
            StreamPhase::Done
        } else if self.saw_chunk {
            StreamPhase::Streaming
        } else if self.prompt_ready_at.is_some() {
            StreamPhase::PromptReady
        } else {
            StreamPhase::Created
        }
    }

    /// Note upstream activity
    pub fn touch(&mut self, now: u64) {
        self.last_event_at = now;
    }

    /// Record that the prompt was accepted upstream
    ///
    /// Returns `false` if it was already recorded.
    pub fn mark_prompt_ready(&mut self, now: u64) -> bool {
        self.touch(now);
        if self.prompt_ready_at.is_some() {
            return false;
        }
        self.prompt_ready_at = Some(now);
        true
    }

    /// Record an emitted chunk
    ///
    /// An explicit index is honoured, otherwise the running counter is used.
    /// `chunks_count` never decreases.
    pub fn record_chunk(&mut self, text: &str, provided_index: Option<u64>, now: u64) -> ChunkRecord {
        let chunk_index = provided_index.unwrap_or(self.chunks_count);
        let chunk_bytes = text.len() as u64;
        let total_bytes = self.bytes_count.saturating_add(chunk_bytes);

        self.saw_chunk = true;
        self.last_chunk_at = Some(now);
        self.touch(now);

        let first_chunk = self.first_token_at.is_none();
        if first_chunk {
            self.first_token_at = Some(now);
        }

        self.chunks_count = self.chunks_count.max(chunk_index.saturating_add(1));
        self.bytes_count = total_bytes;
        self.content_pieces.push(text.to_string());

        ChunkRecord {
            chunk_index,
            chunk_bytes,
            total_bytes,
            first_chunk,
            timestamp: now,
        }
    }

    /// Record the guard fallback
    ///
    /// Returns `false` when it was already sent.
    pub fn mark_guard_fallback(&mut self, reason: &str) -> bool {
        if self.guard_fallback_sent {
            return false;
        }
        self.guard_fallback_sent = true;
        self.guard_fallback_reason = Some(reason.to_string());
        true
    }

    /// Flip the terminal flag
    ///
    /// Returns `true` only on the first call.
    pub fn mark_done(&mut self, now: u64) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        self.done_at = Some(now);
        self.touch(now);
        true
    }

    /// Set the finish reason unless one exists
    pub fn ensure_finish_reason(&mut self, reason: FinishReason) {
        if self.finish_reason.is_none() {
            self.finish_reason = Some(reason);
        }
    }

    /// Set the finish reason unconditionally
    pub fn set_finish_reason(&mut self, reason: FinishReason) {
        self.finish_reason = Some(reason);
    }

    /// Record a server-side abort reason
    pub fn set_server_abort_reason(&mut self, reason: impl Into<String>) {
        self.server_abort_reason = Some(reason.into());
    }

    /// Classify a close signal against the current state
    #[must_use]
    pub fn classify_close(&self, source: Option<&CloseSource>) -> CloseClassification {
        let server_abort = self.server_abort_reason.is_some();
        match source {
            None if server_abort => CloseClassification::ServerAbort,
            None => CloseClassification::Unknown,
            Some(CloseSource::ReqClose | CloseSource::ResWrite) => CloseClassification::ClientClosed,
            Some(CloseSource::ReqAborted | CloseSource::ResError) => CloseClassification::ProxyClosed,
            Some(CloseSource::ServerAbort) => CloseClassification::ServerAbort,
            Some(CloseSource::ResClose) => {
                if server_abort || self.done {
                    CloseClassification::ServerAbort
                } else {
                    CloseClassification::ProxyClosed
                }
            }
            Some(CloseSource::Other(_)) if server_abort => CloseClassification::ServerAbort,
            Some(CloseSource::Other(_)) => CloseClassification::Unknown,
        }
    }

    /// Record a connection close and return the effective classification
    ///
    /// The first source, timestamp and error message are kept. Once
    /// classified `client_closed`, later calls keep returning it.
    pub fn mark_connection_closed(
        &mut self,
        source: CloseSource,
        error: Option<&str>,
        now: u64,
    ) -> CloseClassification {
        let classification = self.classify_close(Some(&source));

        if !self.connection_closed {
            self.connection_closed = true;
            self.close_source = Some(source);
            self.close_at = Some(now);
        }
        if self.close_error.is_none() {
            if let Some(msg) = error.map(str::trim).filter(|m| !m.is_empty()) {
                self.close_error = Some(msg.to_string());
            }
        }

        let effective = if self.close_classification == Some(CloseClassification::ClientClosed) {
            CloseClassification::ClientClosed
        } else {
            classification
        };
        self.close_classification = Some(effective);
        if effective == CloseClassification::ClientClosed {
            self.client_closed = true;
        }
        effective
    }

    /// Pull token usage out of provider metadata
    ///
    /// Looks under `usage`, `token_usage` or `tokens`, then at the top level.
    pub fn update_usage_tokens(&mut self, meta: &Value) {
        let Some(source) = meta.as_object() else {
            return;
        };
        let usage = ["usage", "token_usage", "tokens"]
            .iter()
            .find_map(|k| source.get(*k).and_then(Value::as_object));

        let pick = |nested: &[&str], top: &[&str]| -> Option<u64> {
            usage
                .and_then(|u| nested.iter().find_map(|k| u.get(*k).and_then(Value::as_u64)))
                .or_else(|| top.iter().find_map(|k| source.get(*k).and_then(Value::as_u64)))
        };

        if let Some(input) = pick(
            &["prompt_tokens", "input_tokens", "tokens_in", "in"],
            &["prompt_tokens", "input_tokens"],
        ) {
            self.usage.input = Some(input);
        }
        if let Some(output) = pick(
            &["completion_tokens", "output_tokens", "tokens_out", "out"],
            &["completion_tokens", "output_tokens"],
        ) {
            self.usage.output = Some(output);
        }
    }

    /// Shallow-merge into the meta payload
    pub fn merge_meta(&mut self, meta: &Map<String, Value>) {
        for (k, v) in meta {
            self.meta_payload.insert(k.clone(), v.clone());
        }
    }

    /// Shallow-merge into the terminal meta
    pub fn merge_done_meta(&mut self, meta: &Map<String, Value>) {
        for (k, v) in meta {
            self.done_meta.insert(k.clone(), v.clone());
        }
    }

    /// Shallow-merge latency marks
    pub fn merge_latency_marks(&mut self, marks: &Map<String, Value>) {
        for (k, v) in marks {
            self.latency_marks.insert(k.clone(), v.clone());
        }
    }

    /// Append a memory event
    pub fn add_memory_event(&mut self, event: Value) {
        self.memory_events.push(event);
    }

    /// Milliseconds from start to first chunk
    #[must_use]
    pub fn first_token_latency_ms(&self) -> Option<u64> {
        self.first_token_at.map(|t| t.saturating_sub(self.t0))
    }

    /// Milliseconds from start to finalization, or to `now`
    #[must_use]
    pub fn total_latency_ms(&self, now: u64) -> u64 {
        self.done_at.unwrap_or(now).saturating_sub(self.t0)
    }

    /// Concatenated emitted text
    #[must_use]
    pub fn content(&self) -> String {
        self.content_pieces.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn state() -> StreamState {
        StreamState::new("s-1", 1_000)
    }

    #[test]
    fn test_record_chunk_running_index() {
        let mut s = state();
        let a = s.record_chunk("He", None, 1_010);
        let b = s.record_chunk("llo", None, 1_020);

        assert_eq!(a.chunk_index, 0);
        assert!(a.first_chunk);
        assert_eq!(b.chunk_index, 1);
        assert!(!b.first_chunk);
        assert_eq!(b.total_bytes, 5);
        assert_eq!(s.chunks_count, 2);
        assert_eq!(s.first_token_at, Some(1_010));
        assert_eq!(s.content(), "Hello");
        assert_eq!(s.phase(), StreamPhase::Streaming);
    }

    #[test]
    fn test_record_chunk_explicit_index_never_decreases_count() {
        let mut s = state();
        s.record_chunk("a", Some(5), 1_001);
        assert_eq!(s.chunks_count, 6);
        s.record_chunk("b", Some(2), 1_002);
        assert_eq!(s.chunks_count, 6);
        let next = s.record_chunk("c", None, 1_003);
        assert_eq!(next.chunk_index, 6);
        assert_eq!(s.chunks_count, 7);
    }

    #[test]
    fn test_record_chunk_index_at_upper_bound() {
        let mut s = state();
        let rec = s.record_chunk("hi", Some(u64::MAX), 1_001);
        assert_eq!(rec.chunk_index, u64::MAX);
        assert_eq!(s.chunks_count, u64::MAX);

        let next = s.record_chunk("there", None, 1_002);
        assert_eq!(next.chunk_index, u64::MAX);
        assert_eq!(s.chunks_count, u64::MAX);
        assert_eq!(s.content(), "hithere");
    }

    #[test]
    fn test_record_chunk_counts_utf8_bytes() {
        let mut s = state();
        let rec = s.record_chunk("não", None, 1_001);
        assert_eq!(rec.chunk_bytes, 4);
    }

    #[test]
    fn test_mark_done_once() {
        let mut s = state();
        assert!(s.mark_done(2_000));
        assert!(!s.mark_done(3_000));
        assert_eq!(s.done_at, Some(2_000));
        assert_eq!(s.total_latency_ms(9_999), 1_000);
        assert_eq!(s.phase(), StreamPhase::Done);
    }

    #[test]
    fn test_prompt_ready_once() {
        let mut s = state();
        assert!(s.mark_prompt_ready(1_005));
        assert!(!s.mark_prompt_ready(1_006));
        assert_eq!(s.prompt_ready_at, Some(1_005));
        assert_eq!(s.phase(), StreamPhase::PromptReady);
    }

    #[test]
    fn test_finish_reason_first_writer_wins() {
        let mut s = state();
        s.ensure_finish_reason(FinishReason::Error);
        s.ensure_finish_reason(FinishReason::Stop);
        assert_eq!(s.finish_reason, Some(FinishReason::Error));
        s.set_finish_reason(FinishReason::FirstTokenTimeout);
        assert_eq!(s.finish_reason, Some(FinishReason::FirstTokenTimeout));
    }

    #[test]
    fn test_provider_finish_reason_mapping() {
        assert_eq!(FinishReason::from_provider("stop"), (FinishReason::Stop, None));
        assert_eq!(FinishReason::from_provider("DONE"), (FinishReason::Stop, None));
        assert_eq!(
            FinishReason::from_provider("content_filter"),
            (FinishReason::Unknown, Some("content_filter".to_string()))
        );
    }

    #[test]
    fn test_close_classification_table() {
        let s = state();
        assert_eq!(s.classify_close(None), CloseClassification::Unknown);
        assert_eq!(
            s.classify_close(Some(&CloseSource::ReqClose)),
            CloseClassification::ClientClosed
        );
        assert_eq!(
            s.classify_close(Some(&CloseSource::ResWrite)),
            CloseClassification::ClientClosed
        );
        assert_eq!(
            s.classify_close(Some(&CloseSource::ReqAborted)),
            CloseClassification::ProxyClosed
        );
        assert_eq!(
            s.classify_close(Some(&CloseSource::ResError)),
            CloseClassification::ProxyClosed
        );
        assert_eq!(
            s.classify_close(Some(&CloseSource::ServerAbort)),
            CloseClassification::ServerAbort
        );
        assert_eq!(
            s.classify_close(Some(&CloseSource::ResClose)),
            CloseClassification::ProxyClosed
        );
        assert_eq!(
            s.classify_close(Some(&CloseSource::parse("socket.weird"))),
            CloseClassification::Unknown
        );
    }

    #[test]
    fn test_res_close_after_server_abort_or_done() {
        let mut s = state();
        s.set_server_abort_reason("idle_timeout");
        assert_eq!(
            s.classify_close(Some(&CloseSource::ResClose)),
            CloseClassification::ServerAbort
        );
        assert_eq!(s.classify_close(None), CloseClassification::ServerAbort);

        let mut s = state();
        s.mark_done(1_500);
        assert_eq!(
            s.classify_close(Some(&CloseSource::ResClose)),
            CloseClassification::ServerAbort
        );
    }

    #[test]
    fn test_client_closed_is_sticky() {
        let mut s = state();
        assert_eq!(
            s.mark_connection_closed(CloseSource::ReqClose, Some("  gone "), 1_100),
            CloseClassification::ClientClosed
        );
        assert_eq!(
            s.mark_connection_closed(CloseSource::ResClose, Some("later"), 1_200),
            CloseClassification::ClientClosed
        );
        assert_eq!(
            s.mark_connection_closed(CloseSource::ServerAbort, None, 1_300),
            CloseClassification::ClientClosed
        );
        assert!(s.client_closed);
        assert_eq!(s.close_source, Some(CloseSource::ReqClose));
        assert_eq!(s.close_at, Some(1_100));
        assert_eq!(s.close_error.as_deref(), Some("gone"));
    }

    #[test]
    fn test_proxy_close_can_be_upgraded_to_client() {
        let mut s = state();
        s.mark_connection_closed(CloseSource::ReqAborted, None, 1_100);
        assert_eq!(
            s.mark_connection_closed(CloseSource::ResWrite, None, 1_200),
            CloseClassification::ClientClosed
        );
        assert!(s.client_closed);
    }

    #[test]
    fn test_usage_tokens_variants() {
        let mut s = state();
        s.update_usage_tokens(&json!({"usage": {"prompt_tokens": 12, "completion_tokens": 40}}));
        assert_eq!(s.usage, UsageTokens { input: Some(12), output: Some(40) });

        let mut s = state();
        s.update_usage_tokens(&json!({"token_usage": {"tokens_in": 3}, "output_tokens": 9}));
        assert_eq!(s.usage, UsageTokens { input: Some(3), output: Some(9) });

        let mut s = state();
        s.update_usage_tokens(&json!("nope"));
        assert_eq!(s.usage, UsageTokens::default());
    }

    #[test]
    fn test_guard_fallback_once() {
        let mut s = state();
        assert!(s.mark_guard_fallback("no_chunks"));
        assert!(!s.mark_guard_fallback("again"));
        assert_eq!(s.guard_fallback_reason.as_deref(), Some("no_chunks"));
    }

    #[test]
    fn test_merge_meta() {
        let mut s = state();
        let a = json!({"a": 1, "b": 1});
        let b = json!({"b": 2});
        s.merge_meta(a.as_object().unwrap());
        s.merge_meta(b.as_object().unwrap());
        assert_eq!(Value::Object(s.meta_payload.clone()), json!({"a": 1, "b": 2}));
    }
}
