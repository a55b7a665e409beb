//! Streaming session internals
//!
//! - [`events`]: the closed set of upstream events and text helpers
//! - [`state`]: per-session mutable record and close classification
//! - [`forwarder`]: the policy engine that turns events into frames

pub mod events;
pub mod forwarder;
pub mod state;

pub use events::{extract_event_text, extract_text_loose, is_keepalive_artifact, sanitize_output, ControlSignal, ProviderEvent};
pub use forwarder::{EventForwarder, InteractionBootstrap, SessionSummary, GUARD_FALLBACK_TEXT};
pub use state::{
    ChunkRecord, CloseClassification, CloseSource, FinishReason, StreamPhase, StreamState, UsageTokens,
};
