//! Relay Core - Streaming Session Controller for SSE chat responses
//!
//! This crate owns everything between "a request arrived" and "the last
//! byte of the event stream was written": duplicate suppression, the
//! per-session state machine, the upstream event policy, telemetry
//! correlation and SSE framing. It has no HTTP server dependency; the
//! daemon crate mounts it behind a route.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         HTTP surface                             │
//! │               POST /ask  ──►  StreamController::open             │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          RELAY CORE                              │
//! │  ┌────────────────────┐       │       ┌────────────────────────┐ │
//! │  │ ClientMessage      │◄──────┤──────►│ ActiveInteraction      │ │
//! │  │ Registry (idem.)   │       │       │ Registry (single)      │ │
//! │  └────────────────────┘       ▼       └────────────────────────┘ │
//! │  ┌──────────────┐    ┌─────────────────┐    ┌─────────────────┐  │
//! │  │ Generation   │───►│ EventForwarder  │───►│ SseTransport    │──┼─► client
//! │  │ Provider     │    │  + StreamState  │    │ (+ heartbeats)  │  │
//! │  └──────────────┘    └────────┬────────┘    └─────────────────┘  │
//! │                               ▼                                  │
//! │                      ┌─────────────────┐    ┌─────────────────┐  │
//! │                      │ TelemetryQueue  │───►│ Persistence     │  │
//! │                      └─────────────────┘    └─────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamController`]: admits requests and spawns session tasks
//! - [`EventForwarder`]: per-session policy engine and finalization
//! - [`StreamState`]: mutable record of one session
//! - [`ClientMessageRegistry`] / [`ActiveInteractionRegistry`]: TTL registries
//! - [`TelemetryQueue`]: ordered signals awaiting the interaction id
//! - [`SseTransport`]: outbound frames
//!
//! # Module Overview
//!
//! - [`clock`]: injectable millisecond clock
//! - [`config`]: TOML and environment configuration
//! - [`controller`]: request-level control flow
//! - [`dedup`]: reservation registries
//! - [`error`]: admission errors
//! - [`persistence`]: interaction and signal store
//! - [`provider`]: upstream generation providers
//! - [`request`]: inbound correlation and prompt parsing
//! - [`streaming`]: events, stream state and the forwarder
//! - [`telemetry`]: correlated passive signals
//! - [`transport`]: SSE framing, channel transport and heartbeats

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod error;
pub mod persistence;
pub mod provider;
pub mod request;
pub mod streaming;
pub mod telemetry;
pub mod transport;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    default_config_path, load_config, ConfigError, DedupConfig, ProviderConfig, ProviderKind,
    RelayConfig, ServerConfig, StreamConfig,
};
pub use controller::{ControllerStats, OpenedStream, StreamController};
pub use dedup::{
    ActiveInteractionRegistry, ClientMessageRegistry, OwnerToken, ReservationStatus, ReserveOutcome,
    SessionReservations, TerminalOutcome,
};
pub use error::RelayError;
pub use persistence::{InMemoryPersistence, InteractionSeed, Persistence, PersistenceError};
pub use provider::{EchoProvider, GenerationProvider, GenerationRequest, OllamaProvider, ScriptStep, ScriptedProvider};
pub use request::{RequestIdentity, StreamRequest};
pub use streaming::{
    CloseClassification, CloseSource, ControlSignal, EventForwarder, FinishReason, ProviderEvent,
    SessionSummary, StreamState,
};
pub use telemetry::{TelemetryQueue, TelemetryReport, TelemetrySignal};
pub use transport::{ChannelTransport, SseFrame, SseTransport, TransportError};
