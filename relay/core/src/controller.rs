//! Stream Controller
//!
//! Request-level entry point. For each request it:
//!
//! 1. reserves the client message id (idempotency)
//! 2. reserves the active interaction key (single flight)
//! 3. opens a channel-backed SSE transport
//! 4. starts interaction creation in the background
//! 5. spawns the session task: provider stream → [`EventForwarder`]
//!
//! The caller gets the outbound byte stream immediately; the session task
//! owns everything else, including releasing the reservations.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::{RelayConfig, StreamConfig};
use crate::dedup::{
    active_interaction_key, client_message_key, ActiveInteractionRegistry, ClientMessageRegistry,
    InteractionKeyKind, ReserveOutcome, SessionReservations,
};
use crate::error::RelayError;
use crate::persistence::{InteractionSeed, Persistence};
use crate::provider::{GenerationProvider, GenerationRequest};
use crate::request::StreamRequest;
use crate::streaming::{EventForwarder, ProviderEvent, SessionSummary, StreamState};
use crate::telemetry::TelemetryQueue;
use crate::transport::ChannelTransport;

/// A stream that was admitted and is running
#[derive(Debug)]
pub struct OpenedStream {
    /// Server-assigned stream id
    pub stream_id: String,
    /// Client message id the stream was admitted under
    pub client_message_id: Option<String>,
    /// Encoded SSE frames
    pub body: mpsc::Receiver<Bytes>,
    /// Session task
    pub session: JoinHandle<SessionSummary>,
}

impl OpenedStream {
    /// Body as a `Stream`, detaching the session task
    #[must_use]
    pub fn into_body_stream(self) -> ReceiverStream<Bytes> {
        ReceiverStream::new(self.body)
    }
}

/// Live counts for health reporting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    /// Running sessions
    pub active_sessions: usize,
    /// Held interaction locks
    pub active_interactions: usize,
    /// Client message entries in flight
    pub active_client_messages: usize,
    /// All client message entries, completed included
    pub client_messages: usize,
}

/// Admits requests and runs their sessions
pub struct StreamController {
    provider: Arc<dyn GenerationProvider>,
    persistence: Arc<dyn Persistence>,
    client_messages: Arc<ClientMessageRegistry>,
    interactions: Arc<ActiveInteractionRegistry>,
    sessions: Arc<DashMap<String, CancellationToken>>,
    stream_config: StreamConfig,
    model: String,
    clock: SharedClock,
    shutdown: CancellationToken,
}

impl StreamController {
    /// Build a controller
    ///
    /// Registry TTLs are taken from `config` once, here.
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        persistence: Arc<dyn Persistence>,
        config: &RelayConfig,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            provider,
            persistence,
            client_messages: Arc::new(ClientMessageRegistry::from_config(&config.dedup, Arc::clone(&clock))),
            interactions: Arc::new(ActiveInteractionRegistry::from_config(&config.dedup, Arc::clone(&clock))),
            sessions: Arc::new(DashMap::new()),
            stream_config: config.stream.clone(),
            model: config.provider.model.clone(),
            clock,
            shutdown,
        }
    }

    /// Client message registry
    #[must_use]
    pub fn client_messages(&self) -> &ClientMessageRegistry {
        &self.client_messages
    }

    /// Active interaction registry
    #[must_use]
    pub fn interactions(&self) -> &ActiveInteractionRegistry {
        &self.interactions
    }

    /// Process-wide shutdown token
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Live counts
    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            active_sessions: self.sessions.len(),
            active_interactions: self.interactions.len(),
            active_client_messages: self.client_messages.active_count(),
            client_messages: self.client_messages.len(),
        }
    }

    /// Abort a running stream
    pub fn cancel_stream(&self, stream_id: &str) -> bool {
        match self.sessions.get(stream_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until every session finished, up to `timeout`
    ///
    /// Returns whether the controller drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            while !self.sessions.is_empty() {
                tick.tick().await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Admit `request` and start streaming
    ///
    /// # Errors
    ///
    /// - [`RelayError::InvalidRequest`] for an empty prompt
    /// - [`RelayError::Duplicate`] when the client message id is live
    /// - [`RelayError::InteractionBusy`] when another stream holds the
    ///   interaction
    pub async fn open(&self, request: StreamRequest) -> Result<OpenedStream, RelayError> {
        if request.prompt.trim().is_empty() {
            return Err(RelayError::InvalidRequest("missing prompt".into()));
        }
        let stream_id = Uuid::new_v4().to_string();
        let identity_key = request.identity.key();

        let client_message = match request
            .client_message_id
            .as_deref()
            .and_then(|id| client_message_key(identity_key.as_deref(), id))
        {
            Some(key) => match self.client_messages.reserve(&key) {
                ReserveOutcome::Reserved(owner) => Some((key, owner)),
                ReserveOutcome::Duplicate { status, outcome } => {
                    tracing::info!(key = %key, status = %status, "Duplicate client message rejected");
                    return Err(RelayError::Duplicate { key, status, outcome });
                }
            },
            None => None,
        };

        let cancel = self.shutdown.child_token();
        let interaction_key = request
            .client_message_id
            .as_deref()
            .and_then(|id| active_interaction_key(InteractionKeyKind::Client, id))
            .or_else(|| active_interaction_key(InteractionKeyKind::Interaction, &stream_id));

        let interaction = match interaction_key {
            Some(key) => match self.interactions.reserve(&key, cancel.clone()) {
                ReserveOutcome::Reserved(owner) => Some((key, owner)),
                ReserveOutcome::Duplicate { .. } => {
                    if let Some((cm_key, owner)) = client_message {
                        self.client_messages.release(&cm_key, owner);
                    }
                    tracing::info!(key = %key, "Interaction already streaming");
                    return Err(RelayError::InteractionBusy { key });
                }
            },
            None => None,
        };

        let reservations = SessionReservations::new(
            Arc::clone(&self.client_messages),
            Arc::clone(&self.interactions),
            client_message,
            interaction,
        );

        let (transport, body) = ChannelTransport::pair_with_write_timeout(
            self.stream_config.channel_capacity,
            self.stream_config.write_timeout(),
        );
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());

        let seed = InteractionSeed {
            stream_id: stream_id.clone(),
            client_message_id: request.client_message_id.clone(),
            user_id: request.identity.user_id.clone(),
            guest_id: request.identity.guest_id.clone(),
            session_id: request.identity.session_id.clone(),
            prompt: request.prompt.clone(),
            model: Some(model.clone()),
        };
        let persistence = Arc::clone(&self.persistence);
        let bootstrap = tokio::spawn(async move {
            match persistence.create_interaction(&seed).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(stream_id = %seed.stream_id, error = %e, "Interaction creation failed");
                    None
                }
            }
        });

        let state = StreamState::new(stream_id.clone(), self.clock.now_ms())
            .with_client_message_id(request.client_message_id.clone())
            .with_origin(request.origin.clone());
        let telemetry = TelemetryQueue::new(Arc::clone(&self.persistence), stream_id.clone());

        let mut generation = GenerationRequest::new(request.prompt.clone(), model).with_stream_id(stream_id.clone());
        if let Some(system) = &request.system {
            generation = generation.with_system(system.clone());
        }
        if let Some(temperature) = request.temperature {
            generation = generation.with_temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            generation = generation.with_max_tokens(max_tokens);
        }

        let span = tracing::info_span!(
            "stream",
            stream_id = %stream_id,
            client_message_id = ?request.client_message_id,
            origin = ?request.origin,
        );

        self.sessions.insert(stream_id.clone(), cancel.clone());
        let sessions = Arc::clone(&self.sessions);
        let provider = Arc::clone(&self.provider);
        let config = self.stream_config.clone();
        let clock = Arc::clone(&self.clock);

        let session = tokio::spawn(
            async move {
                let forwarder = EventForwarder::new(state, transport, telemetry, config, clock)
                    .with_bootstrap(bootstrap)
                    .with_reservations(reservations);

                let events = match provider.stream_completion(&generation, cancel.clone()).await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(provider = provider.name(), error = %e, "Provider failed to start");
                        let (tx, rx) = mpsc::channel(1);
                        let _ = tx.try_send(ProviderEvent::error(e.to_string()));
                        rx
                    }
                };

                let summary = forwarder.run(events, cancel).await;
                sessions.remove(&summary.stream_id);
                summary
            }
            .instrument(span),
        );

        Ok(OpenedStream {
            stream_id,
            client_message_id: request.client_message_id,
            body,
            session,
        })
    }
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::dedup::ReservationStatus;
    use crate::persistence::InMemoryPersistence;
    use crate::provider::ScriptedProvider;
    use crate::streaming::FinishReason;

    fn controller(provider: ScriptedProvider) -> (StreamController, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let mut config = RelayConfig::default();
        config.stream = config.stream.without_heartbeat();
        let controller = StreamController::new(
            provider.clone(),
            Arc::new(InMemoryPersistence::new()),
            &config,
            SystemClock::shared(),
            CancellationToken::new(),
        );
        (controller, provider)
    }

    fn hello() -> ScriptedProvider {
        ScriptedProvider::from_events(vec![
            ProviderEvent::control(crate::streaming::ControlSignal::PromptReady),
            ProviderEvent::delta("Hel"),
            ProviderEvent::delta("lo"),
            ProviderEvent::done_with_reason("stop"),
        ])
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let (controller, provider) = controller(hello());
        let err = controller.open(StreamRequest::new("  ")).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_completed_replay_returns_outcome() {
        let (controller, provider) = controller(hello());
        let opened = controller
            .open(StreamRequest::new("Hello").with_client_message_id("m-1"))
            .await
            .unwrap();
        let summary = opened.session.await.unwrap();
        assert_eq!(summary.finish_reason, FinishReason::Stop);
        assert_eq!(summary.content, "Hello");

        let err = controller
            .open(StreamRequest::new("Hello").with_client_message_id("m-1"))
            .await
            .unwrap_err();
        let RelayError::Duplicate { status, outcome, .. } = err else {
            panic!("expected duplicate, got {err:?}");
        };
        assert_eq!(status, ReservationStatus::Completed);
        assert_eq!(outcome.map(|o| o.finish_reason), Some("stop".to_string()));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_provider_start_failure_still_finalizes() {
        let (controller, _) = controller(ScriptedProvider::failing("connection refused"));
        let opened = controller.open(StreamRequest::new("Hello")).await.unwrap();
        let summary = opened.session.await.unwrap();
        assert_eq!(summary.finish_reason, FinishReason::Error);
        assert!(summary.guard_fallback);
        assert!(summary.done_frame_written);
        assert_eq!(controller.stats().active_sessions, 0);
        assert_eq!(controller.stats().active_interactions, 0);
    }
}
