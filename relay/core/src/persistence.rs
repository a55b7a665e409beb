//! Persistence collaborator
//!
//! The relay only needs two calls from the store: create the interaction row
//! that telemetry hangs off, and insert passive signals against it.
//! [`InMemoryPersistence`] backs the daemon and the tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Data used to create an interaction record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionSeed {
    /// Server-assigned stream id
    pub stream_id: String,
    /// Caller-supplied idempotency key
    pub client_message_id: Option<String>,
    /// Authenticated user
    pub user_id: Option<String>,
    /// Anonymous guest
    pub guest_id: Option<String>,
    /// Client session
    pub session_id: Option<String>,
    /// Prompt text
    pub prompt: String,
    /// Model requested
    pub model: Option<String>,
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The referenced interaction row does not exist (yet)
    #[error("interaction {0} does not exist")]
    MissingInteraction(String),
    /// Any other backend failure
    #[error("persistence backend error: {0}")]
    Backend(String),
}

impl PersistenceError {
    /// Whether the failure is a missing parent row, which may resolve itself
    #[must_use]
    pub fn is_missing_interaction(&self) -> bool {
        matches!(self, Self::MissingInteraction(_))
    }
}

/// Store for interactions and passive signals
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Create an interaction record, returning its id when the store assigns one
    async fn create_interaction(
        &self,
        seed: &InteractionSeed,
    ) -> Result<Option<String>, PersistenceError>;

    /// Insert a passive analytics signal for an interaction
    async fn insert_passive_signal(
        &self,
        interaction_id: &str,
        signal: &str,
        meta: &Map<String, Value>,
    ) -> Result<(), PersistenceError>;
}

/// A signal row held by [`InMemoryPersistence`]
#[derive(Clone, Debug, PartialEq)]
pub struct StoredSignal {
    /// Parent interaction
    pub interaction_id: String,
    /// Signal name
    pub signal: String,
    /// Signal metadata
    pub meta: Map<String, Value>,
}

/// In-process store
///
/// Signals referencing an unknown interaction fail with
/// [`PersistenceError::MissingInteraction`], like a foreign key would.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    interactions: DashMap<String, InteractionSeed>,
    signals: Mutex<Vec<StoredSignal>>,
    create_delay: Option<Duration>,
    fail_create: AtomicBool,
    fail_signals: AtomicBool,
    missing_interaction_failures: AtomicU32,
}

impl InMemoryPersistence {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `create_interaction` call
    #[must_use]
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Make `create_interaction` fail
    #[must_use]
    pub fn with_failing_create(self) -> Self {
        self.fail_create.store(true, Ordering::Relaxed);
        self
    }

    /// Make every signal insert fail with a backend error
    pub fn set_fail_signals(&self, fail: bool) {
        self.fail_signals.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `n` signal inserts as if the parent row were missing
    pub fn fail_next_inserts_with_missing_interaction(&self, n: u32) {
        self.missing_interaction_failures.store(n, Ordering::Relaxed);
    }

    /// Register an interaction created elsewhere
    pub fn register_interaction(&self, id: impl Into<String>) {
        self.interactions.insert(id.into(), InteractionSeed::default());
    }

    /// Seed of a stored interaction
    #[must_use]
    pub fn interaction(&self, id: &str) -> Option<InteractionSeed> {
        self.interactions.get(id).map(|e| e.value().clone())
    }

    /// Number of stored interactions
    #[must_use]
    pub fn interaction_count(&self) -> usize {
        self.interactions.len()
    }

    /// Stored signals in insertion order
    #[must_use]
    pub fn signals(&self) -> Vec<StoredSignal> {
        self.signals.lock().clone()
    }

    /// Stored signal names in insertion order
    #[must_use]
    pub fn signal_names(&self) -> Vec<String> {
        self.signals.lock().iter().map(|s| s.signal.clone()).collect()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn create_interaction(
        &self,
        seed: &InteractionSeed,
    ) -> Result<Option<String>, PersistenceError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::Relaxed) {
            return Err(PersistenceError::Backend("create_interaction disabled".to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.interactions.insert(id.clone(), seed.clone());
        Ok(Some(id))
    }

    async fn insert_passive_signal(
        &self,
        interaction_id: &str,
        signal: &str,
        meta: &Map<String, Value>,
    ) -> Result<(), PersistenceError> {
        if self.fail_signals.load(Ordering::Relaxed) {
            return Err(PersistenceError::Backend("signal insert disabled".to_string()));
        }
        let forced_missing = self
            .missing_interaction_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if forced_missing || !self.interactions.contains_key(interaction_id) {
            return Err(PersistenceError::MissingInteraction(interaction_id.to_string()));
        }
        self.signals.lock().push(StoredSignal {
            interaction_id: interaction_id.to_string(),
            signal: signal.to_string(),
            meta: meta.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_insert() {
        let store = InMemoryPersistence::new();
        let id = store
            .create_interaction(&InteractionSeed {
                stream_id: "s-1".to_string(),
                prompt: "hi".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();

        store
            .insert_passive_signal(&id, "prompt_ready", &Map::new())
            .await
            .unwrap();
        assert_eq!(store.signal_names(), vec!["prompt_ready".to_string()]);
        assert_eq!(store.interaction(&id).unwrap().stream_id, "s-1");
    }

    #[tokio::test]
    async fn test_unknown_interaction_is_missing() {
        let store = InMemoryPersistence::new();
        let err = store
            .insert_passive_signal("nope", "done", &Map::new())
            .await
            .unwrap_err();
        assert!(err.is_missing_interaction());
    }

    #[tokio::test]
    async fn test_forced_missing_failures_count_down() {
        let store = InMemoryPersistence::new();
        store.register_interaction("int-1");
        store.fail_next_inserts_with_missing_interaction(1);

        assert!(store
            .insert_passive_signal("int-1", "done", &Map::new())
            .await
            .is_err());
        assert!(store
            .insert_passive_signal("int-1", "done", &Map::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_failing_create() {
        let store = InMemoryPersistence::new().with_failing_create();
        assert!(store
            .create_interaction(&InteractionSeed::default())
            .await
            .is_err());
        assert_eq!(store.interaction_count(), 0);
    }
}
