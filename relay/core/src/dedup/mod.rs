//! Reservation Registries
//!
//! Two independent, TTL-bounded keyed registries guard against duplicate work:
//!
//! - [`ClientMessageRegistry`]: idempotency on the caller-supplied message id.
//!   Entries are `active` while streaming and demoted to `completed` (with a
//!   longer TTL and the terminal outcome) once the stream finalizes.
//! - [`ActiveInteractionRegistry`]: single-flight lock per interaction, holding
//!   the session's cancellation token. A cancelled token counts as expired.
//!
//! Each registry owns its own lock. Every operation prunes expired entries
//! (`created_at + ttl <= now`) before doing anything else, so check-and-claim
//! is one critical section.

mod active_interaction;
mod client_message;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use active_interaction::ActiveInteractionRegistry;
pub use client_message::ClientMessageRegistry;

/// Global counter for owner tokens
static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Proof of ownership handed out by a successful reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerToken(u64);

impl OwnerToken {
    /// Allocate a fresh, process-unique token
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Lifecycle of a reservation entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// A stream for this key is in flight
    Active,
    /// A stream for this key already finished
    Completed,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// What a finished stream reported, kept for idempotent replay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutcome {
    /// Final finish reason (`stop`, `error`, ...)
    pub finish_reason: String,
    /// Resolved interaction id, if any
    pub interaction_id: Option<String>,
    /// Whether the guard fallback chunk was sent
    pub guard_fallback: bool,
}

/// Result of a `reserve` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The key is now owned by the caller
    Reserved(OwnerToken),
    /// A live entry already holds the key
    Duplicate {
        /// Status of the existing entry
        status: ReservationStatus,
        /// Terminal outcome when the existing entry completed
        outcome: Option<TerminalOutcome>,
    },
}

impl ReserveOutcome {
    /// Whether the reservation succeeded
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved(_))
    }

    /// Owner token when reserved
    #[must_use]
    pub fn owner(&self) -> Option<OwnerToken> {
        match self {
            Self::Reserved(token) => Some(*token),
            Self::Duplicate { .. } => None,
        }
    }
}

// ============================================================================
// Key construction
// ============================================================================

/// Namespace of an active-interaction key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InteractionKeyKind {
    /// Keyed by the client message id
    Client,
    /// Keyed by a server-side interaction or stream id
    Interaction,
}

/// Build `{client|interaction}:{value}`; `None` for a blank value
#[must_use]
pub fn active_interaction_key(kind: InteractionKeyKind, value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let prefix = match kind {
        InteractionKeyKind::Client => "client",
        InteractionKeyKind::Interaction => "interaction",
    };
    Some(format!("{prefix}:{value}"))
}

/// Build `{identity}:{message_id}`, or `message_id` alone without identity
#[must_use]
pub fn client_message_key(identity: Option<&str>, message_id: &str) -> Option<String> {
    let message_id = message_id.trim();
    if message_id.is_empty() {
        return None;
    }
    match identity.map(str::trim).filter(|i| !i.is_empty()) {
        Some(identity) => Some(format!("{identity}:{message_id}")),
        None => Some(message_id.to_string()),
    }
}

// ============================================================================
// Session guard
// ============================================================================

/// Both reservations held by one streaming session
///
/// [`finalize`](Self::finalize) releases the interaction lock and demotes the
/// client-message entry to `completed`. It runs at most once; dropping an
/// unfinalized guard releases both entries outright.
pub struct SessionReservations {
    client_messages: Arc<ClientMessageRegistry>,
    interactions: Arc<ActiveInteractionRegistry>,
    client_message: Option<(String, OwnerToken)>,
    interaction: Option<(String, OwnerToken)>,
    finalized: bool,
}

impl SessionReservations {
    /// Wrap reservations already taken by the caller
    #[must_use]
    pub fn new(
        client_messages: Arc<ClientMessageRegistry>,
        interactions: Arc<ActiveInteractionRegistry>,
        client_message: Option<(String, OwnerToken)>,
        interaction: Option<(String, OwnerToken)>,
    ) -> Self {
        Self {
            client_messages,
            interactions,
            client_message,
            interaction,
            finalized: false,
        }
    }

    /// Client-message key held by this session
    #[must_use]
    pub fn client_message_key(&self) -> Option<&str> {
        self.client_message.as_ref().map(|(k, _)| k.as_str())
    }

    /// Active-interaction key held by this session
    #[must_use]
    pub fn interaction_key(&self) -> Option<&str> {
        self.interaction.as_ref().map(|(k, _)| k.as_str())
    }

    /// Release the interaction lock and mark the message completed
    pub fn finalize(&mut self, outcome: TerminalOutcome) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        if let Some((key, owner)) = &self.interaction {
            let released = self.interactions.release(key, *owner);
            tracing::debug!(key = %key, released, "Released interaction reservation");
        }
        if let Some((key, owner)) = &self.client_message {
            let marked = self.client_messages.mark_completed(key, *owner, Some(outcome));
            tracing::debug!(key = %key, marked, "Marked client message completed");
        }
    }

    /// Whether [`finalize`](Self::finalize) already ran
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl Drop for SessionReservations {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        if let Some((key, owner)) = self.interaction.take() {
            self.interactions.release(&key, owner);
        }
        if let Some((key, owner)) = self.client_message.take() {
            self.client_messages.release(&key, owner);
        }
    }
}

impl fmt::Debug for SessionReservations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionReservations")
            .field("client_message", &self.client_message)
            .field("interaction", &self.interaction)
            .field("finalized", &self.finalized)
            .finish()
    }
}
