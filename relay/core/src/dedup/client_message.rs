//! Client message id registry

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use super::{OwnerToken, ReservationStatus, ReserveOutcome, TerminalOutcome};
use crate::clock::SharedClock;
use crate::config::DedupConfig;

#[derive(Debug)]
struct Entry {
    owner: OwnerToken,
    created_at: u64,
    ttl_ms: u64,
    status: ReservationStatus,
    outcome: Option<TerminalOutcome>,
}

impl Entry {
    fn expired(&self, now: u64) -> bool {
        self.created_at.saturating_add(self.ttl_ms) <= now
    }
}

/// Idempotency registry keyed by `{identity}:{message_id}`
#[derive(Debug)]
pub struct ClientMessageRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    active_ttl_ms: u64,
    completed_ttl_ms: u64,
    clock: SharedClock,
}

impl ClientMessageRegistry {
    /// Create a registry with fixed TTLs
    #[must_use]
    pub fn new(active_ttl: Duration, completed_ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            active_ttl_ms: u64::try_from(active_ttl.as_millis()).unwrap_or(u64::MAX),
            completed_ttl_ms: u64::try_from(completed_ttl.as_millis()).unwrap_or(u64::MAX),
            clock,
        }
    }

    /// Create a registry from the dedup config section
    #[must_use]
    pub fn from_config(config: &DedupConfig, clock: SharedClock) -> Self {
        Self::new(
            Duration::from_millis(config.client_message_active_ttl_ms),
            Duration::from_millis(config.client_message_completed_ttl_ms),
            clock,
        )
    }

    fn prune(entries: &mut HashMap<String, Entry>, now: u64) {
        entries.retain(|_, entry| !entry.expired(now));
    }

    /// Claim `key` as active
    ///
    /// A live entry yields [`ReserveOutcome::Duplicate`] with its status, and
    /// the stored terminal outcome once it completed.
    pub fn reserve(&self, key: &str) -> ReserveOutcome {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);

        if let Some(existing) = entries.get(key) {
            return ReserveOutcome::Duplicate {
                status: existing.status,
                outcome: existing.outcome.clone(),
            };
        }

        let owner = OwnerToken::new();
        entries.insert(
            key.to_string(),
            Entry {
                owner,
                created_at: now,
                ttl_ms: self.active_ttl_ms,
                status: ReservationStatus::Active,
                outcome: None,
            },
        );
        ReserveOutcome::Reserved(owner)
    }

    /// Remove `key` if `owner` still holds it
    pub fn release(&self, key: &str, owner: OwnerToken) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);

        match entries.get(key) {
            Some(entry) if entry.owner == owner => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Demote `key` to completed with the completed TTL
    ///
    /// Only the current owner can demote the entry.
    pub fn mark_completed(
        &self,
        key: &str,
        owner: OwnerToken,
        outcome: Option<TerminalOutcome>,
    ) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);

        match entries.get_mut(key) {
            Some(entry) if entry.owner == owner => {
                entry.status = ReservationStatus::Completed;
                entry.created_at = now;
                entry.ttl_ms = self.completed_ttl_ms;
                entry.outcome = outcome;
                true
            }
            _ => false,
        }
    }

    /// Status of a live entry
    pub fn status(&self, key: &str) -> Option<ReservationStatus> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        entries.get(key).map(|e| e.status)
    }

    /// Number of live active entries
    pub fn active_count(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        entries
            .values()
            .filter(|e| e.status == ReservationStatus::Active)
            .count()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        entries.len()
    }

    /// Whether the registry holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
