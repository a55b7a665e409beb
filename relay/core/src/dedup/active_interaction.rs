//! Active interaction lock registry

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{OwnerToken, ReservationStatus, ReserveOutcome};
use crate::clock::SharedClock;
use crate::config::DedupConfig;

#[derive(Debug)]
struct Entry {
    owner: OwnerToken,
    created_at: u64,
    cancel: CancellationToken,
}

/// Single-flight lock per interaction key
///
/// Each entry carries the owning session's cancellation token. An entry whose
/// token has been cancelled is treated as expired.
#[derive(Debug)]
pub struct ActiveInteractionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    ttl_ms: u64,
    clock: SharedClock,
}

impl ActiveInteractionRegistry {
    /// Create a registry with a fixed TTL
    #[must_use]
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            clock,
        }
    }

    /// Create a registry from the dedup config section
    #[must_use]
    pub fn from_config(config: &DedupConfig, clock: SharedClock) -> Self {
        Self::new(
            Duration::from_millis(config.active_interaction_ttl_ms),
            clock,
        )
    }

    fn prune(&self, entries: &mut HashMap<String, Entry>, now: u64) {
        let ttl = self.ttl_ms;
        entries.retain(|_, e| e.created_at.saturating_add(ttl) > now && !e.cancel.is_cancelled());
    }

    /// Claim `key` for the session owning `cancel`
    ///
    /// A blank key always succeeds without being recorded.
    pub fn reserve(&self, key: &str, cancel: CancellationToken) -> ReserveOutcome {
        let key = key.trim();
        if key.is_empty() {
            return ReserveOutcome::Reserved(OwnerToken::new());
        }

        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);

        if entries.contains_key(key) {
            return ReserveOutcome::Duplicate {
                status: ReservationStatus::Active,
                outcome: None,
            };
        }

        let owner = OwnerToken::new();
        entries.insert(
            key.to_string(),
            Entry {
                owner,
                created_at: now,
                cancel,
            },
        );
        ReserveOutcome::Reserved(owner)
    }

    /// Remove `key` if `owner` still holds it
    pub fn release(&self, key: &str, owner: OwnerToken) -> bool {
        let key = key.trim();
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);

        match entries.get(key) {
            Some(entry) if entry.owner == owner => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Cancel the session holding `key`, if any
    pub fn cancel(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);
        match entries.remove(key.trim()) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live locks
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        self.prune(&mut entries, now);
        entries.len()
    }

    /// Whether no lock is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
