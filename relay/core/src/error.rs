//! Session-level errors
//!
//! Only admission can fail. Once a stream is open every failure is folded
//! into the terminal frame instead of surfacing here.

use thiserror::Error;

use crate::config::ConfigError;
use crate::dedup::{ReservationStatus, TerminalOutcome};

/// Errors returned when opening a stream
#[derive(Debug, Error)]
pub enum RelayError {
    /// The client message id was already seen
    #[error("duplicate client message {key} ({status})")]
    Duplicate {
        /// Registry key
        key: String,
        /// State of the earlier request
        status: ReservationStatus,
        /// Terminal outcome of the earlier request, when it completed
        outcome: Option<TerminalOutcome>,
    },

    /// Another stream holds the interaction key
    #[error("interaction {key} already streaming")]
    InteractionBusy {
        /// Registry key
        key: String,
    },

    /// The request could not be understood
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration problem
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RelayError {
    /// Whether the request was rejected as a replay
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. } | Self::InteractionBusy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_display() {
        let err = RelayError::Duplicate {
            key: "user:u1:m1".into(),
            status: ReservationStatus::Completed,
            outcome: None,
        };
        assert_eq!(err.to_string(), "duplicate client message user:u1:m1 (completed)");
        assert!(err.is_duplicate());
        assert!(!RelayError::InvalidRequest("x".into()).is_duplicate());
    }
}
