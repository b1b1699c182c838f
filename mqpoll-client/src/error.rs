//! Error types for the mqpoll client

use mqpoll_core::domain::handle::ContextKey;
use mqpoll_core::domain::outcome::TransportError;
use mqpoll_core::domain::tuning::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors returned by the scheduler's own API
#[derive(Debug, Error)]
pub enum ClientError {
    /// No retrieval is registered under this key
    #[error("Unknown retrieval context: {0}")]
    UnknownContext(ContextKey),

    /// Tuning failed validation
    #[error("Invalid tuning: {0}")]
    InvalidTuning(#[from] ConfigError),

    /// The scheduler was created outside a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

impl ClientError {
    /// Check if this error is an "unknown context" error
    pub fn is_unknown_context(&self) -> bool {
        matches!(self, Self::UnknownContext(_))
    }
}

/// Terminal conditions delivered to a retrieval handler
///
/// A handler sees at most one of these per registration; the registration
/// no longer exists by the time it is called.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrievalError {
    /// The wait budget ran out without a message arriving
    #[error("No message available after waiting {waited:?}")]
    Timeout {
        /// Time spent waiting since the last delivery or registration
        waited: Duration,
    },

    /// The connection is gone
    #[error("Connection broken: {0}")]
    ConnectionBroken(TransportError),

    /// The next message does not fit even the largest allowed buffer
    #[error("Message of {needed} bytes exceeds the {limit} byte buffer limit")]
    MessageTooLarge {
        /// Length the transport reported
        needed: usize,
        /// Largest buffer the scheduler may allocate
        limit: usize,
    },

    /// Any other transport failure
    #[error("Transport failure: {0}")]
    Transport(TransportError),
}

impl RetrievalError {
    /// Classifies a transport failure
    pub fn from_transport(error: TransportError) -> Self {
        if error.reason.is_connection_loss() {
            Self::ConnectionBroken(error)
        } else {
            Self::Transport(error)
        }
    }

    /// Check if this is the expected end of a bounded wait
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Numeric reason code, when one applies
    pub fn reason_code(&self) -> i32 {
        match self {
            Self::Timeout { .. } => 2033,
            Self::MessageTooLarge { .. } => 2080,
            Self::ConnectionBroken(err) | Self::Transport(err) => err.reason.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqpoll_core::domain::outcome::ReasonCode;

    #[test]
    fn test_transport_failures_classified() {
        let broken = RetrievalError::from_transport(TransportError::new(
            ReasonCode::ConnectionBroken,
            "gone",
        ));
        assert!(matches!(broken, RetrievalError::ConnectionBroken(_)));

        let other = RetrievalError::from_transport(TransportError::new(
            ReasonCode::ObjectHandleInvalid,
            "closed",
        ));
        assert!(matches!(other, RetrievalError::Transport(_)));
        assert_eq!(other.reason_code(), 2019);
    }

    #[test]
    fn test_timeout_reason_code() {
        let err = RetrievalError::Timeout {
            waited: Duration::from_millis(2000),
        };
        assert!(err.is_timeout());
        assert_eq!(err.reason_code(), 2033);
    }
}
