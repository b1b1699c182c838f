//! Outcomes of a single non-blocking retrieval call

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reason code reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    ConnectionBroken,
    HandleInvalid,
    ObjectHandleInvalid,
    NoMessageAvailable,
    TruncatedMessageFailed,
    QueueManagerQuiescing,
    Other(i32),
}

impl ReasonCode {
    /// Numeric reason code as the transport reports it
    pub fn code(&self) -> i32 {
        match self {
            Self::ConnectionBroken => 2009,
            Self::HandleInvalid => 2018,
            Self::ObjectHandleInvalid => 2019,
            Self::NoMessageAvailable => 2033,
            Self::TruncatedMessageFailed => 2080,
            Self::QueueManagerQuiescing => 2161,
            Self::Other(code) => *code,
        }
    }

    /// Maps a numeric code back to a reason
    pub fn from_code(code: i32) -> Self {
        match code {
            2009 => Self::ConnectionBroken,
            2018 => Self::HandleInvalid,
            2019 => Self::ObjectHandleInvalid,
            2033 => Self::NoMessageAvailable,
            2080 => Self::TruncatedMessageFailed,
            2161 => Self::QueueManagerQuiescing,
            other => Self::Other(other),
        }
    }

    /// Reasons meaning the connection can no longer be used
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionBroken | Self::HandleInvalid | Self::QueueManagerQuiescing
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "reason {}", code),
            reason => write!(f, "{:?} ({})", reason, reason.code()),
        }
    }
}

/// Failure reported by the transport for one call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}: {message}")]
pub struct TransportError {
    pub reason: ReasonCode,
    pub message: String,
}

impl TransportError {
    pub fn new(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Result of one non-blocking retrieval attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    /// A message was copied into the buffer
    Message { data_length: usize },
    /// Nothing available right now
    NoData,
    /// The buffer was too small; the message stays where it was
    Truncated { data_length: usize },
    /// Any other failure
    Failed(TransportError),
}

/// Health of a connection as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Healthy,
    /// Temporarily unusable (for example while reconnecting)
    Interrupted,
    /// Gone for good
    Closed,
}
