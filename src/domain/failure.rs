//! Activity failures, recorded as data in history.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failed attempt may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, 5xx, throttling: retried per policy
    Transient,

    /// Malformed input, 4xx, missing data: never retried
    Permanent,
}

/// Error returned by an activity attempt.
///
/// Activities never panic across the engine boundary; every failure is
/// converted into one of these and appended to the instance history.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?} failure: {message}")]
pub struct ActivityError {
    pub kind: FailureKind,
    pub message: String,
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Classify an HTTP error status.
    ///
    /// Throttling (429), request timeout (408) and server errors are
    /// transient; any other client error is permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 429 => Self::transient(message),
            400..=499 => Self::permanent(message),
            _ => Self::transient(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ActivityError::from_status(500, "boom").is_retryable());
        assert!(ActivityError::from_status(503, "busy").is_retryable());
        assert!(ActivityError::from_status(429, "slow down").is_retryable());
        assert!(ActivityError::from_status(408, "timeout").is_retryable());

        assert!(!ActivityError::from_status(400, "bad").is_retryable());
        assert!(!ActivityError::from_status(401, "auth").is_retryable());
        assert!(!ActivityError::from_status(404, "missing").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ActivityError::permanent("missing blob");
        assert_eq!(err.to_string(), "Permanent failure: missing blob");
    }
}
