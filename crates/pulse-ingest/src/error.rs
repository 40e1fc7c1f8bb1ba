//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Errors raised while publishing, consuming or persisting indicators.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The message body is not a valid queued indicator.
    #[error("malformed message: {reason}")]
    Malformed {
        /// Why deserialization failed.
        reason: String,
    },

    /// The message carries no indicator payload.
    #[error("message has no indicator payload")]
    MissingIndicator,

    /// The source server address is not an IPv4 address.
    #[error("invalid source address: {address:?}")]
    InvalidAddress {
        /// The address as received.
        address: String,
    },

    /// An indicator could not be serialized.
    #[error("serialization failed: {reason}")]
    Serialization {
        /// The underlying serializer error.
        reason: String,
    },

    /// The broker refused or failed an operation.
    #[error("broker error: {reason}")]
    Broker {
        /// What the broker reported.
        reason: String,
    },

    /// A broker or store operation did not complete in time.
    #[error("{operation} timed out after {millis}ms")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// Timeout that elapsed, in milliseconds.
        millis: u64,
    },

    /// An operation was abandoned before it completed.
    #[error("{operation} cancelled")]
    Cancelled {
        /// The operation that was cancelled.
        operation: &'static str,
    },

    /// The historical store failed.
    #[error("store error: {reason}")]
    Store {
        /// What the store reported.
        reason: String,
    },

    /// The clock moved backwards further than id generation tolerates.
    #[error("clock moved backwards by {millis}ms")]
    ClockMovedBackwards {
        /// How far the clock regressed.
        millis: i64,
    },

    /// `start` was called on a consumer that is not stopped.
    #[error("consumer is already running")]
    AlreadyRunning,

    /// `stop` was called on a consumer that is not running.
    #[error("consumer is already stopped")]
    AlreadyStopped,

    /// Configuration is out of range.
    #[error("invalid ingest configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

impl IngestError {
    /// Whether a message failing with this error is permanently invalid.
    ///
    /// Such messages are dead-lettered; every other failure is requeued.
    #[must_use]
    pub const fn is_dead_letter(&self) -> bool {
        matches!(
            self,
            Self::Malformed { .. } | Self::MissingIndicator | Self::InvalidAddress { .. }
        )
    }

    pub(crate) fn timeout(operation: &'static str, limit: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store {
            reason: err.to_string(),
        }
    }
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(IngestError::Malformed { reason: "eof".into() }, true ; "malformed")]
    #[test_case(IngestError::MissingIndicator, true ; "missing indicator")]
    #[test_case(IngestError::InvalidAddress { address: "x".into() }, true ; "bad address")]
    #[test_case(IngestError::Store { reason: "locked".into() }, false ; "store")]
    #[test_case(IngestError::ClockMovedBackwards { millis: 50 }, false ; "clock")]
    #[test_case(IngestError::Cancelled { operation: "persist" }, false ; "cancelled")]
    #[test_case(IngestError::Serialization { reason: "x".into() }, false ; "serialization")]
    fn dead_letter_classification(err: IngestError, expected: bool) {
        assert_eq!(err.is_dead_letter(), expected);
    }

    #[test]
    fn error_display_invalid_address() {
        let err = IngestError::InvalidAddress {
            address: "db.local".to_string(),
        };
        assert_eq!(err.to_string(), "invalid source address: \"db.local\"");
    }

    #[test]
    fn error_display_timeout() {
        let err = IngestError::timeout("publish", std::time::Duration::from_secs(5));
        assert_eq!(err.to_string(), "publish timed out after 5000ms");
    }
}
