//! Error types for the pulse-metrics crate.

use thiserror::Error;

/// Errors that can occur while sampling counters or computing indicators.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The counter source failed to produce a reading.
    #[error("counter source error: {reason}")]
    Source {
        /// The reason the source failed.
        reason: String,
    },

    /// A counter the family depends on was absent from the reading.
    #[error("missing counter: {name}")]
    MissingCounter {
        /// Name of the absent counter.
        name: String,
    },

    /// A counter value could not be interpreted as a number.
    #[error("invalid value for counter {name}: {value}")]
    InvalidCounter {
        /// Name of the counter.
        name: String,
        /// The raw value as reported by the server.
        value: String,
    },

    /// The counter fetch did not complete in time.
    #[error("counter fetch timed out after {millis}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds.
        millis: u64,
    },

    /// The indicator type name is not one of the known families.
    #[error("unknown indicator type: {name}")]
    UnknownIndicator {
        /// The name that failed to parse.
        name: String,
    },

    /// Engine configuration is out of range.
    #[error("invalid engine configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;
