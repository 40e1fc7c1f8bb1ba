//! Error types for dbpulse.

use pulse_cache::CacheError;
use pulse_ingest::IngestError;
use pulse_metrics::MetricsError;
use thiserror::Error;

/// Errors that can occur while configuring or running the monitor.
#[derive(Debug, Error)]
pub enum PulseError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Metric engine error.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Cache layer error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Ingestion pipeline error.
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for dbpulse operations.
pub type Result<T> = std::result::Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = PulseError::Config("batch_size must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: batch_size must be positive"
        );
    }

    #[test]
    fn ingest_error_wraps_source() {
        let err = PulseError::from(IngestError::AlreadyRunning);
        assert_eq!(err.to_string(), "ingest error: consumer is already running");
    }

    #[test]
    fn unknown_indicator_display() {
        let err = PulseError::from(MetricsError::UnknownIndicator {
            name: "tps".to_string(),
        });
        assert!(err.to_string().contains("tps"));
    }
}
