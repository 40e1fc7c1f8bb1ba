//! Error types for the cache layer.
//!
//! None of these reach callers of [`CacheAside`](crate::CacheAside): every
//! failure on the cached path falls back to direct computation.

use thiserror::Error;

/// Errors raised by cache stores, lock services and the field codec.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache store or lock service cannot be reached.
    #[error("cache backend unavailable: {reason}")]
    Unavailable {
        /// Why the backend is unavailable.
        reason: String,
    },

    /// A backend operation did not complete in time.
    #[error("cache operation '{operation}' timed out after {millis}ms")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// Timeout that elapsed, in milliseconds.
        millis: u64,
    },

    /// The atomic set-with-TTL script failed.
    #[error("cache script failed: {reason}")]
    Script {
        /// Failure reported by the store.
        reason: String,
    },

    /// A cached entry could not be encoded or decoded.
    #[error("cache codec error: {reason}")]
    Codec {
        /// What could not be encoded or decoded.
        reason: String,
    },

    /// An unlock was attempted with a token that does not hold the lock.
    #[error("lock '{name}' is not held by this caller")]
    LockNotHeld {
        /// The lock name.
        name: String,
    },

    /// Configuration is out of range.
    #[error("invalid cache configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

impl CacheError {
    pub(crate) fn timeout(operation: &'static str, limit: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec {
            reason: err.to_string(),
        }
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn error_display_unavailable() {
        let err = CacheError::Unavailable {
            reason: "connection reset".to_string(),
        };
        assert_eq!(err.to_string(), "cache backend unavailable: connection reset");
    }

    #[test]
    fn error_display_timeout() {
        let err = CacheError::timeout("get", Duration::from_millis(250));
        assert_eq!(err.to_string(), "cache operation 'get' timed out after 250ms");
    }

    #[test]
    fn error_display_lock_not_held() {
        let err = CacheError::LockNotHeld {
            name: "qps:lock".to_string(),
        };
        assert_eq!(err.to_string(), "lock 'qps:lock' is not held by this caller");
    }

    #[test]
    fn json_errors_become_codec_errors() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: CacheError = json_err.into();
        assert!(matches!(err, CacheError::Codec { .. }));
    }
}
