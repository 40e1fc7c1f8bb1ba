//! Cache health tracking.
//!
//! A periodic ping decides whether the cached path is used at all. Every
//! health transition marks all keys cold, so entries written before an
//! outage are never trusted without a fresh write.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{CacheError, Result};
use crate::store::CacheStore;
use crate::warmup::WarmUpState;

/// Configuration for the health checker.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between pings.
    pub interval: Duration,
    /// Time a ping may take before the store counts as unhealthy.
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1),
        }
    }
}

impl HealthConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if either duration is zero.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(CacheError::InvalidConfig {
                reason: "health interval and timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Tracks whether the cache store is reachable.
///
/// Starts unhealthy until the first successful ping.
pub struct HealthChecker {
    store: Arc<dyn CacheStore>,
    warm_up: Arc<WarmUpState>,
    config: HealthConfig,
    healthy: AtomicBool,
    transitions: AtomicU64,
}

impl HealthChecker {
    /// Creates a checker for `store` that resets `warm_up` on transitions.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, warm_up: Arc<WarmUpState>, config: HealthConfig) -> Self {
        Self {
            store,
            warm_up,
            config,
            healthy: AtomicBool::new(false),
            transitions: AtomicU64::new(0),
        }
    }

    /// Result of the most recent check.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// The warm-up state this checker resets.
    #[must_use]
    pub fn warm_up(&self) -> &Arc<WarmUpState> {
        &self.warm_up
    }

    /// Number of healthy/unhealthy transitions observed so far.
    #[must_use]
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::SeqCst)
    }

    /// Pings the store once and records the outcome.
    ///
    /// Returns the new health state.
    pub async fn check_now(&self) -> bool {
        let healthy = match tokio::time::timeout(self.config.timeout, self.store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "cache ping failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.config.timeout, "cache ping timed out");
                false
            }
        };

        let was_healthy = self.healthy.swap(healthy, Ordering::SeqCst);
        if was_healthy != healthy {
            self.transitions.fetch_add(1, Ordering::SeqCst);
            self.warm_up.reset_all();
            if healthy {
                info!("cache store healthy, keys will warm up again");
            } else {
                warn!("cache store unhealthy, bypassing cache");
            }
        }
        healthy
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("healthy", &self.is_healthy())
            .field("transitions", &self.transitions())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle for controlling the health check task.
#[derive(Debug)]
pub struct HealthCheckHandle {
    running: Arc<AtomicBool>,
}

impl HealthCheckHandle {
    /// Check if the health check task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the health check task after its current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Start a periodic health check task.
///
/// The first check runs immediately.
pub fn start_health_task(checker: Arc<HealthChecker>) -> HealthCheckHandle {
    let running = Arc::new(AtomicBool::new(true));
    let handle = HealthCheckHandle {
        running: Arc::clone(&running),
    };

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(checker.config.interval);

        while running.load(Ordering::SeqCst) {
            interval_timer.tick().await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            checker.check_now().await;
        }
    });

    handle
}
