//! Cache-aside retrieval with distributed double-checked locking.
//!
//! [`CacheAside::get_with_cache`] always returns an [`IndicatorResult`].
//! Store, lock and codec failures only cost a direct computation.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pulse_metrics::IndicatorResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{CacheError, Result};
use crate::health::HealthChecker;
use crate::lock::{DistributedLock, LockToken};
use crate::store::CacheStore;
use crate::warmup::WarmUpState;

/// Configuration for [`CacheAside`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry time-to-live. Keep it below the shortest sampling interval.
    pub ttl: Duration,
    /// Longest wait for the per-key lock.
    pub lock_wait: Duration,
    /// Lease after which a held lock frees itself.
    pub lock_lease: Duration,
    /// Timeout for each cache read or write.
    pub op_timeout: Duration,
    /// Prefix prepended to every cache key.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(900),
            lock_wait: Duration::from_secs(5),
            lock_lease: Duration::from_secs(1),
            op_timeout: Duration::from_millis(500),
            key_prefix: "dbpulse:indicator:".to_string(),
        }
    }
}

impl CacheConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the TTL, lease or operation timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig {
                reason: "ttl must be positive".to_string(),
            });
        }
        if self.lock_lease.is_zero() {
            return Err(CacheError::InvalidConfig {
                reason: "lock lease must be positive".to_string(),
            });
        }
        if self.op_timeout.is_zero() {
            return Err(CacheError::InvalidConfig {
                reason: "operation timeout must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Upper bound on time spent in the cache layer for one call,
    /// excluding the computation itself.
    #[must_use]
    pub fn worst_case_overhead(&self) -> Duration {
        // read, lock, re-read, write, unlock
        self.lock_wait + self.op_timeout * 5
    }
}

/// Asks the background listener to write a freshly computed result.
#[derive(Debug, Clone)]
pub struct WarmEvent {
    /// Unprefixed cache key.
    pub key: String,
    /// The result to cache.
    pub result: IndicatorResult,
    /// Health transitions seen when the result was computed. An event from
    /// before a transition is dropped.
    pub generation: u64,
}

/// Counters describing how calls were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Served from the cache (first or second check).
    pub hits: u64,
    /// Computed while holding the lock.
    pub computed: u64,
    /// Computed directly because the store was unhealthy or the key cold.
    pub bypassed: u64,
    /// Computed directly after a store, lock or codec failure.
    pub fallbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    computed: AtomicU64,
    bypassed: AtomicU64,
    fallbacks: AtomicU64,
}

/// Reads and writes encoded entries with per-operation timeouts.
#[derive(Clone)]
struct Entries {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl Entries {
    fn cache_key(&self, key: &str) -> String {
        format!("{}{key}", self.config.key_prefix)
    }

    async fn read(&self, cache_key: &str) -> Result<Option<IndicatorResult>> {
        let fields = tokio::time::timeout(self.config.op_timeout, self.store.get_fields(cache_key))
            .await
            .map_err(|_| CacheError::timeout("get", self.config.op_timeout))??;
        fields.as_ref().map(codec::decode).transpose()
    }

    async fn write(&self, cache_key: &str, result: &IndicatorResult) -> Result<()> {
        let fields = codec::encode(result)?;
        tokio::time::timeout(
            self.config.op_timeout,
            self.store.set_fields_with_ttl(cache_key, fields, self.config.ttl),
        )
        .await
        .map_err(|_| CacheError::timeout("set", self.config.op_timeout))?
    }
}

/// Cache-first indicator retrieval shared by every caller in a process.
pub struct CacheAside {
    entries: Entries,
    lock: Arc<dyn DistributedLock>,
    health: Arc<HealthChecker>,
    warm_up: Arc<WarmUpState>,
    warm_tx: mpsc::UnboundedSender<WarmEvent>,
    counters: Counters,
}

impl CacheAside {
    /// Creates the cache layer and the listener that performs warm-up writes.
    ///
    /// The listener must be run (see [`WarmUpListener::spawn`]) for cold keys
    /// to ever warm up.
    #[must_use]
    pub fn new(
        store: Arc<dyn CacheStore>,
        lock: Arc<dyn DistributedLock>,
        health: Arc<HealthChecker>,
        config: CacheConfig,
    ) -> (Self, WarmUpListener) {
        let (warm_tx, warm_rx) = mpsc::unbounded_channel();
        let entries = Entries { store, config };
        let warm_up = Arc::clone(health.warm_up());

        let listener = WarmUpListener {
            entries: entries.clone(),
            health: Arc::clone(&health),
            rx: warm_rx,
        };
        let aside = Self {
            entries,
            lock,
            health,
            warm_up,
            warm_tx,
            counters: Counters::default(),
        };
        (aside, listener)
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.entries.config
    }

    /// Returns a snapshot of the serving counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            computed: self.counters.computed.load(Ordering::Relaxed),
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Returns the cached result for `key`, computing and caching it on a miss.
    ///
    /// `compute` runs at most once per call, and only valid results are
    /// written to the cache.
    pub async fn get_with_cache<F, Fut>(&self, key: &str, compute: F) -> IndicatorResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = IndicatorResult>,
    {
        if !self.health.is_healthy() {
            debug!(key, "cache unhealthy, computing directly");
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            return compute().await;
        }

        if !self.warm_up.is_warm(key) {
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            let generation = self.health.transitions();
            let result = compute().await;
            if result.is_valid() {
                let event = WarmEvent {
                    key: key.to_string(),
                    result: result.clone(),
                    generation,
                };
                if self.warm_tx.send(event).is_err() {
                    debug!(key, "warm-up listener gone, key stays cold");
                }
            }
            return result;
        }

        let cache_key = self.entries.cache_key(key);
        match self.entries.read(&cache_key).await {
            Ok(Some(hit)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return hit;
            }
            Ok(None) => {}
            Err(e) => return self.fall_back(key, &e, compute).await,
        }

        let lock_name = format!("{cache_key}:lock");
        let token = LockToken::new();
        match self.acquire(&lock_name, token).await {
            Ok(true) => {}
            Ok(false) => {
                let e = CacheError::timeout("lock", self.entries.config.lock_wait);
                return self.fall_back(key, &e, compute).await;
            }
            Err(e) => return self.fall_back(key, &e, compute).await,
        }

        let result = self.fill_locked(key, &cache_key, compute).await;

        self.release(key, &lock_name, token).await;
        result
    }

    async fn acquire(&self, lock_name: &str, token: LockToken) -> Result<bool> {
        let config = &self.entries.config;
        let limit = config.lock_wait + config.op_timeout;
        tokio::time::timeout(
            limit,
            self.lock
                .try_lock(lock_name, token, config.lock_wait, config.lock_lease),
        )
        .await
        .map_err(|_| CacheError::timeout("lock", limit))?
    }

    async fn release(&self, key: &str, lock_name: &str, token: LockToken) {
        let limit = self.entries.config.op_timeout;
        match tokio::time::timeout(limit, self.lock.unlock(lock_name, token)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(key, error = %e, "lock release failed"),
            Err(_) => debug!(key, "lock release timed out, lease will expire"),
        }
    }

    /// Second check, then compute and write. Runs with the key's lock held.
    async fn fill_locked<F, Fut>(&self, key: &str, cache_key: &str, compute: F) -> IndicatorResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = IndicatorResult>,
    {
        match self.entries.read(cache_key).await {
            Ok(Some(hit)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return hit;
            }
            Ok(None) => {}
            Err(e) => debug!(key, error = %e, "second cache read failed"),
        }

        self.counters.computed.fetch_add(1, Ordering::Relaxed);
        let result = compute().await;
        if result.is_valid() {
            match self.entries.write(cache_key, &result).await {
                Ok(()) => self.warm_up.mark_warm(key),
                Err(e) => warn!(key, error = %e, "cache write failed"),
            }
        }
        result
    }

    async fn fall_back<F, Fut>(&self, key: &str, error: &CacheError, compute: F) -> IndicatorResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = IndicatorResult>,
    {
        warn!(key, error = %error, "cache path failed, computing directly");
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        compute().await
    }
}

impl std::fmt::Debug for CacheAside {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAside")
            .field("config", &self.entries.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Performs cache writes for keys served while cold.
pub struct WarmUpListener {
    entries: Entries,
    health: Arc<HealthChecker>,
    rx: mpsc::UnboundedReceiver<WarmEvent>,
}

impl WarmUpListener {
    /// Handles events until every [`CacheAside`] sender is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
        }
        debug!("warm-up listener stopped");
    }

    /// Runs the listener on a background task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn handle(&self, event: WarmEvent) {
        if self.health.transitions() != event.generation {
            debug!(key = %event.key, "health changed since compute, dropping warm-up");
            return;
        }

        let cache_key = self.entries.cache_key(&event.key);
        match self.entries.write(&cache_key, &event.result).await {
            // A transition during the write leaves the key cold; the entry
            // expires on its own.
            Ok(()) if self.health.transitions() != event.generation => {
                debug!(key = %event.key, "health changed during warm-up write");
            }
            Ok(()) => {
                self.health.warm_up().mark_warm(&event.key);
                debug!(key = %event.key, "cache key warmed");
            }
            Err(e) => warn!(key = %event.key, error = %e, "warm-up write failed"),
        }
    }
}

impl std::fmt::Debug for WarmUpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmUpListener").finish_non_exhaustive()
    }
}
