//! Distributed cache-aside layer for indicator results.
#![forbid(unsafe_code)]
//!
//! `pulse-cache` shields the monitored database from duplicate concurrent
//! recomputation across service instances that share one cache store and
//! one lock service.
//!
//! # Features
//!
//! - **Double-checked locking**: check the cache, take the per-key lock,
//!   check again, then compute
//! - **Atomic writes**: fields and TTL are applied in one step
//! - **Warm-up**: after every health transition keys are served by direct
//!   computation while a background listener repopulates the cache
//! - **Graceful degradation**: any store or lock failure falls back to
//!   direct computation
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pulse_cache::{
//!     CacheAside, CacheConfig, CacheStore, DistributedLock, HealthChecker, HealthConfig,
//!     MemoryCacheStore, MemoryLockService, WarmUpState,
//! };
//! use pulse_metrics::{IndicatorKind, IndicatorResult};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
//! let lock: Arc<dyn DistributedLock> = Arc::new(MemoryLockService::new());
//! let health = Arc::new(HealthChecker::new(
//!     Arc::clone(&store),
//!     Arc::new(WarmUpState::new()),
//!     HealthConfig::default(),
//! ));
//! health.check_now().await;
//!
//! let (cache, listener) = CacheAside::new(store, lock, health, CacheConfig::default());
//! let _listener = listener.spawn();
//!
//! let result = cache
//!     .get_with_cache("qps", || async { IndicatorResult::zero(IndicatorKind::Qps, 0) })
//!     .await;
//! assert!(result.is_valid());
//! # });
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod aside;
pub mod codec;
pub mod error;
pub mod health;
pub mod lock;
pub mod store;
pub mod warmup;

// Re-export main types at crate root
pub use aside::{CacheAside, CacheConfig, CacheStats, WarmEvent, WarmUpListener};
pub use error::{CacheError, Result};
pub use health::{HealthCheckHandle, HealthChecker, HealthConfig, start_health_task};
pub use lock::{DistributedLock, LockToken, MemoryLockService};
pub use store::{CacheStore, FieldMap, MemoryCacheStore, MemoryStoreStats};
pub use warmup::WarmUpState;
