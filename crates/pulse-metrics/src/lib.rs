//! Snapshot-based health indicators for a monitored database server.
#![forbid(unsafe_code)]
//!
//! `pulse-metrics` turns raw server counters into rate-based indicators
//! (queries/sec, network throughput, buffer-pool hit ratio) plus two
//! point-in-time gauges (connection usage, database size).
//!
//! # Features
//!
//! - **Lock-free sampling**: each rate family keeps its last snapshot behind
//!   an atomic pointer and swaps it with bounded compare-and-swap retries
//! - **Reset aware**: a counter that goes backwards yields a flagged zero
//!   result instead of a huge negative rate
//! - **Idle aware**: an idle server reuses the last computed rate, flagged
//!   as stale
//! - **Fixed-point**: rates are `Decimal` with 8 fractional digits
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pulse_metrics::{
//!     CounterGroup, EngineConfig, IndicatorProvider, QpsFamily, SnapshotEngine,
//!     StaticCounterSource,
//! };
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let source = Arc::new(StaticCounterSource::new());
//! source.set(CounterGroup::GlobalStatus, "Questions", 1_000_u64);
//!
//! let engine = SnapshotEngine::new(QpsFamily::default(), source, EngineConfig::default());
//! let first = engine.sample().await;
//! assert!(first.is_valid());
//! # });
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod engine;
pub mod error;
pub mod family;
pub mod gauge;
pub mod source;
pub mod types;

// Re-export main types at crate root
pub use engine::{
    DEFAULT_WARM_UP_SAMPLES, EngineConfig, IndicatorProvider, MAX_RETRIES, SnapshotEngine, evaluate,
};
pub use error::{MetricsError, Result};
pub use family::{
    CACHE_HIT_MIN_TIME_DIFF_MS, CacheHitRateFamily, DEFAULT_MIN_TIME_DIFF_MS, NetworkTrafficFamily,
    QpsFamily, RATE_SCALE, RateFamily, RateOutcome, per_second, round_rate,
};
pub use gauge::{ConnectionUsageProbe, DatabaseSizeProbe};
pub use source::{
    Clock, CounterSource, ManualClock, SimulatedCounterSource, StaticCounterSource, SystemClock,
};
pub use types::{
    CacheHitRateIndicator, ConnectionUsageIndicator, CounterGroup, CounterMap, CounterSnapshot,
    CounterValue, DatabaseSizeIndicator, Indicator, IndicatorKind, IndicatorResult,
    NetworkTrafficIndicator, QpsIndicator, SchemaSize,
};
