//! Counter sources and clocks.
//!
//! The engine never talks to a database directly; it asks a
//! [`CounterSource`] for a named [`CounterGroup`]. This module provides:
//! - [`CounterSource`]: the async trait a database driver implements
//! - [`StaticCounterSource`]: a settable source for tests and wiring checks
//! - [`SimulatedCounterSource`]: a self-advancing source for demo runs
//! - [`Clock`], [`SystemClock`], [`ManualClock`]: snapshot timestamps

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{MetricsError, Result};
use crate::types::{CounterGroup, CounterMap, CounterValue};

/// A source of server counters.
///
/// Implementations wrap whatever query reads the monitored server's
/// counters. Failures are reported as [`MetricsError::Source`].
pub trait CounterSource: Send + Sync {
    /// Fetches the current values of a counter group.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be read.
    fn fetch<'a>(
        &'a self,
        group: CounterGroup,
    ) -> Pin<Box<dyn Future<Output = Result<CounterMap>> + Send + 'a>>;
}

/// Source of snapshot timestamps.
pub trait Clock: Send + Sync {
    /// Current time in Unix milliseconds.
    fn now_millis(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    /// Creates a clock reading `start_ms`.
    #[must_use]
    pub const fn new(start_ms: i64) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A source whose values are set explicitly.
///
/// Useful in tests: set counters, sample, change counters, sample again.
#[derive(Debug, Default)]
pub struct StaticCounterSource {
    groups: RwLock<HashMap<CounterGroup, CounterMap>>,
    failing: AtomicBool,
    fetches: AtomicU64,
}

impl StaticCounterSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one counter in a group.
    pub fn set(&self, group: CounterGroup, name: impl Into<String>, value: impl Into<CounterValue>) {
        self.groups
            .write()
            .entry(group)
            .or_default()
            .insert(name.into(), value.into());
    }

    /// Removes one counter from a group.
    pub fn remove(&self, group: CounterGroup, name: &str) {
        if let Some(map) = self.groups.write().get_mut(&group) {
            map.remove(name);
        }
    }

    /// Makes every subsequent fetch fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of fetches served so far, failed ones included.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl CounterSource for StaticCounterSource {
    fn fetch<'a>(
        &'a self,
        group: CounterGroup,
    ) -> Pin<Box<dyn Future<Output = Result<CounterMap>> + Send + 'a>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(MetricsError::Source {
                    reason: "source unavailable".to_string(),
                });
            }
            Ok(self.groups.read().get(&group).cloned().unwrap_or_default())
        })
    }
}

/// Running totals kept by the simulated source.
#[derive(Debug, Default)]
struct SimulatedTotals {
    tick: u64,
    questions: u64,
    bytes_received: u64,
    bytes_sent: u64,
    pool_reads: u64,
    pool_read_ahead: u64,
    pool_read_requests: u64,
}

/// A deterministic, self-advancing counter source.
///
/// Every `GlobalStatus` fetch advances the cumulative counters by a
/// varying amount, so consecutive samples produce plausible non-zero
/// rates without a live server.
#[derive(Debug)]
pub struct SimulatedCounterSource {
    totals: parking_lot::Mutex<SimulatedTotals>,
    max_connections: u64,
    schemas: Vec<(String, u64, u64)>,
}

impl Default for SimulatedCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCounterSource {
    /// Creates a simulated server with two schemas and 151 max connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            totals: parking_lot::Mutex::new(SimulatedTotals::default()),
            max_connections: 151,
            schemas: vec![
                ("app".to_string(), 48 * 1024 * 1024, 12 * 1024 * 1024),
                ("audit".to_string(), 6 * 1024 * 1024, 1024 * 1024),
            ],
        }
    }

    fn global_status(&self) -> CounterMap {
        let mut totals = self.totals.lock();
        totals.tick += 1;
        let wave = totals.tick % 7;

        totals.questions += 200 + wave * 35;
        totals.bytes_received += 40_000 + wave * 3_000;
        totals.bytes_sent += 120_000 + wave * 9_000;
        totals.pool_read_requests += 10_000 + wave * 500;
        totals.pool_reads += 40 + wave * 6;
        totals.pool_read_ahead += wave * 2;

        let threads_connected = 12 + wave * 3;
        let threads_running = 2 + wave / 2;

        [
            ("Questions", totals.questions),
            ("Bytes_received", totals.bytes_received),
            ("Bytes_sent", totals.bytes_sent),
            ("Innodb_buffer_pool_reads", totals.pool_reads),
            ("Innodb_buffer_pool_read_ahead", totals.pool_read_ahead),
            ("Innodb_buffer_pool_read_requests", totals.pool_read_requests),
            ("Threads_connected", threads_connected),
            ("Threads_running", threads_running),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), CounterValue::from(value)))
        .collect()
    }

    fn global_variables(&self) -> CounterMap {
        let mut map = CounterMap::new();
        map.insert(
            "max_connections".to_string(),
            CounterValue::from(self.max_connections),
        );
        map.insert("read_only".to_string(), CounterValue::from("OFF"));
        map
    }

    fn schema_sizes(&self) -> CounterMap {
        let mut map = CounterMap::new();
        for (schema, data, index) in &self.schemas {
            map.insert(format!("{schema}.data_length"), CounterValue::from(*data));
            map.insert(format!("{schema}.index_length"), CounterValue::from(*index));
        }
        map
    }
}

impl CounterSource for SimulatedCounterSource {
    fn fetch<'a>(
        &'a self,
        group: CounterGroup,
    ) -> Pin<Box<dyn Future<Output = Result<CounterMap>> + Send + 'a>> {
        Box::pin(async move {
            Ok(match group {
                CounterGroup::GlobalStatus => self.global_status(),
                CounterGroup::GlobalVariables => self.global_variables(),
                CounterGroup::SchemaSizes => self.schema_sizes(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[tokio::test]
    async fn static_source_returns_set_values() {
        let source = StaticCounterSource::new();
        source.set(CounterGroup::GlobalStatus, "Questions", 10_u64);

        let map = source.fetch(CounterGroup::GlobalStatus).await.unwrap();
        assert_eq!(
            map.get("Questions").and_then(CounterValue::as_decimal),
            Some(Decimal::from(10))
        );

        let empty = source.fetch(CounterGroup::SchemaSizes).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn static_source_can_fail() {
        let source = StaticCounterSource::new();
        source.set_failing(true);
        let err = source.fetch(CounterGroup::GlobalStatus).await.unwrap_err();
        assert!(matches!(err, MetricsError::Source { .. }));
    }

    #[tokio::test]
    async fn simulated_counters_only_grow() {
        let source = SimulatedCounterSource::new();
        let first = source.fetch(CounterGroup::GlobalStatus).await.unwrap();
        let second = source.fetch(CounterGroup::GlobalStatus).await.unwrap();

        for name in ["Questions", "Bytes_received", "Bytes_sent", "Innodb_buffer_pool_read_requests"] {
            let a = first.get(name).and_then(CounterValue::as_decimal).unwrap();
            let b = second.get(name).and_then(CounterValue::as_decimal).unwrap();
            assert!(b > a, "{name} did not grow");
        }
    }

    #[tokio::test]
    async fn simulated_schema_sizes_are_keyed_by_schema() {
        let source = SimulatedCounterSource::new();
        let sizes = source.fetch(CounterGroup::SchemaSizes).await.unwrap();
        assert!(sizes.contains_key("app.data_length"));
        assert!(sizes.contains_key("audit.index_length"));
    }
}
