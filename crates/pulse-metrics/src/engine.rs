//! Snapshot-based rate engine.
//!
//! A [`SnapshotEngine`] owns the last counter snapshot for one rate family.
//! Each [`sample`](IndicatorProvider::sample) fetches fresh counters, swaps
//! the stored snapshot with compare-and-swap, and derives a rate from the
//! pair. Concurrent samplers never take a lock; a lost swap is retried up to
//! [`EngineConfig::max_retries`] times before degrading to the error
//! sentinel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::{debug, warn};

use crate::error::{MetricsError, Result};
use crate::family::{RateFamily, RateOutcome};
use crate::source::{Clock, CounterSource, SystemClock};
use crate::types::{CounterSnapshot, IndicatorKind, IndicatorResult};

/// Default bound on compare-and-swap attempts per sample.
pub const MAX_RETRIES: u32 = 10;

/// Default number of initial samples that only prime the snapshot.
pub const DEFAULT_WARM_UP_SAMPLES: u32 = 3;

/// Something that can produce an indicator on demand.
///
/// Implemented by the snapshot engine for rate families and by the gauge
/// probes; the cache layer and the scheduler only see this trait.
pub trait IndicatorProvider: Send + Sync {
    /// The family produced.
    fn kind(&self) -> IndicatorKind;

    /// Produces one result. Never fails: degraded outcomes are flagged on
    /// the result.
    fn sample(&self) -> Pin<Box<dyn Future<Output = IndicatorResult> + Send + '_>>;
}

/// Tuning for a [`SnapshotEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Compare-and-swap attempts before returning the error sentinel.
    pub max_retries: u32,
    /// Samples that return a zero value while the baseline settles.
    pub warm_up_samples: u32,
    /// Bound on each counter fetch.
    pub fetch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            warm_up_samples: DEFAULT_WARM_UP_SAMPLES,
            fetch_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the fetch timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout.is_zero() {
            return Err(MetricsError::InvalidConfig {
                reason: "fetch_timeout must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Applies the decision policy to a snapshot pair.
///
/// `warming` is true while the family is still inside its warm-up window.
/// Returns the result and whether it is a freshly computed value that
/// should become the new reuse candidate.
pub fn evaluate<F: RateFamily + ?Sized>(
    family: &F,
    previous: &CounterSnapshot,
    current: &CounterSnapshot,
    warming: bool,
    last_computed: Option<&IndicatorResult>,
) -> (IndicatorResult, bool) {
    let kind = family.kind();

    if previous.is_empty() || warming {
        return (IndicatorResult::zero(kind, 0), false);
    }

    let time_diff_ms = current.captured_at_ms - previous.captured_at_ms;
    if time_diff_ms < family.min_time_diff_ms() {
        debug!(%kind, time_diff_ms, "sampling interval too short");
        return (IndicatorResult::zero(kind, time_diff_ms), false);
    }

    if current.went_backwards_from(previous) {
        warn!(%kind, time_diff_ms, "counter reset detected");
        return (IndicatorResult::reset(kind, time_diff_ms), false);
    }

    match family.compute(previous, current, time_diff_ms) {
        Ok(RateOutcome::Rate(indicator)) => {
            (IndicatorResult::fresh(indicator, time_diff_ms), true)
        }
        Ok(RateOutcome::Idle) => match last_computed {
            Some(last) => (last.clone().into_stale(time_diff_ms), false),
            None => (IndicatorResult::zero(kind, time_diff_ms), false),
        },
        Err(e) => {
            warn!(%kind, error = %e, "rate computation failed");
            (IndicatorResult::error(kind), false)
        }
    }
}

/// Holds the last snapshot of one rate family and computes rates from it.
pub struct SnapshotEngine<F> {
    family: F,
    source: Arc<dyn CounterSource>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    snapshot: ArcSwap<CounterSnapshot>,
    last_computed: ArcSwapOption<IndicatorResult>,
    samples_taken: AtomicU64,
}

impl<F: RateFamily> SnapshotEngine<F> {
    /// Creates an engine reading from `source` with the wall clock.
    #[must_use]
    pub fn new(family: F, source: Arc<dyn CounterSource>, config: EngineConfig) -> Self {
        Self::with_clock(family, source, Arc::new(SystemClock), config)
    }

    /// Creates an engine with an explicit clock.
    #[must_use]
    pub fn with_clock(
        family: F,
        source: Arc<dyn CounterSource>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            family,
            source,
            clock,
            config,
            snapshot: ArcSwap::from_pointee(CounterSnapshot::empty()),
            last_computed: ArcSwapOption::const_empty(),
            samples_taken: AtomicU64::new(0),
        }
    }

    /// Returns the family this engine computes.
    #[must_use]
    pub const fn family(&self) -> &F {
        &self.family
    }

    /// Returns the currently stored snapshot.
    #[must_use]
    pub fn current_snapshot(&self) -> Arc<CounterSnapshot> {
        self.snapshot.load_full()
    }

    /// Number of snapshots successfully swapped in.
    #[must_use]
    pub fn samples_taken(&self) -> u64 {
        self.samples_taken.load(Ordering::SeqCst)
    }

    async fn capture(&self) -> Result<CounterSnapshot> {
        let group = self.family.group();
        let reading = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch(group))
            .await
            .map_err(|_| MetricsError::Timeout {
                millis: u64::try_from(self.config.fetch_timeout.as_millis()).unwrap_or(u64::MAX),
            })??;
        CounterSnapshot::capture(
            self.clock.now_millis(),
            &reading,
            self.family.tracked_counters(),
        )
    }

    /// Swaps `current` in and evaluates it against whatever it replaced.
    fn swap_and_evaluate(&self, current: CounterSnapshot) -> IndicatorResult {
        let kind = self.family.kind();
        let current = Arc::new(current);

        for attempt in 0..self.config.max_retries {
            let previous = self.snapshot.load_full();

            if !previous.is_empty() && previous.captured_at_ms > current.captured_at_ms {
                debug!(%kind, "a newer snapshot is already stored; discarding this one");
                return IndicatorResult::zero(kind, 0);
            }

            let witnessed = self.snapshot.compare_and_swap(&previous, Arc::clone(&current));
            if !Arc::ptr_eq(&*witnessed, &previous) {
                debug!(%kind, attempt, "snapshot swap lost a race, retrying");
                continue;
            }

            let taken = self.samples_taken.fetch_add(1, Ordering::SeqCst) + 1;
            let warming = taken <= u64::from(self.config.warm_up_samples);
            let last = self.last_computed.load_full();

            let (result, computed) =
                evaluate(&self.family, &previous, &current, warming, last.as_deref());
            if computed {
                self.last_computed.store(Some(Arc::new(result.clone())));
            }
            return result;
        }

        warn!(
            %kind,
            max_retries = self.config.max_retries,
            "snapshot swap retries exhausted"
        );
        IndicatorResult::error(kind)
    }
}

impl<F: RateFamily> IndicatorProvider for SnapshotEngine<F> {
    fn kind(&self) -> IndicatorKind {
        self.family.kind()
    }

    fn sample(&self) -> Pin<Box<dyn Future<Output = IndicatorResult> + Send + '_>> {
        Box::pin(async move {
            match self.capture().await {
                Ok(current) => self.swap_and_evaluate(current),
                Err(e) => {
                    warn!(kind = %self.family.kind(), error = %e, "counter capture failed");
                    IndicatorResult::error(self.family.kind())
                }
            }
        })
    }
}

impl<F: RateFamily + std::fmt::Debug> std::fmt::Debug for SnapshotEngine<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEngine")
            .field("family", &self.family)
            .field("config", &self.config)
            .field("samples_taken", &self.samples_taken())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{CacheHitRateFamily, QpsFamily};
    use crate::source::{ManualClock, StaticCounterSource};
    use crate::types::{CounterGroup, Indicator, QpsIndicator};
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    struct Harness {
        source: Arc<StaticCounterSource>,
        clock: Arc<ManualClock>,
        engine: SnapshotEngine<QpsFamily>,
    }

    fn harness(warm_up_samples: u32) -> Harness {
        let source = Arc::new(StaticCounterSource::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let engine = SnapshotEngine::with_clock(
            QpsFamily::default(),
            Arc::clone(&source) as Arc<dyn CounterSource>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            EngineConfig {
                warm_up_samples,
                ..EngineConfig::default()
            },
        );
        Harness {
            source,
            clock,
            engine,
        }
    }

    impl Harness {
        async fn sample_at(&self, advance_ms: i64, questions: u64) -> IndicatorResult {
            self.clock.advance(advance_ms);
            self.source
                .set(CounterGroup::GlobalStatus, "Questions", questions);
            self.engine.sample().await
        }
    }

    fn qps(value: i64) -> Indicator {
        Indicator::Qps(QpsIndicator {
            qps: Decimal::from(value),
        })
    }

    fn snap(at: i64, questions: i64) -> CounterSnapshot {
        CounterSnapshot::new(at, [("Questions".to_string(), Decimal::from(questions))])
    }

    mod warm_up_tests {
        use super::*;

        #[tokio::test]
        async fn first_sample_is_zero() {
            let h = harness(1);
            let result = h.sample_at(0, 100).await;

            assert_eq!(result, IndicatorResult::zero(IndicatorKind::Qps, 0));
            assert_eq!(h.engine.samples_taken(), 1);
        }

        #[tokio::test]
        async fn first_n_samples_are_zero_then_rates_flow() {
            let h = harness(3);
            for i in 0..3 {
                let result = h.sample_at(1_000, 100 + i * 100).await;
                assert!(!result.error && !result.reset_detected);
                assert_eq!(result.indicator, Indicator::zero(IndicatorKind::Qps));
            }

            let result = h.sample_at(1_000, 700).await;
            assert_eq!(result.indicator, qps(400));
            assert_eq!(result.time_diff_ms, 1_000);
        }
    }

    mod policy_tests {
        use super::*;

        #[tokio::test]
        async fn computes_rate_between_samples() {
            let h = harness(1);
            h.sample_at(0, 1_000).await;
            let result = h.sample_at(2_000, 1_600).await;

            assert_eq!(result, IndicatorResult::fresh(qps(300), 2_000));
        }

        #[tokio::test]
        async fn too_short_interval_returns_zero() {
            let h = harness(1);
            h.sample_at(0, 1_000).await;
            let result = h.sample_at(100, 5_000).await;

            assert_eq!(result, IndicatorResult::zero(IndicatorKind::Qps, 100));
        }

        #[tokio::test]
        async fn counter_decrease_flags_reset() {
            let h = harness(1);
            h.sample_at(0, 1_000).await;
            let result = h.sample_at(1_000, 10).await;

            assert!(result.reset_detected);
            assert_eq!(result.indicator, Indicator::zero(IndicatorKind::Qps));
            assert!(!result.is_valid());
        }

        #[tokio::test]
        async fn rates_resume_after_reset() {
            let h = harness(1);
            h.sample_at(0, 1_000).await;
            h.sample_at(1_000, 10).await;
            let result = h.sample_at(1_000, 510).await;

            assert_eq!(result, IndicatorResult::fresh(qps(500), 1_000));
        }

        #[tokio::test]
        async fn idle_server_reuses_last_rate() {
            let h = harness(1);
            h.sample_at(0, 1_000).await;
            let fresh = h.sample_at(1_000, 1_200).await;
            let stale = h.sample_at(3_000, 1_200).await;

            assert_eq!(stale.indicator, fresh.indicator);
            assert_eq!(stale.time_diff_ms, 3_000);
            assert!(stale.used_stale_result);
            assert!(stale.is_valid());
        }

        #[tokio::test]
        async fn idle_without_history_returns_zero() {
            let h = harness(1);
            h.sample_at(0, 1_000).await;
            let result = h.sample_at(1_000, 1_000).await;

            assert_eq!(result, IndicatorResult::zero(IndicatorKind::Qps, 1_000));
        }

        #[tokio::test]
        async fn source_failure_returns_error_sentinel() {
            let h = harness(1);
            h.source.set_failing(true);
            let result = h.engine.sample().await;

            assert_eq!(result, IndicatorResult::error(IndicatorKind::Qps));
            assert_eq!(h.engine.samples_taken(), 0);
        }

        #[tokio::test]
        async fn missing_counter_returns_error_sentinel() {
            let h = harness(1);
            let result = h.engine.sample().await;
            assert!(result.error);
        }

        #[tokio::test]
        async fn exhausted_retries_return_error_sentinel() {
            let source = Arc::new(StaticCounterSource::new());
            source.set(CounterGroup::GlobalStatus, "Questions", 1_u64);
            let engine = SnapshotEngine::new(
                QpsFamily::default(),
                source,
                EngineConfig {
                    max_retries: 0,
                    ..EngineConfig::default()
                },
            );

            let result = engine.sample().await;
            assert_eq!(result, IndicatorResult::error(IndicatorKind::Qps));
            assert!(engine.current_snapshot().is_empty());
        }

        #[tokio::test]
        async fn older_snapshot_never_replaces_newer() {
            let h = harness(1);
            h.sample_at(0, 1_000).await;
            let stored = h.engine.current_snapshot();

            let result = h.engine.swap_and_evaluate(snap(stored.captured_at_ms - 10, 900));
            assert_eq!(result, IndicatorResult::zero(IndicatorKind::Qps, 0));
            assert!(Arc::ptr_eq(&h.engine.current_snapshot(), &stored));
        }

        #[tokio::test]
        async fn cache_hit_family_accepts_short_gaps() {
            let source = Arc::new(StaticCounterSource::new());
            let clock = Arc::new(ManualClock::new(0));
            let engine = SnapshotEngine::with_clock(
                CacheHitRateFamily::default(),
                Arc::clone(&source) as Arc<dyn CounterSource>,
                Arc::clone(&clock) as Arc<dyn Clock>,
                EngineConfig {
                    warm_up_samples: 1,
                    ..EngineConfig::default()
                },
            );
            let set = |reads: u64, requests: u64| {
                source.set(CounterGroup::GlobalStatus, CacheHitRateFamily::POOL_READS, reads);
                source.set(CounterGroup::GlobalStatus, CacheHitRateFamily::POOL_READ_AHEAD, 0_u64);
                source.set(
                    CounterGroup::GlobalStatus,
                    CacheHitRateFamily::POOL_READ_REQUESTS,
                    requests,
                );
            };

            set(0, 0);
            engine.sample().await;
            clock.advance(20);
            set(5, 100);
            let result = engine.sample().await;

            assert!(!result.error);
            assert_eq!(result.time_diff_ms, 20);
            assert_eq!(
                result.indicator,
                Indicator::CacheHitRate(crate::types::CacheHitRateIndicator {
                    hit_ratio: "0.95".parse().unwrap()
                })
            );
        }
    }

    mod concurrency_tests {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_samplers_never_lose_a_snapshot() {
            let h = Arc::new(harness(0));
            h.source.set(CounterGroup::GlobalStatus, "Questions", 10_u64);

            let mut tasks = Vec::new();
            for _ in 0..16 {
                let h = Arc::clone(&h);
                tasks.push(tokio::spawn(async move { h.engine.sample().await }));
            }
            for task in tasks {
                let result = task.await.unwrap();
                assert!(!result.reset_detected);
            }

            assert!(h.engine.samples_taken() >= 1);
            assert!(!h.engine.current_snapshot().is_empty());
        }
    }

    mod property_tests {
        use super::*;

        proptest! {
            #[test]
            fn prop_any_decrease_is_a_reset(
                before in 1_i64..1_000_000_000,
                drop in 1_i64..1_000_000_000,
                elapsed in 500_i64..100_000,
            ) {
                let after = (before - drop).max(0).min(before - 1);
                let family = QpsFamily::default();
                let (result, computed) = evaluate(
                    &family,
                    &snap(0, before),
                    &snap(elapsed, after),
                    false,
                    None,
                );
                prop_assert!(result.reset_detected);
                prop_assert!(!computed);
                prop_assert_eq!(result.indicator, Indicator::zero(IndicatorKind::Qps));
            }

            #[test]
            fn prop_idle_reuses_last_computed(
                rate in 1_i64..1_000_000,
                questions in 0_i64..1_000_000,
                elapsed in 500_i64..100_000,
            ) {
                let family = QpsFamily::default();
                let last = IndicatorResult::fresh(qps(rate), 1_000);
                let (result, computed) = evaluate(
                    &family,
                    &snap(0, questions),
                    &snap(elapsed, questions),
                    false,
                    Some(&last),
                );
                prop_assert!(!computed);
                prop_assert_eq!(result, last.into_stale(elapsed));
            }

            #[test]
            fn prop_warm_up_never_flags(
                before in 0_i64..1_000_000,
                after in 0_i64..1_000_000,
                elapsed in 0_i64..100_000,
            ) {
                let family = QpsFamily::default();
                let (result, _) = evaluate(
                    &family,
                    &snap(0, before),
                    &snap(elapsed, after),
                    true,
                    None,
                );
                prop_assert!(!result.error);
                prop_assert!(!result.reset_detected);
                prop_assert_eq!(result.indicator, Indicator::zero(IndicatorKind::Qps));
            }
        }
    }
}
