//! Rate families: how each indicator turns two snapshots into a value.
//!
//! All arithmetic is fixed-point [`Decimal`] rounded half-up to
//! [`RATE_SCALE`] fractional digits.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::Result;
use crate::types::{
    CacheHitRateIndicator, CounterGroup, CounterSnapshot, Indicator, IndicatorKind,
    NetworkTrafficIndicator, QpsIndicator,
};

/// Fractional digits kept on every computed rate.
pub const RATE_SCALE: u32 = 8;

/// Default minimum gap between two snapshots for rate families.
pub const DEFAULT_MIN_TIME_DIFF_MS: i64 = 500;

/// Default minimum gap between two snapshots for the cache-hit family.
pub const CACHE_HIT_MIN_TIME_DIFF_MS: i64 = 10;

/// Rounds to [`RATE_SCALE`] digits, half away from zero.
#[must_use]
pub fn round_rate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(RATE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts a counter delta over `elapsed_ms` into a per-second rate.
///
/// Returns zero when `elapsed_ms` is not positive.
#[must_use]
pub fn per_second(delta: Decimal, elapsed_ms: i64) -> Decimal {
    if elapsed_ms <= 0 {
        return Decimal::ZERO;
    }
    let millis = Decimal::from(elapsed_ms);
    (delta * Decimal::ONE_THOUSAND)
        .checked_div(millis)
        .map_or(Decimal::ZERO, round_rate)
}

/// Outcome of a family-specific computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateOutcome {
    /// A new value was computed.
    Rate(Indicator),
    /// The denominator delta was not positive; the caller should reuse the
    /// last computed value.
    Idle,
}

/// A family of indicators derived from two counter snapshots.
pub trait RateFamily: Send + Sync {
    /// The indicator family produced.
    fn kind(&self) -> IndicatorKind;

    /// Counter group the tracked counters live in.
    fn group(&self) -> CounterGroup {
        CounterGroup::GlobalStatus
    }

    /// Counters captured into every snapshot.
    fn tracked_counters(&self) -> &'static [&'static str];

    /// Snapshots closer together than this produce a zero result.
    fn min_time_diff_ms(&self) -> i64;

    /// Computes the rate between two snapshots `elapsed_ms` apart.
    ///
    /// Only called once `current` is known not to have gone backwards.
    ///
    /// # Errors
    ///
    /// Returns an error if a tracked counter is missing from a snapshot.
    fn compute(
        &self,
        previous: &CounterSnapshot,
        current: &CounterSnapshot,
        elapsed_ms: i64,
    ) -> Result<RateOutcome>;
}

fn delta(previous: &CounterSnapshot, current: &CounterSnapshot, name: &str) -> Result<Decimal> {
    Ok(current.get(name)? - previous.get(name)?)
}

/// Queries per second from the `Questions` counter.
///
/// An idle server (no new questions) reuses the last computed rate.
#[derive(Debug, Clone)]
pub struct QpsFamily {
    min_time_diff_ms: i64,
}

impl QpsFamily {
    /// Counter holding the cumulative statement count.
    pub const QUESTIONS: &'static str = "Questions";

    /// Creates the family with a custom minimum snapshot gap.
    #[must_use]
    pub const fn new(min_time_diff_ms: i64) -> Self {
        Self { min_time_diff_ms }
    }
}

impl Default for QpsFamily {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_TIME_DIFF_MS)
    }
}

impl RateFamily for QpsFamily {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::Qps
    }

    fn tracked_counters(&self) -> &'static [&'static str] {
        &[Self::QUESTIONS]
    }

    fn min_time_diff_ms(&self) -> i64 {
        self.min_time_diff_ms
    }

    fn compute(
        &self,
        previous: &CounterSnapshot,
        current: &CounterSnapshot,
        elapsed_ms: i64,
    ) -> Result<RateOutcome> {
        let questions = delta(previous, current, Self::QUESTIONS)?;
        if questions <= Decimal::ZERO {
            return Ok(RateOutcome::Idle);
        }
        Ok(RateOutcome::Rate(Indicator::Qps(QpsIndicator {
            qps: per_second(questions, elapsed_ms),
        })))
    }
}

/// Inbound/outbound bytes per second.
///
/// The denominator is elapsed time, so zero traffic is a real reading.
#[derive(Debug, Clone)]
pub struct NetworkTrafficFamily {
    min_time_diff_ms: i64,
}

impl NetworkTrafficFamily {
    /// Cumulative bytes received.
    pub const BYTES_RECEIVED: &'static str = "Bytes_received";
    /// Cumulative bytes sent.
    pub const BYTES_SENT: &'static str = "Bytes_sent";

    /// Creates the family with a custom minimum snapshot gap.
    #[must_use]
    pub const fn new(min_time_diff_ms: i64) -> Self {
        Self { min_time_diff_ms }
    }
}

impl Default for NetworkTrafficFamily {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_TIME_DIFF_MS)
    }
}

impl RateFamily for NetworkTrafficFamily {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::NetworkTraffic
    }

    fn tracked_counters(&self) -> &'static [&'static str] {
        &[Self::BYTES_RECEIVED, Self::BYTES_SENT]
    }

    fn min_time_diff_ms(&self) -> i64 {
        self.min_time_diff_ms
    }

    fn compute(
        &self,
        previous: &CounterSnapshot,
        current: &CounterSnapshot,
        elapsed_ms: i64,
    ) -> Result<RateOutcome> {
        let received = delta(previous, current, Self::BYTES_RECEIVED)?;
        let sent = delta(previous, current, Self::BYTES_SENT)?;
        Ok(RateOutcome::Rate(Indicator::NetworkTraffic(
            NetworkTrafficIndicator {
                bytes_in_per_sec: per_second(received, elapsed_ms),
                bytes_out_per_sec: per_second(sent, elapsed_ms),
            },
        )))
    }
}

/// Buffer-pool hit ratio: `1 - (reads + read_ahead) / read_requests`.
#[derive(Debug, Clone)]
pub struct CacheHitRateFamily {
    min_time_diff_ms: i64,
}

impl CacheHitRateFamily {
    /// Reads that had to go to disk.
    pub const POOL_READS: &'static str = "Innodb_buffer_pool_reads";
    /// Pages prefetched by read-ahead.
    pub const POOL_READ_AHEAD: &'static str = "Innodb_buffer_pool_read_ahead";
    /// Logical read requests.
    pub const POOL_READ_REQUESTS: &'static str = "Innodb_buffer_pool_read_requests";

    /// Creates the family with a custom minimum snapshot gap.
    #[must_use]
    pub const fn new(min_time_diff_ms: i64) -> Self {
        Self { min_time_diff_ms }
    }
}

impl Default for CacheHitRateFamily {
    fn default() -> Self {
        Self::new(CACHE_HIT_MIN_TIME_DIFF_MS)
    }
}

impl RateFamily for CacheHitRateFamily {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::CacheHitRate
    }

    fn tracked_counters(&self) -> &'static [&'static str] {
        &[
            Self::POOL_READS,
            Self::POOL_READ_AHEAD,
            Self::POOL_READ_REQUESTS,
        ]
    }

    fn min_time_diff_ms(&self) -> i64 {
        self.min_time_diff_ms
    }

    fn compute(
        &self,
        previous: &CounterSnapshot,
        current: &CounterSnapshot,
        _elapsed_ms: i64,
    ) -> Result<RateOutcome> {
        let requests = delta(previous, current, Self::POOL_READ_REQUESTS)?;
        if requests <= Decimal::ZERO {
            return Ok(RateOutcome::Idle);
        }
        let misses = delta(previous, current, Self::POOL_READS)?
            + delta(previous, current, Self::POOL_READ_AHEAD)?;

        let ratio = misses
            .checked_div(requests)
            .map_or(Decimal::ZERO, |miss_ratio| Decimal::ONE - miss_ratio);
        let hit_ratio = round_rate(ratio.clamp(Decimal::ZERO, Decimal::ONE));

        Ok(RateOutcome::Rate(Indicator::CacheHitRate(
            CacheHitRateIndicator { hit_ratio },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(at: i64, pairs: &[(&str, i64)]) -> CounterSnapshot {
        CounterSnapshot::new(
            at,
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), Decimal::from(*v))),
        )
    }

    mod rounding_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(1, 3, "333.33333333" ; "repeating fraction")]
        #[test_case(2, 3, "666.66666667" ; "rounds up")]
        #[test_case(300, 1_000, "300" ; "whole rate")]
        #[test_case(5, 0, "0" ; "zero elapsed")]
        fn per_second_rounds_to_scale(delta: i64, elapsed_ms: i64, expected: &str) {
            let rate = per_second(Decimal::from(delta), elapsed_ms);
            assert_eq!(rate, expected.parse::<Decimal>().unwrap());
        }

        #[test]
        fn midpoint_rounds_half_up() {
            let value: Decimal = "0.000000005".parse().unwrap();
            assert_eq!(round_rate(value), "0.00000001".parse::<Decimal>().unwrap());
        }
    }

    mod qps_tests {
        use super::*;

        #[test]
        fn computes_queries_per_second() {
            let family = QpsFamily::default();
            let prev = snap(0, &[("Questions", 1_000)]);
            let cur = snap(2_000, &[("Questions", 1_600)]);

            let outcome = family.compute(&prev, &cur, 2_000).unwrap();
            assert_eq!(
                outcome,
                RateOutcome::Rate(Indicator::Qps(QpsIndicator {
                    qps: Decimal::from(300)
                }))
            );
        }

        #[test]
        fn no_new_questions_is_idle() {
            let family = QpsFamily::default();
            let prev = snap(0, &[("Questions", 1_000)]);
            let cur = snap(1_000, &[("Questions", 1_000)]);
            assert_eq!(family.compute(&prev, &cur, 1_000).unwrap(), RateOutcome::Idle);
        }

        #[test]
        fn missing_counter_is_an_error() {
            let family = QpsFamily::default();
            let prev = snap(0, &[]);
            let cur = snap(1_000, &[("Questions", 1)]);
            assert!(family.compute(&prev, &cur, 1_000).is_err());
        }
    }

    mod traffic_tests {
        use super::*;

        #[test]
        fn computes_both_directions() {
            let family = NetworkTrafficFamily::default();
            let prev = snap(0, &[("Bytes_received", 0), ("Bytes_sent", 0)]);
            let cur = snap(500, &[("Bytes_received", 1_000), ("Bytes_sent", 250)]);

            let RateOutcome::Rate(Indicator::NetworkTraffic(traffic)) =
                family.compute(&prev, &cur, 500).unwrap()
            else {
                panic!("expected traffic rate");
            };
            assert_eq!(traffic.bytes_in_per_sec, Decimal::from(2_000));
            assert_eq!(traffic.bytes_out_per_sec, Decimal::from(500));
        }

        #[test]
        fn zero_traffic_is_a_real_reading() {
            let family = NetworkTrafficFamily::default();
            let prev = snap(0, &[("Bytes_received", 10), ("Bytes_sent", 10)]);
            let outcome = family.compute(&prev, &prev, 1_000).unwrap();
            assert_eq!(
                outcome,
                RateOutcome::Rate(Indicator::NetworkTraffic(NetworkTrafficIndicator::default()))
            );
        }
    }

    mod cache_hit_tests {
        use super::*;
        use test_case::test_case;

        fn pool(at: i64, reads: i64, ahead: i64, requests: i64) -> CounterSnapshot {
            snap(
                at,
                &[
                    ("Innodb_buffer_pool_reads", reads),
                    ("Innodb_buffer_pool_read_ahead", ahead),
                    ("Innodb_buffer_pool_read_requests", requests),
                ],
            )
        }

        #[test_case(10, 0, 1_000, "0.99" ; "mostly hits")]
        #[test_case(0, 0, 1_000, "1" ; "all hits")]
        #[test_case(600, 500, 1_000, "0" ; "clamped at zero")]
        #[test_case(1, 1, 3, "0.33333333" ; "rounded")]
        fn computes_hit_ratio(reads: i64, ahead: i64, requests: i64, expected: &str) {
            let family = CacheHitRateFamily::default();
            let prev = pool(0, 0, 0, 0);
            let cur = pool(100, reads, ahead, requests);

            let RateOutcome::Rate(Indicator::CacheHitRate(hit)) =
                family.compute(&prev, &cur, 100).unwrap()
            else {
                panic!("expected hit ratio");
            };
            assert_eq!(hit.hit_ratio, expected.parse::<Decimal>().unwrap());
        }

        #[test]
        fn no_read_requests_is_idle() {
            let family = CacheHitRateFamily::default();
            let prev = pool(0, 5, 5, 100);
            let cur = pool(100, 5, 5, 100);
            assert_eq!(family.compute(&prev, &cur, 100).unwrap(), RateOutcome::Idle);
        }

        #[test]
        fn uses_shorter_minimum_gap() {
            assert_eq!(
                CacheHitRateFamily::default().min_time_diff_ms(),
                CACHE_HIT_MIN_TIME_DIFF_MS
            );
            assert_eq!(QpsFamily::default().min_time_diff_ms(), DEFAULT_MIN_TIME_DIFF_MS);
        }
    }
}
