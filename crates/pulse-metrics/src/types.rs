//! Core types for the indicator engine.
//!
//! This module provides the values that flow between the counter source,
//! the rate engine and every downstream consumer:
//! - [`CounterSnapshot`]: an immutable, timestamped capture of named counters
//! - [`IndicatorKind`]: the five indicator families
//! - [`Indicator`]: the family-specific payload (a tagged sum type)
//! - [`IndicatorResult`]: a payload plus its status flags

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

/// Named group of counters the source can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterGroup {
    /// Cumulative server status counters (`SHOW GLOBAL STATUS`).
    GlobalStatus,
    /// Server configuration variables (`SHOW GLOBAL VARIABLES`).
    GlobalVariables,
    /// Per-schema storage sizes, keyed `<schema>.data_length` / `<schema>.index_length`.
    SchemaSizes,
}

impl CounterGroup {
    /// Returns the group name as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GlobalStatus => "global_status",
            Self::GlobalVariables => "global_variables",
            Self::SchemaSizes => "schema_sizes",
        }
    }
}

impl fmt::Display for CounterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw counter value as reported by the server.
///
/// Servers report most counters as text, so both forms are accepted and
/// interpreted lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CounterValue {
    /// A numeric value.
    Number(Decimal),
    /// A textual value, numeric or not.
    Text(String),
}

impl CounterValue {
    /// Interprets the value as a decimal number, if possible.
    #[must_use]
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => Decimal::from_str(s.trim()).ok(),
        }
    }
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for CounterValue {
    fn from(value: u64) -> Self {
        Self::Number(Decimal::from(value))
    }
}

impl From<&str> for CounterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A counter-name → value mapping for one counter group.
pub type CounterMap = HashMap<String, CounterValue>;

/// An immutable capture of one or more named counters.
///
/// Snapshots are never mutated; a new one is built for every sample and the
/// engine swaps it in atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Capture time, Unix milliseconds.
    pub captured_at_ms: i64,
    counters: BTreeMap<String, Decimal>,
}

impl CounterSnapshot {
    /// Returns the "no sample yet" sentinel.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            captured_at_ms: 0,
            counters: BTreeMap::new(),
        }
    }

    /// Builds a snapshot holding the given numeric counters.
    #[must_use]
    pub fn new(captured_at_ms: i64, counters: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        Self {
            captured_at_ms,
            counters: counters.into_iter().collect(),
        }
    }

    /// Captures the `tracked` counters out of a raw reading.
    ///
    /// # Errors
    ///
    /// Returns `MissingCounter` if a tracked counter is absent and
    /// `InvalidCounter` if it is not numeric.
    pub fn capture(captured_at_ms: i64, reading: &CounterMap, tracked: &[&str]) -> Result<Self> {
        let mut counters = BTreeMap::new();
        for name in tracked {
            let raw = reading.get(*name).ok_or_else(|| MetricsError::MissingCounter {
                name: (*name).to_string(),
            })?;
            let value = raw.as_decimal().ok_or_else(|| MetricsError::InvalidCounter {
                name: (*name).to_string(),
                value: raw.to_string(),
            })?;
            counters.insert((*name).to_string(), value);
        }
        Ok(Self {
            captured_at_ms,
            counters,
        })
    }

    /// Returns true for the sentinel produced by [`CounterSnapshot::empty`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Returns a counter's value.
    ///
    /// # Errors
    ///
    /// Returns `MissingCounter` if the snapshot does not hold `name`.
    pub fn get(&self, name: &str) -> Result<Decimal> {
        self.counters
            .get(name)
            .copied()
            .ok_or_else(|| MetricsError::MissingCounter {
                name: name.to_string(),
            })
    }

    /// Iterates over the captured counters in name order.
    pub fn counters(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Returns true if any counter present in both snapshots went backwards.
    ///
    /// A decrease means the server's own counters were reset (e.g. a restart).
    #[must_use]
    pub fn went_backwards_from(&self, previous: &Self) -> bool {
        self.counters.iter().any(|(name, value)| {
            previous
                .counters
                .get(name)
                .is_some_and(|before| value < before)
        })
    }
}

/// The five indicator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    /// Queries per second.
    Qps,
    /// Inbound and outbound network throughput.
    NetworkTraffic,
    /// Connected threads against the connection limit.
    ConnectionUsage,
    /// Buffer-pool cache hit ratio.
    CacheHitRate,
    /// On-disk size of every schema.
    DatabaseSize,
}

impl IndicatorKind {
    /// Every family, in a stable order.
    pub const ALL: [Self; 5] = [
        Self::Qps,
        Self::NetworkTraffic,
        Self::ConnectionUsage,
        Self::CacheHitRate,
        Self::DatabaseSize,
    ];

    /// Returns the wire/storage tag for this family.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Qps => "qps",
            Self::NetworkTraffic => "network_traffic",
            Self::ConnectionUsage => "connection_usage",
            Self::CacheHitRate => "cache_hit_rate",
            Self::DatabaseSize => "database_size",
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndicatorKind {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MetricsError::UnknownIndicator {
                name: s.to_string(),
            })
    }
}

/// Query throughput.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QpsIndicator {
    /// Queries per second.
    pub qps: Decimal,
}

/// Network throughput.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkTrafficIndicator {
    /// Bytes received by the server per second.
    pub bytes_in_per_sec: Decimal,
    /// Bytes sent by the server per second.
    pub bytes_out_per_sec: Decimal,
}

/// Connection usage at the time of sampling.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionUsageIndicator {
    /// Currently open connections.
    pub threads_connected: u64,
    /// Connections actively executing.
    pub threads_running: u64,
    /// Configured connection limit.
    pub max_connections: u64,
    /// `threads_connected / max_connections`, in `[0, 1]`.
    pub usage_ratio: Decimal,
}

/// Buffer-pool hit ratio.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheHitRateIndicator {
    /// Fraction of read requests served from memory, in `[0, 1]`.
    pub hit_ratio: Decimal,
}

/// Storage used by one schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSize {
    /// Schema name.
    pub schema: String,
    /// Table data bytes.
    pub data_bytes: u64,
    /// Index bytes.
    pub index_bytes: u64,
}

/// Storage used by every schema.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseSizeIndicator {
    /// Sum of data and index bytes over all schemas.
    pub total_bytes: u64,
    /// Per-schema breakdown, sorted by schema name.
    pub schemas: Vec<SchemaSize>,
}

/// A family-specific indicator payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Indicator {
    /// See [`QpsIndicator`].
    Qps(QpsIndicator),
    /// See [`NetworkTrafficIndicator`].
    NetworkTraffic(NetworkTrafficIndicator),
    /// See [`ConnectionUsageIndicator`].
    ConnectionUsage(ConnectionUsageIndicator),
    /// See [`CacheHitRateIndicator`].
    CacheHitRate(CacheHitRateIndicator),
    /// See [`DatabaseSizeIndicator`].
    DatabaseSize(DatabaseSizeIndicator),
}

impl Indicator {
    /// Returns the all-zero payload for a family.
    #[must_use]
    pub fn zero(kind: IndicatorKind) -> Self {
        match kind {
            IndicatorKind::Qps => Self::Qps(QpsIndicator::default()),
            IndicatorKind::NetworkTraffic => Self::NetworkTraffic(NetworkTrafficIndicator::default()),
            IndicatorKind::ConnectionUsage => {
                Self::ConnectionUsage(ConnectionUsageIndicator::default())
            }
            IndicatorKind::CacheHitRate => Self::CacheHitRate(CacheHitRateIndicator::default()),
            IndicatorKind::DatabaseSize => Self::DatabaseSize(DatabaseSizeIndicator::default()),
        }
    }

    /// Returns the family this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> IndicatorKind {
        match self {
            Self::Qps(_) => IndicatorKind::Qps,
            Self::NetworkTraffic(_) => IndicatorKind::NetworkTraffic,
            Self::ConnectionUsage(_) => IndicatorKind::ConnectionUsage,
            Self::CacheHitRate(_) => IndicatorKind::CacheHitRate,
            Self::DatabaseSize(_) => IndicatorKind::DatabaseSize,
        }
    }
}

/// The outcome of one indicator computation.
///
/// Exactly one of these holds: a fresh value, a stale reused value
/// (`used_stale_result`), a zero value (including `reset_detected`), or the
/// error sentinel (`error`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorResult {
    /// The computed payload.
    pub indicator: Indicator,
    /// Milliseconds between the two snapshots that produced this result.
    pub time_diff_ms: i64,
    /// The server's counters went backwards between the two snapshots.
    pub reset_detected: bool,
    /// The payload was carried over from the last computed result.
    pub used_stale_result: bool,
    /// The computation failed; the payload is all zeros.
    pub error: bool,
}

impl IndicatorResult {
    /// A freshly computed result.
    #[must_use]
    pub const fn fresh(indicator: Indicator, time_diff_ms: i64) -> Self {
        Self {
            indicator,
            time_diff_ms,
            reset_detected: false,
            used_stale_result: false,
            error: false,
        }
    }

    /// A zero-valued result that is not an error.
    #[must_use]
    pub fn zero(kind: IndicatorKind, time_diff_ms: i64) -> Self {
        Self::fresh(Indicator::zero(kind), time_diff_ms)
    }

    /// A zero-valued result flagged as a counter reset.
    #[must_use]
    pub fn reset(kind: IndicatorKind, time_diff_ms: i64) -> Self {
        Self {
            reset_detected: true,
            ..Self::zero(kind, time_diff_ms)
        }
    }

    /// The error sentinel: all zeros with `error` set.
    #[must_use]
    pub fn error(kind: IndicatorKind) -> Self {
        Self {
            error: true,
            ..Self::zero(kind, 0)
        }
    }

    /// Re-stamps a previously computed result for reuse.
    #[must_use]
    pub fn into_stale(self, time_diff_ms: i64) -> Self {
        Self {
            time_diff_ms,
            used_stale_result: true,
            ..self
        }
    }

    /// Returns the family of the payload.
    #[must_use]
    pub const fn kind(&self) -> IndicatorKind {
        self.indicator.kind()
    }

    /// Whether the result is worth caching and reporting.
    ///
    /// A zero value is a legitimate idle reading and counts as valid.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        !self.error && !self.reset_detected
    }
}
