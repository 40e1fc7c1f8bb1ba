//! Point-in-time gauge probes.
//!
//! Connection usage and database size are read directly from a single
//! fetch; there is no snapshot pair, so no reset or stale handling.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::warn;

use crate::engine::IndicatorProvider;
use crate::error::{MetricsError, Result};
use crate::family::round_rate;
use crate::source::CounterSource;
use crate::types::{
    ConnectionUsageIndicator, CounterGroup, CounterMap, DatabaseSizeIndicator, Indicator,
    IndicatorKind, IndicatorResult, SchemaSize,
};

async fn fetch_group(
    source: &dyn CounterSource,
    group: CounterGroup,
    timeout: Duration,
) -> Result<CounterMap> {
    tokio::time::timeout(timeout, source.fetch(group))
        .await
        .map_err(|_| MetricsError::Timeout {
            millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })?
}

fn read_u64(map: &CounterMap, name: &str) -> Result<u64> {
    let raw = map.get(name).ok_or_else(|| MetricsError::MissingCounter {
        name: name.to_string(),
    })?;
    raw.as_decimal()
        .and_then(|d| d.trunc().to_u64())
        .ok_or_else(|| MetricsError::InvalidCounter {
            name: name.to_string(),
            value: raw.to_string(),
        })
}

/// Reports connected and running threads against `max_connections`.
pub struct ConnectionUsageProbe {
    source: Arc<dyn CounterSource>,
    fetch_timeout: Duration,
}

impl ConnectionUsageProbe {
    /// Creates a probe over `source`.
    #[must_use]
    pub fn new(source: Arc<dyn CounterSource>, fetch_timeout: Duration) -> Self {
        Self {
            source,
            fetch_timeout,
        }
    }

    async fn read(&self) -> Result<ConnectionUsageIndicator> {
        let status = fetch_group(&*self.source, CounterGroup::GlobalStatus, self.fetch_timeout).await?;
        let variables =
            fetch_group(&*self.source, CounterGroup::GlobalVariables, self.fetch_timeout).await?;

        let threads_connected = read_u64(&status, "Threads_connected")?;
        let threads_running = read_u64(&status, "Threads_running")?;
        let max_connections = read_u64(&variables, "max_connections")?;

        let usage_ratio = if max_connections == 0 {
            Decimal::ZERO
        } else {
            round_rate(Decimal::from(threads_connected) / Decimal::from(max_connections))
        };

        Ok(ConnectionUsageIndicator {
            threads_connected,
            threads_running,
            max_connections,
            usage_ratio,
        })
    }
}

impl IndicatorProvider for ConnectionUsageProbe {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::ConnectionUsage
    }

    fn sample(&self) -> Pin<Box<dyn Future<Output = IndicatorResult> + Send + '_>> {
        Box::pin(async move {
            match self.read().await {
                Ok(usage) => IndicatorResult::fresh(Indicator::ConnectionUsage(usage), 0),
                Err(e) => {
                    warn!(kind = %self.kind(), error = %e, "connection usage probe failed");
                    IndicatorResult::error(self.kind())
                }
            }
        })
    }
}

/// Reports data and index bytes per schema.
pub struct DatabaseSizeProbe {
    source: Arc<dyn CounterSource>,
    fetch_timeout: Duration,
}

impl DatabaseSizeProbe {
    /// Suffix of per-schema data size counters.
    pub const DATA_SUFFIX: &'static str = ".data_length";
    /// Suffix of per-schema index size counters.
    pub const INDEX_SUFFIX: &'static str = ".index_length";

    /// Creates a probe over `source`.
    #[must_use]
    pub fn new(source: Arc<dyn CounterSource>, fetch_timeout: Duration) -> Self {
        Self {
            source,
            fetch_timeout,
        }
    }

    /// Folds `<schema>.data_length` / `<schema>.index_length` counters into
    /// a sorted per-schema breakdown. Unrecognised keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCounter` if a size counter is not a non-negative integer.
    pub fn summarize(map: &CounterMap) -> Result<DatabaseSizeIndicator> {
        let mut schemas: BTreeMap<String, (u64, u64)> = BTreeMap::new();

        for name in map.keys() {
            if let Some(schema) = name.strip_suffix(Self::DATA_SUFFIX) {
                schemas.entry(schema.to_string()).or_default().0 = read_u64(map, name)?;
            } else if let Some(schema) = name.strip_suffix(Self::INDEX_SUFFIX) {
                schemas.entry(schema.to_string()).or_default().1 = read_u64(map, name)?;
            }
        }

        let schemas: Vec<SchemaSize> = schemas
            .into_iter()
            .map(|(schema, (data_bytes, index_bytes))| SchemaSize {
                schema,
                data_bytes,
                index_bytes,
            })
            .collect();
        let total_bytes = schemas
            .iter()
            .map(|s| s.data_bytes.saturating_add(s.index_bytes))
            .fold(0_u64, u64::saturating_add);

        Ok(DatabaseSizeIndicator {
            total_bytes,
            schemas,
        })
    }
}

impl IndicatorProvider for DatabaseSizeProbe {
    fn kind(&self) -> IndicatorKind {
        IndicatorKind::DatabaseSize
    }

    fn sample(&self) -> Pin<Box<dyn Future<Output = IndicatorResult> + Send + '_>> {
        Box::pin(async move {
            let summary = fetch_group(&*self.source, CounterGroup::SchemaSizes, self.fetch_timeout)
                .await
                .and_then(|map| Self::summarize(&map));
            match summary {
                Ok(size) => IndicatorResult::fresh(Indicator::DatabaseSize(size), 0),
                Err(e) => {
                    warn!(kind = %self.kind(), error = %e, "database size probe failed");
                    IndicatorResult::error(self.kind())
                }
            }
        })
    }
}
