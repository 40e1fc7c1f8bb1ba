//! Indicator serving.
//!
//! [`MonitorService`] ties the pieces of the data plane together: every
//! request runs provider → cache-aside → producer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use pulse_cache::CacheAside;
use pulse_ingest::IndicatorProducer;
use pulse_metrics::{
    CacheHitRateFamily, ConnectionUsageProbe, CounterSource, DatabaseSizeProbe, IndicatorKind,
    IndicatorProvider, IndicatorResult, MetricsError, NetworkTrafficFamily, QpsFamily,
    SnapshotEngine,
};
use tracing::{debug, warn};

use crate::config::EngineSection;
use crate::error::Result;

/// Builds one provider per indicator family over a shared counter source.
#[must_use]
pub fn build_providers(
    source: &Arc<dyn CounterSource>,
    engine: &EngineSection,
) -> Vec<Arc<dyn IndicatorProvider>> {
    let config = engine.engine_config();
    vec![
        Arc::new(SnapshotEngine::new(
            QpsFamily::new(engine.min_time_diff_ms),
            Arc::clone(source),
            config.clone(),
        )),
        Arc::new(SnapshotEngine::new(
            NetworkTrafficFamily::new(engine.min_time_diff_ms),
            Arc::clone(source),
            config.clone(),
        )),
        Arc::new(ConnectionUsageProbe::new(
            Arc::clone(source),
            engine.fetch_timeout(),
        )),
        Arc::new(SnapshotEngine::new(
            CacheHitRateFamily::new(engine.cache_hit_min_time_diff_ms),
            Arc::clone(source),
            config,
        )),
        Arc::new(DatabaseSizeProbe::new(
            Arc::clone(source),
            engine.fetch_timeout(),
        )),
    ]
}

/// Counters describing what the service has shipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Requests served.
    pub served: u64,
    /// Valid results published.
    pub published: u64,
    /// Publishes that failed.
    pub publish_failures: u64,
    /// Results not published because they were flagged invalid.
    pub withheld: u64,
    /// Results served from the cache, already published when computed.
    pub cached: u64,
}

#[derive(Debug, Default)]
struct Counters {
    served: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    withheld: AtomicU64,
    cached: AtomicU64,
}

/// Serves indicators through the cache and ships every valid computed one.
pub struct MonitorService {
    providers: BTreeMap<IndicatorKind, Arc<dyn IndicatorProvider>>,
    cache: Arc<CacheAside>,
    producer: Arc<IndicatorProducer>,
    counters: Counters,
}

impl MonitorService {
    /// Creates the service. A later provider for the same family replaces an
    /// earlier one.
    #[must_use]
    pub fn new(
        providers: impl IntoIterator<Item = Arc<dyn IndicatorProvider>>,
        cache: Arc<CacheAside>,
        producer: Arc<IndicatorProducer>,
    ) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|provider| (provider.kind(), provider))
                .collect(),
            cache,
            producer,
            counters: Counters::default(),
        }
    }

    /// Families this service can serve.
    pub fn kinds(&self) -> impl Iterator<Item = IndicatorKind> + '_ {
        self.providers.keys().copied()
    }

    /// The cache layer in use.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheAside> {
        &self.cache
    }

    /// Returns a snapshot of the service counters.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            served: self.counters.served.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            withheld: self.counters.withheld.load(Ordering::Relaxed),
            cached: self.counters.cached.load(Ordering::Relaxed),
        }
    }

    /// Returns the current indicator for `kind`.
    ///
    /// Degraded outcomes are flagged on the result. A valid result computed
    /// by this call is published; a cache hit is not published again. A
    /// failed publish is logged and does not affect the result.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndicator` if no provider serves `kind`.
    pub async fn indicator(&self, kind: IndicatorKind) -> Result<IndicatorResult> {
        let provider = self
            .providers
            .get(&kind)
            .ok_or_else(|| MetricsError::UnknownIndicator {
                name: kind.to_string(),
            })?;

        let computed = AtomicBool::new(false);
        let result = self
            .cache
            .get_with_cache(kind.as_str(), || {
                computed.store(true, Ordering::Relaxed);
                provider.sample()
            })
            .await;
        self.counters.served.fetch_add(1, Ordering::Relaxed);

        if !computed.load(Ordering::Relaxed) {
            self.counters.cached.fetch_add(1, Ordering::Relaxed);
            debug!(%kind, "served from cache, not republished");
            return Ok(result);
        }

        if result.is_valid() {
            match self.producer.publish(&result.indicator).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%kind, error = %e, "publish failed, serving result anyway");
                }
            }
        } else {
            self.counters.withheld.fetch_add(1, Ordering::Relaxed);
            debug!(
                %kind,
                error = result.error,
                reset_detected = result.reset_detected,
                "result not published"
            );
        }

        Ok(result)
    }

    /// Like [`indicator`](Self::indicator), for a family given by name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndicator` if `name` is not a family this service serves.
    pub async fn indicator_by_name(&self, name: &str) -> Result<IndicatorResult> {
        let kind: IndicatorKind = name.parse()?;
        self.indicator(kind).await
    }
}

impl std::fmt::Debug for MonitorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorService")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_metrics::SimulatedCounterSource;

    #[test]
    fn one_provider_per_family() {
        let source: Arc<dyn CounterSource> = Arc::new(SimulatedCounterSource::new());
        let providers = build_providers(&source, &EngineSection::default());

        let kinds: Vec<_> = providers.iter().map(|p| p.kind()).collect();
        assert_eq!(kinds, IndicatorKind::ALL.to_vec());
    }
}
