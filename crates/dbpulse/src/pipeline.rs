//! Assembly of a running monitor from a [`PulseConfig`].
//!
//! The cache store, lock service and broker are the in-process backends;
//! the historical store is SQLite at `store.path`.

use std::sync::Arc;

use pulse_cache::{
    CacheAside, CacheStore, DistributedLock, HealthCheckHandle, HealthChecker, MemoryCacheStore,
    MemoryLockService, WarmUpState, start_health_task,
};
use pulse_ingest::{
    ConsumerStats, ConsumerStatus, IndicatorConsumer, IndicatorProducer, MemoryBroker,
    MonitorLogStore, SnowflakeGenerator, SqliteLogStore,
};
use pulse_metrics::{CounterSource, SimulatedCounterSource};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::PulseConfig;
use crate::error::Result;
use crate::scheduler::{SamplerHandle, start_sampling_task};
use crate::service::{MonitorService, build_providers};

/// Final counters reported on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sampling rounds completed.
    pub rounds: u64,
    /// Consumer counters, if the consumer ran in this process.
    pub consumer: Option<ConsumerStats>,
}

/// A running monitor: sampler, cache, producer and (optionally) consumer.
pub struct Pipeline {
    service: Arc<MonitorService>,
    broker: MemoryBroker,
    store: Arc<SqliteLogStore>,
    consumer: Option<IndicatorConsumer>,
    health: HealthCheckHandle,
    sampler: SamplerHandle,
    warm_listener: JoinHandle<()>,
}

impl Pipeline {
    /// Builds every component and starts the background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the store cannot be
    /// opened, or the consumer cannot subscribe.
    pub async fn start(config: PulseConfig) -> Result<Self> {
        config.validate()?;

        let source: Arc<dyn CounterSource> = Arc::new(SimulatedCounterSource::new());

        let cache_store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let locks: Arc<dyn DistributedLock> = Arc::new(MemoryLockService::new());
        let checker = Arc::new(HealthChecker::new(
            Arc::clone(&cache_store),
            Arc::new(WarmUpState::new()),
            config.cache.health_config(),
        ));
        checker.check_now().await;
        let health = start_health_task(Arc::clone(&checker));
        let (cache, listener) =
            CacheAside::new(cache_store, locks, checker, config.cache.cache_config());
        let warm_listener = listener.spawn();

        let broker = MemoryBroker::new();
        broker.bind(
            &config.broker.exchange,
            &config.broker.routing_key,
            &config.broker.queue,
        );
        let producer = IndicatorProducer::new(
            Arc::new(broker.clone()),
            config.broker.producer_config(),
            config.source.address.clone(),
        )?;

        if let Some(parent) = config.store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(SqliteLogStore::open(&config.store.path)?);

        let consumer = if config.consumer.enabled {
            let consumer = IndicatorConsumer::new(
                Arc::new(broker.clone()),
                Arc::clone(&store) as Arc<dyn MonitorLogStore>,
                SnowflakeGenerator::new(config.store.worker_id)?,
                config.consumer.consumer_config(&config.broker.queue),
            )?;
            consumer.start().await?;
            Some(consumer)
        } else {
            None
        };

        let service = Arc::new(MonitorService::new(
            build_providers(&source, &config.engine),
            Arc::new(cache),
            Arc::new(producer),
        ));
        let sampler = start_sampling_task(
            Arc::clone(&service),
            config.scheduler.kinds.clone(),
            config.scheduler.interval(),
        );

        info!(
            source = %config.source.address,
            store = %config.store.path.display(),
            consumer = config.consumer.enabled,
            interval_ms = config.scheduler.interval_ms,
            "pipeline started"
        );

        Ok(Self {
            service,
            broker,
            store,
            consumer,
            health,
            sampler,
            warm_listener,
        })
    }

    /// The indicator service.
    #[must_use]
    pub fn service(&self) -> &Arc<MonitorService> {
        &self.service
    }

    /// The broker carrying indicators to the consumer.
    #[must_use]
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// The historical store.
    #[must_use]
    pub fn store(&self) -> &Arc<SqliteLogStore> {
        &self.store
    }

    /// The consumer, if it runs in this process.
    #[must_use]
    pub fn consumer(&self) -> Option<&IndicatorConsumer> {
        self.consumer.as_ref()
    }

    /// Consumer status; `STOPPED` when the consumer is disabled.
    #[must_use]
    pub fn consumer_status(&self) -> ConsumerStatus {
        self.consumer
            .as_ref()
            .map_or(ConsumerStatus::Stopped, IndicatorConsumer::status)
    }

    /// Stops sampling, drains the consumer and stops background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer was already stopped.
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        self.sampler.stop();
        self.health.stop();

        let consumer = match &self.consumer {
            Some(consumer) => {
                consumer.stop().await?;
                Some(consumer.stats())
            }
            None => None,
        };
        self.warm_listener.abort();

        let report = ShutdownReport {
            rounds: self.sampler.rounds(),
            consumer,
        };
        info!(rounds = report.rounds, consumer = ?report.consumer, "pipeline stopped");
        Ok(report)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("service", &self.service)
            .field("consumer", &self.consumer)
            .field("sampler_running", &self.sampler.is_running())
            .finish_non_exhaustive()
    }
}
