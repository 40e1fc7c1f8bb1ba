//! Monitor configuration.
//!
//! Loaded from TOML. Every section is optional and falls back to its
//! defaults, so a config file only needs the values it changes:
//! - Counter source and metric engine tuning
//! - Cache-aside, lock and health-check timings
//! - Broker routing and consumer batching
//! - Historical store location and snowflake worker id
//! - Sampling schedule and logging

use std::path::{Path, PathBuf};
use std::time::Duration;

use pulse_cache::{CacheConfig, HealthConfig};
use pulse_ingest::snowflake::MAX_WORKER_ID;
use pulse_ingest::{ConsumerConfig, ProducerConfig};
use pulse_metrics::{
    CACHE_HIT_MIN_TIME_DIFF_MS, DEFAULT_MIN_TIME_DIFF_MS, DEFAULT_WARM_UP_SAMPLES, EngineConfig,
    IndicatorKind, MAX_RETRIES,
};
use serde::{Deserialize, Serialize};

use crate::error::{PulseError, Result};

/// Where counters come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceSection {
    /// Address of the monitored server, stamped on every published indicator.
    pub address: String,
    /// Use the built-in simulated server.
    pub simulated: bool,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3306".to_string(),
            simulated: true,
        }
    }
}

/// Snapshot engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSection {
    /// Compare-and-swap attempts per sample.
    pub max_retries: u32,
    /// Initial samples that only prime the baseline.
    pub warm_up_samples: u32,
    /// Minimum snapshot gap for rate families.
    pub min_time_diff_ms: i64,
    /// Minimum snapshot gap for the cache hit rate.
    pub cache_hit_min_time_diff_ms: i64,
    /// Bound on each counter fetch.
    pub fetch_timeout_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            warm_up_samples: DEFAULT_WARM_UP_SAMPLES,
            min_time_diff_ms: DEFAULT_MIN_TIME_DIFF_MS,
            cache_hit_min_time_diff_ms: CACHE_HIT_MIN_TIME_DIFF_MS,
            fetch_timeout_ms: 2_000,
        }
    }
}

impl EngineSection {
    /// Engine configuration shared by every rate family.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_retries: self.max_retries,
            warm_up_samples: self.warm_up_samples,
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
        }
    }

    /// Bound on each counter fetch.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Cache-aside, lock and health-check settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSection {
    /// Entry time-to-live; must be shorter than the sampling interval.
    pub ttl_ms: u64,
    /// Longest wait for a per-key lock.
    pub lock_wait_ms: u64,
    /// Lease after which a held lock frees itself.
    pub lock_lease_ms: u64,
    /// Timeout for each cache read or write.
    pub op_timeout_ms: u64,
    /// Interval between store pings.
    pub health_interval_ms: u64,
    /// Timeout for one ping.
    pub health_timeout_ms: u64,
    /// Prefix for every cache key.
    pub key_prefix: String,
}

impl Default for CacheSection {
    fn default() -> Self {
        let cache = CacheConfig::default();
        let health = HealthConfig::default();
        Self {
            ttl_ms: millis(cache.ttl),
            lock_wait_ms: millis(cache.lock_wait),
            lock_lease_ms: millis(cache.lock_lease),
            op_timeout_ms: millis(cache.op_timeout),
            health_interval_ms: millis(health.interval),
            health_timeout_ms: millis(health.timeout),
            key_prefix: cache.key_prefix,
        }
    }
}

impl CacheSection {
    /// Cache-aside configuration.
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_millis(self.ttl_ms),
            lock_wait: Duration::from_millis(self.lock_wait_ms),
            lock_lease: Duration::from_millis(self.lock_lease_ms),
            op_timeout: Duration::from_millis(self.op_timeout_ms),
            key_prefix: self.key_prefix.clone(),
        }
    }

    /// Health checker configuration.
    #[must_use]
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(self.health_interval_ms),
            timeout: Duration::from_millis(self.health_timeout_ms),
        }
    }
}

/// Broker routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerSection {
    /// Exchange indicators are published to.
    pub exchange: String,
    /// Routing key for every indicator.
    pub routing_key: String,
    /// Queue the consumer drains.
    pub queue: String,
    /// Bound on a single publish.
    pub publish_timeout_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        let producer = ProducerConfig::default();
        Self {
            exchange: producer.exchange,
            routing_key: producer.routing_key,
            queue: ConsumerConfig::default().queue,
            publish_timeout_ms: millis(producer.publish_timeout),
        }
    }
}

impl BrokerSection {
    /// Producer configuration.
    #[must_use]
    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
        }
    }
}

/// Consumer batching and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsumerSection {
    /// Run the consumer in this process.
    pub enabled: bool,
    /// Largest batch persisted at once.
    pub batch_size: usize,
    /// Longest a partial batch waits.
    pub batch_wait_ms: u64,
    /// Pause before resubscribing after the stream breaks.
    pub resubscribe_delay_ms: u64,
    /// Longest `stop` waits for in-flight batches.
    pub shutdown_wait_ms: u64,
    /// Bound on one batch insert.
    pub persist_timeout_ms: u64,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        let consumer = ConsumerConfig::default();
        Self {
            enabled: true,
            batch_size: consumer.batch_size,
            batch_wait_ms: millis(consumer.batch_wait),
            resubscribe_delay_ms: millis(consumer.resubscribe_delay),
            shutdown_wait_ms: millis(consumer.shutdown_wait),
            persist_timeout_ms: millis(consumer.persist_timeout),
        }
    }
}

impl ConsumerSection {
    /// Consumer configuration for `queue`.
    #[must_use]
    pub fn consumer_config(&self, queue: &str) -> ConsumerConfig {
        ConsumerConfig {
            queue: queue.to_string(),
            batch_size: self.batch_size,
            batch_wait: Duration::from_millis(self.batch_wait_ms),
            resubscribe_delay: Duration::from_millis(self.resubscribe_delay_ms),
            shutdown_wait: Duration::from_millis(self.shutdown_wait_ms),
            persist_timeout: Duration::from_millis(self.persist_timeout_ms),
        }
    }
}

/// Historical store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database file.
    pub path: PathBuf,
    /// Worker id embedded in generated row ids.
    pub worker_id: u16,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/dbpulse/monitor.db"),
            worker_id: 1,
        }
    }
}

/// Periodic sampling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSection {
    /// Interval between sampling rounds.
    pub interval_ms: u64,
    /// Families sampled every round.
    pub kinds: Vec<IndicatorKind>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            kinds: IndicatorKind::ALL.to_vec(),
        }
    }
}

impl SchedulerSection {
    /// Interval between sampling rounds.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSection {
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json: false,
            filter: "dbpulse=info,pulse_metrics=info,pulse_cache=info,pulse_ingest=info"
                .to_string(),
        }
    }
}

/// Main monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PulseConfig {
    /// Counter source.
    pub source: SourceSection,
    /// Snapshot engine.
    pub engine: EngineSection,
    /// Cache-aside layer.
    pub cache: CacheSection,
    /// Broker routing.
    pub broker: BrokerSection,
    /// Consumer.
    pub consumer: ConsumerSection,
    /// Historical store.
    pub store: StoreSection,
    /// Sampling schedule.
    pub scheduler: SchedulerSection,
    /// Logging.
    pub logging: LoggingSection,
}

impl PulseConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PulseError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PulseError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PulseError::Config(format!("failed to serialize config: {e}")))
    }

    /// Write the configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if !self.source.simulated {
            return Err(PulseError::Config(
                "source.simulated = false requires a database counter source, none is built in"
                    .to_string(),
            ));
        }
        pulse_ingest::parse_source_ip(&self.source.address)
            .map_err(|e| PulseError::Config(format!("source.address: {e}")))?;

        if self.engine.min_time_diff_ms <= 0 || self.engine.cache_hit_min_time_diff_ms <= 0 {
            return Err(PulseError::Config(
                "engine minimum time differences must be greater than 0".to_string(),
            ));
        }
        self.engine
            .engine_config()
            .validate()
            .map_err(|e| PulseError::Config(e.to_string()))?;

        self.cache
            .cache_config()
            .validate()
            .map_err(|e| PulseError::Config(e.to_string()))?;
        self.cache
            .health_config()
            .validate()
            .map_err(|e| PulseError::Config(e.to_string()))?;

        if self.scheduler.interval_ms == 0 {
            return Err(PulseError::Config(
                "scheduler.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.cache.ttl_ms >= self.scheduler.interval_ms {
            return Err(PulseError::Config(format!(
                "cache.ttl_ms ({}) must be shorter than scheduler.interval_ms ({})",
                self.cache.ttl_ms, self.scheduler.interval_ms
            )));
        }
        if self.scheduler.kinds.is_empty() {
            return Err(PulseError::Config(
                "scheduler.kinds cannot be empty".to_string(),
            ));
        }

        if self.broker.exchange.is_empty() || self.broker.queue.is_empty() {
            return Err(PulseError::Config(
                "broker.exchange and broker.queue cannot be empty".to_string(),
            ));
        }
        if self.broker.publish_timeout_ms == 0 {
            return Err(PulseError::Config(
                "broker.publish_timeout_ms must be greater than 0".to_string(),
            ));
        }

        self.consumer
            .consumer_config(&self.broker.queue)
            .validate()
            .map_err(|e| PulseError::Config(e.to_string()))?;

        if self.store.worker_id > MAX_WORKER_ID {
            return Err(PulseError::Config(format!(
                "store.worker_id must be at most {MAX_WORKER_ID}"
            )));
        }

        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
