//! Message-queue ingestion pipeline for health indicators.
#![forbid(unsafe_code)]
//!
//! `pulse-ingest` carries indicators from the sampling service to a
//! historical store: a producer publishes them through an exchange, and a
//! consumer batches, validates and persists them.
//!
//! # Features
//!
//! - **Manual acknowledgment**: a delivery is acked only after its batch commits
//! - **Dead-lettering**: malformed messages are rejected without requeue
//! - **Atomic batches**: one transaction per batch, requeued as a whole on failure
//! - **Snowflake ids**: unique, time-ordered row ids per worker
//! - **Graceful shutdown**: `stop` drains in-flight persistence before returning
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pulse_ingest::{
//!     ConsumerConfig, IndicatorConsumer, IndicatorProducer, MemoryBroker, MemoryLogStore,
//!     MonitorLogStore, ProducerConfig, SnowflakeGenerator,
//! };
//! use pulse_metrics::{Indicator, IndicatorKind};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let broker = MemoryBroker::new();
//! let producer_config = ProducerConfig::default();
//! let consumer_config = ConsumerConfig::default();
//! broker.bind(&producer_config.exchange, &producer_config.routing_key, &consumer_config.queue);
//!
//! let store = Arc::new(MemoryLogStore::new());
//! let consumer = IndicatorConsumer::new(
//!     Arc::new(broker.clone()),
//!     Arc::clone(&store) as Arc<dyn MonitorLogStore>,
//!     SnowflakeGenerator::new(1).unwrap(),
//!     consumer_config,
//! )
//! .unwrap();
//! consumer.start().await.unwrap();
//!
//! let producer = IndicatorProducer::new(Arc::new(broker), producer_config, "10.0.0.7").unwrap();
//! producer.publish(&Indicator::zero(IndicatorKind::Qps)).await.unwrap();
//! # });
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod broker;
pub mod consumer;
pub mod error;
pub mod message;
pub mod producer;
pub mod snowflake;
pub mod store;
pub mod validate;

// Re-export main types at crate root
pub use broker::{
    Acker, Delivery, DeliveryStream, MemoryBroker, Publisher, QueueStats, Subscriber,
};
pub use consumer::{
    ConsumerConfig, ConsumerState, ConsumerStats, ConsumerStatus, IndicatorConsumer,
};
pub use error::{IngestError, Result};
pub use message::{MonitorLogRecord, QueuedIndicator, ValidatedIndicator};
pub use producer::{IndicatorProducer, ProducerConfig};
pub use snowflake::{SnowflakeGenerator, SnowflakeParts, decompose};
pub use store::{InsertLimits, MemoryLogStore, MonitorLogStore, SqliteLogStore};
pub use validate::{parse_source_ip, validate};
