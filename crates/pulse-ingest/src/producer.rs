//! Producer half of the pipeline.

use std::sync::Arc;
use std::time::Duration;

use pulse_metrics::{Clock, Indicator, SystemClock};
use tracing::debug;

use crate::broker::Publisher;
use crate::error::{IngestError, Result};
use crate::message::QueuedIndicator;
use crate::validate::parse_source_ip;

/// Where and how indicators are published.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Target exchange.
    pub exchange: String,
    /// Routing key for every indicator.
    pub routing_key: String,
    /// Upper bound on a single publish.
    pub publish_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            exchange: "dbpulse.monitor".to_string(),
            routing_key: "indicator".to_string(),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Publishes indicators observed on one source server.
pub struct IndicatorProducer {
    publisher: Arc<dyn Publisher>,
    config: ProducerConfig,
    source_address: String,
    clock: Arc<dyn Clock>,
}

impl IndicatorProducer {
    /// Creates a producer stamping messages with `source_address`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` if `source_address` is not IPv4, since the
    /// consumer would dead-letter every message.
    pub fn new(
        publisher: Arc<dyn Publisher>,
        config: ProducerConfig,
        source_address: impl Into<String>,
    ) -> Result<Self> {
        let source_address = source_address.into();
        parse_source_ip(&source_address)?;
        Ok(Self {
            publisher,
            config,
            source_address,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the clock used for message timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publishes `indicator` stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `Serialization`, `Broker` or `Timeout`; the caller decides
    /// whether to carry on without the side effect.
    pub async fn publish(&self, indicator: &Indicator) -> Result<()> {
        let message =
            QueuedIndicator::new(self.clock.now_millis(), &self.source_address, indicator.clone());
        let body = message.to_bytes()?;

        tokio::time::timeout(
            self.config.publish_timeout,
            self.publisher
                .publish(&self.config.exchange, &self.config.routing_key, body),
        )
        .await
        .map_err(|_| IngestError::timeout("publish", self.config.publish_timeout))??;

        debug!(kind = %indicator.kind(), exchange = %self.config.exchange, "indicator published");
        Ok(())
    }
}

impl std::fmt::Debug for IndicatorProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorProducer")
            .field("config", &self.config)
            .field("source_address", &self.source_address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Subscriber};
    use crate::validate::validate;
    use futures::StreamExt;
    use futures::future::BoxFuture;
    use pulse_metrics::{IndicatorKind, ManualClock};

    struct HangingPublisher;

    impl Publisher for HangingPublisher {
        fn publish<'a>(&'a self, _: &'a str, _: &'a str, _: Vec<u8>) -> BoxFuture<'a, Result<()>> {
            Box::pin(futures::future::pending())
        }
    }

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        let config = ProducerConfig::default();
        broker.bind(&config.exchange, &config.routing_key, "q");
        broker
    }

    #[test]
    fn rejects_non_ipv4_source() {
        let err = IndicatorProducer::new(
            Arc::new(MemoryBroker::new()),
            ProducerConfig::default(),
            "db.local",
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn published_message_validates_on_the_other_side() {
        let broker = broker();
        let producer = IndicatorProducer::new(
            Arc::new(broker.clone()),
            ProducerConfig::default(),
            "10.1.2.3:3306",
        )
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(1_234)));

        producer
            .publish(&Indicator::zero(IndicatorKind::CacheHitRate))
            .await
            .unwrap();

        let mut stream = broker.subscribe("q").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        let validated = validate(&delivery.body).unwrap();
        assert_eq!(validated.timestamp, 1_234);
        assert_eq!(validated.source_ip, 0x0A01_0203);
        assert_eq!(validated.indicator.kind(), IndicatorKind::CacheHitRate);
    }

    #[tokio::test]
    async fn broker_failure_is_reported() {
        let broker = broker();
        broker.set_publish_failing(true);
        let producer =
            IndicatorProducer::new(Arc::new(broker), ProducerConfig::default(), "10.0.0.1").unwrap();

        let err = producer
            .publish(&Indicator::zero(IndicatorKind::Qps))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Broker { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_broker_times_out() {
        let producer = IndicatorProducer::new(
            Arc::new(HangingPublisher),
            ProducerConfig {
                publish_timeout: Duration::from_millis(200),
                ..ProducerConfig::default()
            },
            "10.0.0.1",
        )
        .unwrap();

        let err = producer
            .publish(&Indicator::zero(IndicatorKind::Qps))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Timeout { operation: "publish", .. }));
    }
}
