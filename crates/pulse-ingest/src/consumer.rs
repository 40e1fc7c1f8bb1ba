//! Consumer half of the pipeline.
//!
//! A long-lived subscription loop that batches deliveries, validates each
//! message, persists a batch in one transaction and settles every delivery
//! according to the outcome.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Delivery, DeliveryStream, Subscriber};
use crate::error::{IngestError, Result};
use crate::message::MonitorLogRecord;
use crate::snowflake::SnowflakeGenerator;
use crate::store::{InsertLimits, MonitorLogStore};
use crate::validate::validate;

/// Configuration for [`IndicatorConsumer`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume.
    pub queue: String,
    /// Largest batch handed to the store.
    pub batch_size: usize,
    /// Longest a partial batch waits for more deliveries.
    pub batch_wait: Duration,
    /// Pause before resubscribing after the stream breaks.
    pub resubscribe_delay: Duration,
    /// Longest `stop` waits for in-flight batches before cancelling them.
    pub shutdown_wait: Duration,
    /// Upper bound on one batch insert; also how long `stop` waits for
    /// cancelled inserts to roll back.
    pub persist_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: "dbpulse.monitor.indicators".to_string(),
            batch_size: 100,
            batch_wait: Duration::from_secs(1),
            resubscribe_delay: Duration::from_secs(3),
            shutdown_wait: Duration::from_secs(10),
            persist_timeout: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero batch size or zero durations.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::InvalidConfig {
                reason: "batch_size must be positive".to_string(),
            });
        }
        if self.batch_wait.is_zero() || self.persist_timeout.is_zero() {
            return Err(IngestError::InvalidConfig {
                reason: "batch_wait and persist_timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Lifecycle state of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    /// Not subscribed.
    Stopped = 0,
    /// Opening the subscription.
    Starting = 1,
    /// Consuming.
    Running = 2,
    /// Draining in-flight work.
    Stopping = 3,
}

impl ConsumerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Externally visible status; transitional states are never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// The subscription is live (including while draining).
    Running,
    /// No subscription.
    Stopped,
}

impl fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Counters describing what the consumer has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries acknowledged after persistence.
    pub acked: u64,
    /// Deliveries rejected without requeue.
    pub dead_lettered: u64,
    /// Deliveries returned to the queue.
    pub requeued: u64,
    /// Batches committed to the store.
    pub batches_persisted: u64,
    /// Batches whose insert failed.
    pub batches_failed: u64,
    /// Subscriptions reopened after the stream broke.
    pub resubscriptions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
    batches_persisted: AtomicU64,
    batches_failed: AtomicU64,
    resubscriptions: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Shutdown signals for one run of the consume loop.
#[derive(Debug, Clone, Default)]
struct RunSignals {
    /// `stop` has begun: flush the batch being collected.
    stopping: CancellationToken,
    /// The shutdown wait elapsed: roll back inserts still running.
    abandon: CancellationToken,
}

impl RunSignals {
    fn cancel_all(&self) {
        self.stopping.cancel();
        self.abandon.cancel();
    }
}

struct Shared {
    subscriber: Arc<dyn Subscriber>,
    store: Arc<dyn MonitorLogStore>,
    ids: SnowflakeGenerator,
    config: ConsumerConfig,
    state: AtomicU8,
    running: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    signals: Mutex<RunSignals>,
    counters: Counters,
}

/// Decrements the in-flight count on every exit path.
struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Deliveries taken from the stream and not yet settled.
struct Batch<'a> {
    deliveries: Vec<Delivery>,
    in_flight: InFlight<'a>,
}

/// Why a batch stopped growing because the stream itself ended.
enum StreamEnd {
    Completed,
    Failed(IngestError),
}

/// Batches, validates and persists queued indicators.
pub struct IndicatorConsumer {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IndicatorConsumer {
    /// Creates a stopped consumer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` is out of range.
    pub fn new(
        subscriber: Arc<dyn Subscriber>,
        store: Arc<dyn MonitorLogStore>,
        ids: SnowflakeGenerator,
        config: ConsumerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                subscriber,
                store,
                ids,
                config,
                state: AtomicU8::new(ConsumerState::Stopped as u8),
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                signals: Mutex::new(RunSignals::default()),
                counters: Counters::default(),
            }),
            task: Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// `RUNNING` or `STOPPED`.
    #[must_use]
    pub fn status(&self) -> ConsumerStatus {
        match self.state() {
            ConsumerState::Running | ConsumerState::Stopping => ConsumerStatus::Running,
            ConsumerState::Stopped | ConsumerState::Starting => ConsumerStatus::Stopped,
        }
    }

    /// Number of batches holding unsettled deliveries.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Returns a snapshot of the consumer counters.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        let c = &self.shared.counters;
        ConsumerStats {
            acked: c.acked.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            batches_persisted: c.batches_persisted.load(Ordering::Relaxed),
            batches_failed: c.batches_failed.load(Ordering::Relaxed),
            resubscriptions: c.resubscriptions.load(Ordering::Relaxed),
        }
    }

    /// Subscribes and starts the consume loop.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` unless stopped, or the subscription error.
    pub async fn start(&self) -> Result<()> {
        self.transition(ConsumerState::Stopped, ConsumerState::Starting)
            .map_err(|_| IngestError::AlreadyRunning)?;

        let stream = match self.shared.subscriber.subscribe(&self.shared.config.queue).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConsumerState::Stopped);
                return Err(e);
            }
        };

        let signals = RunSignals::default();
        *self.shared.signals.lock() = signals.clone();
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *self.task.lock() = Some(tokio::spawn(shared.run(stream, signals)));
        self.set_state(ConsumerState::Running);
        info!(queue = %self.shared.config.queue, "consumer started");
        Ok(())
    }

    /// Stops consuming, waiting up to `shutdown_wait` for in-flight batches.
    ///
    /// A batch still being collected is requeued. Inserts still running
    /// after the wait are cancelled and rolled back, and their deliveries
    /// requeued; an insert that committed first is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStopped` unless running.
    pub async fn stop(&self) -> Result<()> {
        self.transition(ConsumerState::Running, ConsumerState::Stopping)
            .map_err(|_| IngestError::AlreadyStopped)?;
        self.shared.running.store(false, Ordering::SeqCst);
        let signals = self.shared.signals.lock().clone();
        signals.stopping.cancel();

        let mut drained = self.wait_drained(self.shared.config.shutdown_wait).await;
        if !drained {
            warn!(
                in_flight = self.in_flight(),
                "shutdown wait elapsed, cancelling in-flight inserts"
            );
            signals.abandon.cancel();
            drained = self.wait_drained(self.shared.config.persist_timeout).await;
        }
        if !drained {
            warn!(
                in_flight = self.in_flight(),
                "in-flight work did not settle, abandoning it"
            );
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            // Wait until the loop and its subscription are dropped.
            let _ = task.await;
        }
        self.set_state(ConsumerState::Stopped);
        info!(queue = %self.shared.config.queue, drained, "consumer stopped");
        Ok(())
    }

    async fn wait_drained(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.shared.drained.notified();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.shared.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    fn transition(&self, from: ConsumerState, to: ConsumerState) -> std::result::Result<(), u8> {
        self.shared
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
    }

    fn set_state(&self, state: ConsumerState) {
        self.shared.state.store(state as u8, Ordering::SeqCst);
    }
}

impl fmt::Debug for IndicatorConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndicatorConsumer")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for IndicatorConsumer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.signals.lock().cancel_all();
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>, mut stream: DeliveryStream, signals: RunSignals) {
        loop {
            let (batch, end) = self.collect_batch(&mut stream, &signals.stopping).await;
            if let Some(batch) = batch {
                self.process_batch(batch, &signals.abandon).await;
            }

            if !self.is_running() {
                break;
            }
            let Some(end) = end else {
                continue;
            };
            match end {
                StreamEnd::Completed => warn!("subscription ended unexpectedly"),
                StreamEnd::Failed(e) => warn!(error = %e, "subscription failed"),
            }
            match self.resubscribe().await {
                Some(fresh) => stream = fresh,
                None => break,
            }
        }
        debug!("consume loop exited");
    }

    /// Fills a batch until it is full, `batch_wait` has passed since its
    /// first delivery, or `stopping` is cancelled.
    async fn collect_batch(
        &self,
        stream: &mut DeliveryStream,
        stopping: &CancellationToken,
    ) -> (Option<Batch<'_>>, Option<StreamEnd>) {
        let first = tokio::select! {
            biased;
            () = stopping.cancelled() => return (None, None),
            next = stream.next() => next,
        };
        let mut batch = match first {
            None => return (None, Some(StreamEnd::Completed)),
            Some(Err(e)) => return (None, Some(StreamEnd::Failed(e))),
            Some(Ok(delivery)) => {
                let mut deliveries = Vec::with_capacity(self.config.batch_size);
                deliveries.push(delivery);
                Batch {
                    deliveries,
                    in_flight: InFlight::enter(self),
                }
            }
        };

        let deadline = Instant::now() + self.config.batch_wait;
        while batch.deliveries.len() < self.config.batch_size {
            let next = tokio::select! {
                biased;
                () = stopping.cancelled() => break,
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };
            match next {
                Err(_) => break,
                Ok(None) => return (Some(batch), Some(StreamEnd::Completed)),
                Ok(Some(Err(e))) => return (Some(batch), Some(StreamEnd::Failed(e))),
                Ok(Some(Ok(delivery))) => batch.deliveries.push(delivery),
            }
        }
        (Some(batch), None)
    }

    /// Keeps trying to subscribe while running; `None` once stopped.
    async fn resubscribe(&self) -> Option<DeliveryStream> {
        while self.is_running() {
            tokio::time::sleep(self.config.resubscribe_delay).await;
            if !self.is_running() {
                break;
            }
            match self.subscriber.subscribe(&self.config.queue).await {
                Ok(stream) => {
                    self.counters.resubscriptions.fetch_add(1, Ordering::Relaxed);
                    info!(queue = %self.config.queue, "resubscribed");
                    return Some(stream);
                }
                Err(e) => warn!(error = %e, "resubscribe failed, retrying"),
            }
        }
        None
    }

    fn prepare(&self, delivery: &Delivery) -> Result<MonitorLogRecord> {
        let validated = validate(&delivery.body)?;
        let id = self.ids.next_id()?;
        MonitorLogRecord::from_validated(id, &validated)
    }

    async fn process_batch(&self, batch: Batch<'_>, abandon: &CancellationToken) {
        let Batch {
            deliveries,
            in_flight: _in_flight,
        } = batch;
        let mut records = Vec::with_capacity(deliveries.len());
        let mut accepted = Vec::with_capacity(deliveries.len());

        for delivery in deliveries {
            match self.prepare(&delivery) {
                Ok(record) => {
                    records.push(record);
                    accepted.push(delivery);
                }
                Err(e) if e.is_dead_letter() => {
                    warn!(tag = delivery.tag, error = %e, "dead-lettering message");
                    settle(delivery.reject(false).await, delivery.tag);
                    Counters::add(&self.counters.dead_lettered, 1);
                }
                Err(e) => {
                    warn!(tag = delivery.tag, error = %e, "requeueing message");
                    settle(delivery.reject(true).await, delivery.tag);
                    Counters::add(&self.counters.requeued, 1);
                }
            }
        }

        if accepted.is_empty() {
            return;
        }

        if !self.is_running() {
            debug!(count = accepted.len(), "shutting down, requeueing validated batch");
            self.settle_all(&accepted, Some(true)).await;
            return;
        }

        // The store settles the outcome itself, so a failure here means
        // nothing was committed.
        let limits = InsertLimits {
            timeout: self.config.persist_timeout,
            cancel: abandon.clone(),
        };
        match self.store.insert_batch(&records, &limits).await {
            Ok(inserted) => {
                debug!(inserted, "batch persisted");
                self.settle_all(&accepted, None).await;
                self.counters.batches_persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(count = accepted.len(), error = %e, "batch insert failed, requeueing");
                self.settle_all(&accepted, Some(true)).await;
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Acks every delivery (`None`) or nacks them with the given requeue flag.
    async fn settle_all(&self, deliveries: &[Delivery], nack: Option<bool>) {
        for delivery in deliveries {
            match nack {
                None => settle(delivery.ack().await, delivery.tag),
                Some(requeue) => settle(delivery.nack(requeue).await, delivery.tag),
            }
        }
        match nack {
            None => Counters::add(&self.counters.acked, deliveries.len()),
            Some(true) => Counters::add(&self.counters.requeued, deliveries.len()),
            Some(false) => Counters::add(&self.counters.dead_lettered, deliveries.len()),
        }
    }
}

fn settle(outcome: Result<()>, tag: u64) {
    if let Err(e) = outcome {
        warn!(tag, error = %e, "failed to settle delivery");
    }
}
