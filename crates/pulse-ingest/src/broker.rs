//! Message broker abstraction and an in-memory broker.
//!
//! The broker model is exchange → queue routing with manual per-message
//! acknowledgment. A message rejected without requeue moves to the queue's
//! dead-letter list.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{IngestError, Result};

/// A stream of deliveries; an `Err` item means the subscription broke.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Publishes message bodies to an exchange.
pub trait Publisher: Send + Sync {
    /// Publishes `body` to `exchange` with `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns `Broker` if the message cannot be routed or sent.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Opens consuming subscriptions on queues.
pub trait Subscriber: Send + Sync {
    /// Starts consuming `queue` with manual acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns `Broker` if the queue does not exist or the broker is down.
    fn subscribe<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<DeliveryStream>>;
}

/// Settles deliveries on behalf of a [`Delivery`].
pub trait Acker: Send + Sync {
    /// Acknowledges the delivery.
    fn ack(&self, tag: u64) -> BoxFuture<'_, Result<()>>;

    /// Negatively acknowledges the delivery.
    fn nack(&self, tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>>;

    /// Rejects the delivery.
    fn reject(&self, tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>>;
}

/// One message handed to a consumer, settled exactly once.
pub struct Delivery {
    /// Broker-assigned tag.
    pub tag: u64,
    /// Message body.
    pub body: Vec<u8>,
    /// Whether the message was delivered before.
    pub redelivered: bool,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    #[must_use]
    pub fn new(tag: u64, body: Vec<u8>, redelivered: bool, acker: Arc<dyn Acker>) -> Self {
        Self {
            tag,
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledges the message.
    ///
    /// # Errors
    ///
    /// Returns `Broker` if the broker no longer knows the tag.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack(self.tag).await
    }

    /// Negatively acknowledges the message.
    ///
    /// # Errors
    ///
    /// Returns `Broker` if the broker no longer knows the tag.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(self.tag, requeue).await
    }

    /// Rejects the message; without requeue it is dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns `Broker` if the broker no longer knows the tag.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(self.tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<Message>,
    dead_letters: Vec<Vec<u8>>,
    consumer: Option<(u64, mpsc::UnboundedSender<Result<Delivery>>)>,
}

#[derive(Debug, Default)]
struct State {
    bindings: HashMap<(String, String), String>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_consumer: u64,
    acked: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    publish_failing: AtomicBool,
}

/// Counts for one queue of a [`MemoryBroker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Messages delivered but not yet settled.
    pub unacked: usize,
    /// Messages rejected without requeue.
    pub dead_lettered: usize,
}

/// An in-process broker with manual acknowledgment and dead-lettering.
///
/// Each queue serves one consumer at a time; a new subscription replaces
/// the old one and requeues everything the old one left unsettled.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates a broker with no queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `queue` (idempotent).
    pub fn declare_queue(&self, queue: &str) {
        self.inner
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
    }

    /// Routes `exchange`/`routing_key` to `queue`, declaring it if needed.
    pub fn bind(&self, exchange: &str, routing_key: &str, queue: &str) {
        let mut state = self.inner.state.lock();
        state.queues.entry(queue.to_string()).or_default();
        state.bindings.insert(
            (exchange.to_string(), routing_key.to_string()),
            queue.to_string(),
        );
    }

    /// Makes every publish fail (or succeed again).
    pub fn set_publish_failing(&self, failing: bool) {
        self.inner.publish_failing.store(failing, Ordering::SeqCst);
    }

    /// Breaks the current subscription on `queue` with an error.
    ///
    /// Its unsettled messages go back to the queue.
    pub fn fail_subscription(&self, queue: &str, reason: &str) {
        let mut state = self.inner.state.lock();
        let consumer = state.queues.get_mut(queue).and_then(|q| q.consumer.take());
        if let Some((id, sender)) = consumer {
            let _ = sender.unbounded_send(Err(IngestError::Broker {
                reason: reason.to_string(),
            }));
            sender.close_channel();
            requeue_consumer(&mut state, id);
        }
    }

    /// Counts for `queue`; zeros if it does not exist.
    #[must_use]
    pub fn queue_stats(&self, queue: &str) -> QueueStats {
        let state = self.inner.state.lock();
        let Some(q) = state.queues.get(queue) else {
            return QueueStats::default();
        };
        QueueStats {
            ready: q.ready.len(),
            unacked: state.unacked.values().filter(|u| u.queue == queue).count(),
            dead_lettered: q.dead_letters.len(),
        }
    }

    /// Bodies of messages dead-lettered from `queue`.
    #[must_use]
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Total messages acknowledged across all queues.
    #[must_use]
    pub fn acked_count(&self) -> u64 {
        self.inner.state.lock().acked
    }

    /// Enqueues a raw body directly, bypassing exchange routing.
    pub fn inject(&self, queue: &str, body: Vec<u8>) {
        let mut state = self.inner.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                body,
                redelivered: false,
            });
        self.dispatch(&mut state, queue);
    }

    fn acker(&self) -> Arc<dyn Acker> {
        Arc::new(self.clone())
    }

    fn dispatch(&self, state: &mut State, queue: &str) {
        dispatch(state, queue, &self.acker());
    }

    fn settle(&self, tag: u64, outcome: Outcome) -> Result<()> {
        let mut state = self.inner.state.lock();
        let unacked = state.unacked.remove(&tag).ok_or_else(|| IngestError::Broker {
            reason: format!("unknown delivery tag {tag}"),
        })?;

        match outcome {
            Outcome::Ack => state.acked += 1,
            Outcome::Requeue => {
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.ready.push_back(Message {
                        body: unacked.message.body,
                        redelivered: true,
                    });
                }
                self.dispatch(&mut state, &unacked.queue);
            }
            Outcome::DeadLetter => {
                if let Some(q) = state.queues.get_mut(&unacked.queue) {
                    q.dead_letters.push(unacked.message.body);
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.len())
            .field("unacked", &state.unacked.len())
            .finish_non_exhaustive()
    }
}

impl Publisher for MemoryBroker {
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.inner.publish_failing.load(Ordering::SeqCst) {
                return Err(IngestError::Broker {
                    reason: "broker set to fail".to_string(),
                });
            }
            let mut state = self.inner.state.lock();
            let queue = state
                .bindings
                .get(&(exchange.to_string(), routing_key.to_string()))
                .cloned()
                .ok_or_else(|| IngestError::Broker {
                    reason: format!("no queue bound to {exchange}/{routing_key}"),
                })?;
            state
                .queues
                .entry(queue.clone())
                .or_default()
                .ready
                .push_back(Message {
                    body,
                    redelivered: false,
                });
            self.dispatch(&mut state, &queue);
            Ok(())
        })
    }
}

impl Subscriber for MemoryBroker {
    fn subscribe<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<DeliveryStream>> {
        Box::pin(async move {
            let mut state = self.inner.state.lock();
            state.next_consumer += 1;
            let id = state.next_consumer;
            let (tx, rx) = mpsc::unbounded();

            let previous = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| IngestError::Broker {
                    reason: format!("queue {queue} does not exist"),
                })?
                .consumer
                .replace((id, tx));
            if let Some((old, sender)) = previous {
                sender.close_channel();
                requeue_consumer(&mut state, old);
            }

            self.dispatch(&mut state, queue);
            Ok(rx.boxed())
        })
    }
}

impl Acker for MemoryBroker {
    fn ack(&self, tag: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.settle(tag, Outcome::Ack) })
    }

    fn nack(&self, tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.settle(tag, Outcome::from_requeue(requeue)) })
    }

    fn reject(&self, tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.settle(tag, Outcome::from_requeue(requeue)) })
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Ack,
    Requeue,
    DeadLetter,
}

impl Outcome {
    const fn from_requeue(requeue: bool) -> Self {
        if requeue { Self::Requeue } else { Self::DeadLetter }
    }
}

fn dispatch(state: &mut State, queue: &str, acker: &Arc<dyn Acker>) {
    loop {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some((consumer, sender)) = q.consumer.clone() else {
            return;
        };
        let Some(message) = q.ready.pop_front() else {
            return;
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery::new(
            tag,
            message.body.clone(),
            message.redelivered,
            Arc::clone(acker),
        );

        if sender.unbounded_send(Ok(delivery)).is_err() {
            debug!(queue, consumer, "subscriber went away, message returned to queue");
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_front(message);
                q.consumer = None;
            }
            requeue_consumer(state, consumer);
            continue;
        }

        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                consumer,
                message,
            },
        );
    }
}

/// Returns everything `consumer` left unsettled to its queue.
fn requeue_consumer(state: &mut State, consumer: u64) {
    let mut tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, u)| u.consumer == consumer)
        .map(|(tag, _)| *tag)
        .collect();
    tags.sort_unstable();
    for tag in tags {
        if let Some(unacked) = state.unacked.remove(&tag) {
            if let Some(q) = state.queues.get_mut(&unacked.queue) {
                q.ready.push_back(Message {
                    body: unacked.message.body,
                    redelivered: true,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    const EXCHANGE: &str = "monitor";
    const KEY: &str = "indicator";
    const QUEUE: &str = "monitor.indicators";

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.bind(EXCHANGE, KEY, QUEUE);
        broker
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        stream.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn published_message_is_delivered_and_acked() {
        let broker = broker();
        let mut stream = broker.subscribe(QUEUE).await.unwrap();
        broker.publish(EXCHANGE, KEY, b"hello".to_vec()).await.unwrap();

        let delivery = next(&mut stream).await;
        assert_eq!(delivery.body, b"hello");
        assert!(!delivery.redelivered);
        assert_eq!(broker.queue_stats(QUEUE).unacked, 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.queue_stats(QUEUE), QueueStats::default());
        assert_eq!(broker.acked_count(), 1);
    }

    #[tokio::test]
    async fn messages_wait_for_a_subscriber() {
        let broker = broker();
        broker.publish(EXCHANGE, KEY, b"early".to_vec()).await.unwrap();
        assert_eq!(broker.queue_stats(QUEUE).ready, 1);

        let mut stream = broker.subscribe(QUEUE).await.unwrap();
        assert_eq!(next(&mut stream).await.body, b"early");
    }

    #[tokio::test]
    async fn unroutable_publish_fails() {
        let broker = broker();
        let err = broker.publish(EXCHANGE, "other", vec![]).await.unwrap_err();
        assert!(matches!(err, IngestError::Broker { .. }));
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters() {
        let broker = broker();
        let mut stream = broker.subscribe(QUEUE).await.unwrap();
        broker.publish(EXCHANGE, KEY, b"bad".to_vec()).await.unwrap();

        next(&mut stream).await.reject(false).await.unwrap();

        assert_eq!(broker.dead_letters(QUEUE), vec![b"bad".to_vec()]);
        assert_eq!(broker.queue_stats(QUEUE).unacked, 0);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = broker();
        let mut stream = broker.subscribe(QUEUE).await.unwrap();
        broker.publish(EXCHANGE, KEY, b"retry".to_vec()).await.unwrap();

        next(&mut stream).await.nack(true).await.unwrap();

        let again = next(&mut stream).await;
        assert_eq!(again.body, b"retry");
        assert!(again.redelivered);
        assert!(broker.dead_letters(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn double_settle_is_an_error() {
        let broker = broker();
        let mut stream = broker.subscribe(QUEUE).await.unwrap();
        broker.publish(EXCHANGE, KEY, b"x".to_vec()).await.unwrap();

        let delivery = next(&mut stream).await;
        delivery.ack().await.unwrap();
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test]
    async fn failed_subscription_errors_then_requeues() {
        let broker = broker();
        let mut stream = broker.subscribe(QUEUE).await.unwrap();
        broker.publish(EXCHANGE, KEY, b"held".to_vec()).await.unwrap();
        let held = next(&mut stream).await;

        broker.fail_subscription(QUEUE, "connection reset");

        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        assert!(held.ack().await.is_err());
        assert_eq!(broker.queue_stats(QUEUE).ready, 1);

        let mut fresh = broker.subscribe(QUEUE).await.unwrap();
        let again = next(&mut fresh).await;
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn subscribing_to_unknown_queue_fails() {
        let broker = MemoryBroker::new();
        assert!(broker.subscribe("missing").await.is_err());
    }
}
