//! The engine facade: topology management, publishing, and acknowledgment.
//!
//! A [`Broker`] is a cheap-clone handle to shared engine state; every clone
//! operates on the same topology and queues, so it can be handed to any
//! number of concurrent publishers and consumers.
//!
//! # Locking discipline
//!
//! Topology mutations (declare, bind, delete) take the store-wide write lock.
//! A publish takes the read lock only long enough to resolve its destination
//! queues, then deposits copies one queue at a time. No more than one queue
//! lock is ever held at once, so fan-out cannot deadlock against other
//! publishers. The price is that fan-out is not atomic across queues: an
//! engine torn down mid-publish can leave a message in some destinations and
//! not others.
//!
//! # Example
//!
//! ```
//! use switchyard::{broker::Broker, message::Headers, topology::ExchangeKind};
//!
//! #[tokio::main]
//! async fn main() -> switchyard::error::Result<()> {
//!     let broker = Broker::default();
//!
//!     broker.declare_exchange("orders", ExchangeKind::Direct, false).await?;
//!     broker.declare_queue("billing", false).await?;
//!     broker.bind("billing", "orders", "order.created").await?;
//!
//!     broker
//!         .publish("orders", "order.created", "{}", Headers::default(), false)
//!         .await?;
//!
//!     let delivery = broker.dispatch("billing", "worker").await?;
//!     broker.ack(delivery.tag).await?;
//!     Ok(())
//! }
//! ```

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    acker::DeliveryAcker,
    config::BrokerConfig,
    consumer::ConsumerHandle,
    error::{BrokerError, Result},
    message::{Delivery, DeliveryTag, Headers, Message},
    queue::QueueState,
    topology::{ExchangeKind, Topology},
};

struct BrokerInner {
    config: BrokerConfig,
    /// Store-wide lock: declares, binds, and deletes serialize here.
    topology: RwLock<Topology>,
    /// Next delivery tag. Tags are unique per engine instance and
    /// monotonically increasing.
    next_tag: AtomicU64,
    /// Maps every outstanding tag to the queue holding its delivery.
    tag_index: DashMap<DeliveryTag, Arc<QueueState>>,
}

/// A handle to the routing engine.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                topology: RwLock::new(Topology::default()),
                next_tag: AtomicU64::new(1),
                tag_index: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Declare an exchange. Idempotent; fails with `TopologyConflict` if an
    /// exchange of the same name exists with a different kind.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        self.inner
            .topology
            .write()
            .await
            .declare_exchange(name, kind, durable)
    }

    /// Declare a queue. Idempotent; fails with `TopologyConflict` on a
    /// durability mismatch.
    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.inner
            .topology
            .write()
            .await
            .declare_queue(name, durable)
            .map(|_| ())
    }

    /// Bind `queue` to `exchange` under `pattern`. For direct exchanges the
    /// pattern is the exact routing key; fanout exchanges ignore it; topic
    /// exchanges interpret `*` and `#` wildcards.
    pub async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.inner.topology.write().await.bind(queue, exchange, pattern)
    }

    /// Remove one `(exchange, queue, pattern)` binding.
    pub async fn unbind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.inner
            .topology
            .write()
            .await
            .unbind(queue, exchange, pattern)
    }

    /// Delete an exchange and all of its bindings. Queue contents are
    /// unaffected.
    pub async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.inner.topology.write().await.delete_exchange(name)
    }

    /// Delete a queue.
    ///
    /// Under the default strict policy this fails with `QueueInUse` while
    /// unacknowledged deliveries exist. With
    /// [`lenient_queue_delete`](BrokerConfig::lenient_queue_delete) the queue
    /// is removed regardless and its outstanding tags become stale.
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut topology = self.inner.topology.write().await;

        // Consumers dispatch through a retained `Arc<QueueState>` without
        // touching the topology lock, so the in-flight check has to be atomic
        // with the seal inside the queue's own tracker lock. A racing
        // dispatch either lands first and blocks a strict delete, or finds
        // the queue sealed and fails.
        let queue = topology.queue(name)?;
        if self.inner.config.strict_queue_delete() {
            queue.seal_if_unused()?;
        } else {
            queue.seal();
        }

        let queue = topology.delete_queue(name)?;
        drop(topology);

        for tag in queue.purge() {
            self.inner.tag_index.remove(&tag);
        }
        Ok(())
    }

    /// Publish a message to `exchange` with `routing_key`.
    ///
    /// Each matching queue receives an independent copy. A publish that
    /// matches no binding succeeds and the message is discarded; a publish to
    /// an undeclared exchange fails with `NotFound`.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Bytes>,
        headers: Headers,
        persistent: bool,
    ) -> Result<()> {
        let destinations = {
            let topology = self.inner.topology.read().await;
            topology.route(exchange, routing_key)?
        };

        debug!(
            exchange,
            routing_key,
            destinations = destinations.len(),
            "publishing message"
        );

        let message = Message::new(payload, headers, persistent);
        // One queue at a time; fan-out is sequential and non-atomic.
        for queue in destinations {
            queue.enqueue(message.clone());
        }
        Ok(())
    }

    /// Non-blocking dispatch from `queue` to `consumer`, using the engine's
    /// default prefetch limit.
    ///
    /// Fails with `Empty` if nothing is ready and `PrefetchExceeded` if
    /// `consumer` is at its unacknowledged limit. Consumers registered via
    /// [`consume`](Self::consume) carry their own limit instead.
    pub async fn dispatch(&self, queue: &str, consumer: &str) -> Result<Delivery> {
        let queue = self.inner.topology.read().await.queue(queue)?;
        self.dispatch_on(&queue, consumer, self.inner.config.default_prefetch)
    }

    /// Acknowledge the delivery identified by `tag`, removing it permanently.
    pub async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let (_, queue) = self
            .inner
            .tag_index
            .remove(&tag)
            .ok_or(BrokerError::UnknownTag { tag })?;
        queue.ack(tag)
    }

    /// Reject the delivery identified by `tag`. With `requeue` the message
    /// returns to the head of its queue for redelivery; without it the
    /// message is dropped.
    pub async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let (_, queue) = self
            .inner
            .tag_index
            .remove(&tag)
            .ok_or(BrokerError::UnknownTag { tag })?;
        queue.nack(tag, requeue)
    }

    /// Register a consumer on `queue` with its own prefetch limit
    /// (`None` uses the engine default).
    pub async fn consume(&self, queue: &str, prefetch: Option<usize>) -> Result<ConsumerHandle> {
        let state = self.inner.topology.read().await.queue(queue)?;
        Ok(ConsumerHandle::new(
            self.clone(),
            state,
            queue,
            prefetch.unwrap_or(self.inner.config.default_prefetch),
        ))
    }

    /// An [`Acker`](crate::acker::Acker) bound to `delivery`'s tag.
    pub fn acker(&self, delivery: &Delivery) -> DeliveryAcker {
        DeliveryAcker::new(self.clone(), delivery.tag)
    }

    /// Emulate a broker restart.
    ///
    /// Non-durable exchanges and queues are dropped, bindings survive only if
    /// both endpoints do, and surviving queues keep only their persistent
    /// messages. Unsettled persistent deliveries return to the head of their
    /// queue marked redelivered, and every outstanding delivery tag becomes
    /// stale.
    pub async fn reset(&self) {
        let mut topology = self.inner.topology.write().await;
        let survivors = topology.reset();
        for queue in survivors {
            queue.reset();
        }
        self.inner.tag_index.clear();
        debug!("engine reset");
    }

    /// Number of ready (undelivered) messages in `queue`.
    pub async fn ready_count(&self, queue: &str) -> Result<usize> {
        Ok(self.inner.topology.read().await.queue(queue)?.ready_count())
    }

    /// Number of unacknowledged deliveries in `queue`.
    pub async fn in_flight_count(&self, queue: &str) -> Result<usize> {
        Ok(self
            .inner
            .topology
            .read()
            .await
            .queue(queue)?
            .in_flight_count())
    }

    /// Dispatch directly against a queue tracker, allocating a fresh tag and
    /// indexing it on success.
    pub(crate) fn dispatch_on(
        &self,
        queue: &Arc<QueueState>,
        consumer: &str,
        prefetch: usize,
    ) -> Result<Delivery> {
        // A tag burned on a failed dispatch is never reused; uniqueness and
        // monotonicity are what matter.
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = queue.dispatch(consumer, prefetch, tag)?;
        self.inner.tag_index.insert(tag, queue.clone());
        Ok(delivery)
    }
}





#[cfg(test)]
mod consuming {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::join;

    use super::helpers::*;
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn recv_wakes_on_publish() {
        let broker = direct_fixture().await;
        let consumer = broker.consume("q1", None).await.unwrap();
        let pending = consume_next(consumer);

        publish(&broker, "poc.direct.exchange", "k1", "wake").await;

        let delivery = with_timeout(pending).await.expect("consumer starved");
        assert_eq!(delivery.payload, "wake");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn single_message_delivers_to_exactly_one_consumer() {
        let broker = direct_fixture().await;
        let c1 = broker.consume("q1", None).await.unwrap();
        let c2 = broker.consume("q1", None).await.unwrap();

        let (r1, r2) = (consume_next(c1), consume_next(c2));
        publish(&broker, "poc.direct.exchange", "k1", "only-one").await;

        let (r1, r2) = join!(with_timeout(r1), with_timeout(r2));
        assert!(r1.is_none() || r2.is_none());
        assert!([r1, r2]
            .into_iter()
            .flatten()
            .any(|d| d.payload == "only-one"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn recv_wakes_when_ack_frees_a_prefetch_slot() {
        let broker = direct_fixture().await;
        publish(&broker, "poc.direct.exchange", "k1", "a").await;
        publish(&broker, "poc.direct.exchange", "k1", "b").await;

        let consumer = broker.consume("q1", Some(1)).await.unwrap();
        let first = consumer.recv().await.unwrap();

        // At the prefetch limit: the next recv must block until the ack.
        let pending = tokio::spawn(async move {
            let second = consumer.recv().await.unwrap();
            (consumer, second)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        broker.ack(first.tag).await.unwrap();
        let (_, second) = with_timeout(pending).await.expect("recv never woke");
        assert_eq!(second.payload, "b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn cancel_aborts_a_pending_wait() {
        let broker = direct_fixture().await;
        let consumer = broker.consume("q1", None).await.unwrap();
        let token = consumer.cancellation_token();

        let pending = tokio::spawn(async move { consumer.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = with_timeout(pending).await.expect("cancel did not abort");
        assert!(result.is_none());

        // No side effects: the queue still delivers to others.
        publish(&broker, "poc.direct.exchange", "k1", "later").await;
        assert_eq!(broker.ready_count("q1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recv_timeout_reports_empty() {
        let broker = direct_fixture().await;
        let consumer = broker.consume("q1", None).await.unwrap();

        let result = consumer.recv_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(BrokerError::Empty { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn stream_yields_deliveries_until_cancel() {
        let broker = direct_fixture().await;
        // Prefetch of 2 so both messages can be outstanding at once.
        let consumer = broker.consume("q1", Some(2)).await.unwrap();
        let token = consumer.cancellation_token();

        publish(&broker, "poc.direct.exchange", "k1", "1").await;
        publish(&broker, "poc.direct.exchange", "k1", "2").await;

        let mut stream = Box::pin(consumer.into_stream());
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.payload, "1");
        assert_eq!(second.payload, "2");

        token.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn try_next_is_non_blocking() {
        let broker = direct_fixture().await;
        let consumer = broker.consume("q1", None).await.unwrap();
        assert!(matches!(
            consumer.try_next(),
            Err(BrokerError::Empty { .. })
        ));
    }
}

#[cfg(test)]
mod durability {
    use super::helpers::*;
    use super::*;

    async fn durable_fixture() -> Broker {
        let broker = Broker::default();
        broker
            .declare_exchange("ex", ExchangeKind::Direct, true)
            .await
            .unwrap();
        broker.declare_queue("q", true).await.unwrap();
        broker.bind("q", "ex", "k").await.unwrap();
        broker
    }

    #[tokio::test]
    async fn reset_keeps_durable_topology_and_persistent_messages() {
        let broker = durable_fixture().await;
        broker.declare_queue("transient", false).await.unwrap();
        broker.bind("transient", "ex", "k").await.unwrap();

        broker
            .publish("ex", "k", "persistent", Headers::default(), true)
            .await
            .unwrap();
        broker
            .publish("ex", "k", "transient", Headers::default(), false)
            .await
            .unwrap();

        broker.reset().await;

        // The non-durable queue is gone along with its binding.
        assert!(matches!(
            broker.ready_count("transient").await,
            Err(BrokerError::NotFound { .. })
        ));
        // The durable queue kept only the persistent message.
        assert_eq!(broker.ready_count("q").await.unwrap(), 1);

        // The surviving binding still routes.
        publish(&broker, "ex", "k", "after").await;
        assert_eq!(broker.ready_count("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reset_ends_consumers_of_dropped_queues() {
        let broker = durable_fixture().await;
        broker.declare_queue("transient", false).await.unwrap();

        let consumer = broker.consume("transient", None).await.unwrap();
        broker.reset().await;

        assert!(matches!(
            consumer.try_next(),
            Err(BrokerError::NotFound { .. })
        ));
        assert!(consumer.recv().await.is_none());
    }

    #[tokio::test]
    async fn reset_requeues_persistent_in_flight_as_redelivered() {
        let broker = durable_fixture().await;
        broker
            .publish("ex", "k", "unsettled", Headers::default(), true)
            .await
            .unwrap();

        let delivery = broker.dispatch("q", "c").await.unwrap();
        broker.reset().await;

        // The old tag is stale, and the message is ready again.
        assert!(matches!(
            broker.ack(delivery.tag).await,
            Err(BrokerError::UnknownTag { .. })
        ));
        let redelivered = broker.dispatch("q", "c").await.unwrap();
        assert_eq!(redelivered.payload, "unsettled");
        assert!(redelivered.redelivered);
    }
}
