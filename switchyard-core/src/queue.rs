//! Per-queue message state: the delivery tracker.
//!
//! Each queue owns a FIFO of ready messages and a table of in-flight
//! (unacknowledged) deliveries. A message instance moves through
//! `Ready → Delivered → {Acked, Requeued → Ready, Dropped}`; acked and
//! dropped are terminal. Requeued messages are re-inserted at the *head* of
//! the ready FIFO so redelivery takes priority over newer messages.
//!
//! All state sits behind a short-lived [`std::sync::Mutex`] that is never
//! held across an await point. Waiters (blocking consumers) park on a
//! [`Notify`] and re-check the tracker whenever a message is enqueued or a
//! prefetch slot is freed by an ack/nack.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use tokio::sync::Notify;
use tracing::trace;

use crate::{
    error::{BrokerError, EntityKind, Result},
    message::{Delivery, DeliveryTag, Message},
};

/// A message instance sitting in the ready FIFO.
#[derive(Clone, Debug)]
struct ReadyMessage {
    message: Message,
    redelivered: bool,
}

/// One unacknowledged delivery.
#[derive(Debug)]
struct InFlight {
    message: Message,
    redelivered: bool,
    consumer: String,
}

#[derive(Debug, Default)]
struct TrackerInner {
    ready: VecDeque<ReadyMessage>,
    in_flight: HashMap<DeliveryTag, InFlight>,
    /// Unacknowledged-delivery count per consumer, for prefetch enforcement.
    /// Entries are removed when they reach zero.
    unacked: HashMap<String, usize>,
    /// Set once the queue is removed from the topology. Consumers may still
    /// hold an `Arc` to this state afterwards; the flag makes their dispatch
    /// attempts fail instead of draining a queue that no longer exists.
    sealed: bool,
}

/// The live state of one declared queue.
///
/// Shared between the topology (which owns the authoritative name → queue
/// mapping) and any outstanding consumers, so deleting a queue from the
/// topology does not invalidate deliveries already handed out.
#[derive(Debug)]
pub(crate) struct QueueState {
    name: String,
    durable: bool,
    inner: Mutex<TrackerInner>,
    /// Woken whenever a message becomes ready or a prefetch slot frees up.
    notify: Notify,
}

impl QueueState {
    pub(crate) fn new(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            durable,
            inner: Mutex::new(TrackerInner::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn durable(&self) -> bool {
        self.durable
    }

    /// Register interest in the next wakeup. Must be polled (or enabled)
    /// *before* re-checking the tracker to avoid losing a notification.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Deposit a message copy at the tail of the ready FIFO.
    ///
    /// A copy arriving after the queue was sealed is silently discarded, the
    /// same fate it would meet in the purge.
    pub(crate) fn enqueue(&self, message: Message) {
        let mut inner = self.lock();
        if inner.sealed {
            return;
        }
        inner.ready.push_back(ReadyMessage {
            message,
            redelivered: false,
        });
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Pop the head of the ready FIFO and move it to in-flight under `tag`.
    ///
    /// Fails with [`BrokerError::PrefetchExceeded`] if `consumer` already has
    /// `prefetch` unacknowledged deliveries, [`BrokerError::Empty`] if no
    /// message is ready, and [`BrokerError::NotFound`] once the queue has been
    /// sealed by deletion. On failure the tracker is left unchanged and the
    /// tag is not consumed.
    pub(crate) fn dispatch(
        &self,
        consumer: &str,
        prefetch: usize,
        tag: DeliveryTag,
    ) -> Result<Delivery> {
        let mut inner = self.lock();

        if inner.sealed {
            return Err(BrokerError::NotFound {
                kind: EntityKind::Queue,
                name: self.name.clone(),
            });
        }

        let outstanding = inner.unacked.get(consumer).copied().unwrap_or(0);
        if outstanding >= prefetch {
            return Err(BrokerError::PrefetchExceeded {
                consumer: consumer.to_string(),
                limit: prefetch,
            });
        }

        let head = inner.ready.pop_front().ok_or_else(|| BrokerError::Empty {
            name: self.name.clone(),
        })?;

        let delivery = Delivery {
            tag,
            queue: self.name.clone(),
            payload: head.message.payload.clone(),
            headers: head.message.headers.clone(),
            redelivered: head.redelivered,
        };

        inner.in_flight.insert(
            tag,
            InFlight {
                message: head.message,
                redelivered: head.redelivered,
                consumer: consumer.to_string(),
            },
        );
        *inner.unacked.entry(consumer.to_string()).or_insert(0) += 1;

        trace!(queue = %self.name, tag, consumer, "dispatched message");
        Ok(delivery)
    }

    /// Settle `tag` positively: the delivery is removed for good.
    pub(crate) fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut inner = self.lock();
        let in_flight = inner
            .in_flight
            .remove(&tag)
            .ok_or(BrokerError::UnknownTag { tag })?;
        release_slot(&mut inner, &in_flight.consumer);
        drop(inner);

        trace!(queue = %self.name, tag, "acked");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Settle `tag` negatively. With `requeue` the message returns to the
    /// head of the ready FIFO marked redelivered; otherwise it is dropped.
    pub(crate) fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut inner = self.lock();
        let in_flight = inner
            .in_flight
            .remove(&tag)
            .ok_or(BrokerError::UnknownTag { tag })?;
        release_slot(&mut inner, &in_flight.consumer);

        if requeue {
            inner.ready.push_front(ReadyMessage {
                message: in_flight.message,
                redelivered: true,
            });
        }
        drop(inner);

        trace!(queue = %self.name, tag, requeue, "nacked");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Mark the queue deleted unconditionally. Subsequent dispatches fail
    /// with `NotFound` and subsequent enqueues are discarded; waiters are
    /// woken so blocked consumers observe the deletion.
    pub(crate) fn seal(&self) {
        let mut inner = self.lock();
        inner.sealed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Like [`seal`](Self::seal), but fails with [`BrokerError::QueueInUse`]
    /// if unacknowledged deliveries exist. The check and the seal happen under
    /// one tracker lock, so a dispatch either completes before the seal (and
    /// blocks it) or fails after it; nothing can slip through in between.
    pub(crate) fn seal_if_unused(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.in_flight.is_empty() {
            return Err(BrokerError::QueueInUse {
                name: self.name.clone(),
                in_flight: inner.in_flight.len(),
            });
        }
        inner.sealed = true;
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Drop all state, returning the tags that were outstanding so the owner
    /// can invalidate them. Used by lenient queue deletion.
    pub(crate) fn purge(&self) -> Vec<DeliveryTag> {
        let mut inner = self.lock();
        inner.ready.clear();
        inner.unacked.clear();
        inner.in_flight.drain().map(|(tag, _)| tag).collect()
    }

    /// Apply restart semantics to this queue's messages.
    ///
    /// Persistent in-flight deliveries were handed out but never settled, so
    /// they return to the head of the FIFO (in dispatch order) marked
    /// redelivered. Non-persistent messages are dropped wholesale. All
    /// outstanding tags are invalidated and returned.
    pub(crate) fn reset(&self) -> Vec<DeliveryTag> {
        let mut inner = self.lock();

        inner.ready.retain(|m| m.message.persistent);
        inner.unacked.clear();

        let mut recovered: Vec<(DeliveryTag, InFlight)> = inner.in_flight.drain().collect();
        recovered.sort_by_key(|(tag, _)| *tag);

        let mut tags = Vec::with_capacity(recovered.len());
        for (tag, in_flight) in recovered.into_iter().rev() {
            tags.push(tag);
            if in_flight.message.persistent {
                inner.ready.push_front(ReadyMessage {
                    message: in_flight.message,
                    redelivered: true,
                });
            }
        }
        drop(inner);

        self.notify.notify_waiters();
        tags
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        // The tracker mutex is never held across an await, so a poisoned
        // lock means a panic mid-mutation on another thread. There is no
        // sensible recovery; propagate the panic.
        self.inner.lock().expect("queue tracker lock poisoned")
    }
}

fn release_slot(inner: &mut TrackerInner, consumer: &str) {
    if let Some(count) = inner.unacked.get_mut(consumer) {
        *count -= 1;
        if *count == 0 {
            inner.unacked.remove(consumer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Headers;

    fn msg(payload: &str) -> Message {
        Message::new(payload.to_string(), Headers::default(), false)
    }

    fn persistent_msg(payload: &str) -> Message {
        Message::new(payload.to_string(), Headers::default(), true)
    }

    #[test]
    fn dispatch_is_fifo() {
        let queue = QueueState::new("q", false);
        queue.enqueue(msg("1"));
        queue.enqueue(msg("2"));

        let first = queue.dispatch("c", 10, 1).unwrap();
        let second = queue.dispatch("c", 10, 2).unwrap();
        assert_eq!(first.payload, "1");
        assert_eq!(second.payload, "2");
    }

    #[test]
    fn empty_queue_reports_empty() {
        let queue = QueueState::new("q", false);
        assert!(matches!(
            queue.dispatch("c", 1, 1),
            Err(BrokerError::Empty { .. })
        ));
    }

    #[test]
    fn ack_removes_permanently() {
        let queue = QueueState::new("q", false);
        queue.enqueue(msg("1"));

        let delivery = queue.dispatch("c", 1, 1).unwrap();
        queue.ack(delivery.tag).unwrap();

        assert_eq!(queue.in_flight_count(), 0);
        assert!(matches!(
            queue.dispatch("c", 1, 2),
            Err(BrokerError::Empty { .. })
        ));
        // Settled tags are stale.
        assert!(matches!(
            queue.ack(delivery.tag),
            Err(BrokerError::UnknownTag { .. })
        ));
    }

    #[test]
    fn nack_with_requeue_prioritizes_redelivery() {
        let queue = QueueState::new("q", false);
        queue.enqueue(msg("1"));
        queue.enqueue(msg("2"));

        let first = queue.dispatch("c", 1, 1).unwrap();
        assert!(!first.redelivered);
        queue.nack(first.tag, true).unwrap();

        // The requeued message jumps ahead of "2".
        let again = queue.dispatch("c", 1, 2).unwrap();
        assert_eq!(again.payload, "1");
        assert!(again.redelivered);
    }

    #[test]
    fn nack_without_requeue_drops() {
        let queue = QueueState::new("q", false);
        queue.enqueue(msg("1"));

        let delivery = queue.dispatch("c", 1, 1).unwrap();
        queue.nack(delivery.tag, false).unwrap();

        assert_eq!(queue.ready_count(), 0);
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[test]
    fn prefetch_limits_outstanding_deliveries_per_consumer() {
        let queue = QueueState::new("q", false);
        queue.enqueue(msg("1"));
        queue.enqueue(msg("2"));

        let first = queue.dispatch("c", 1, 1).unwrap();
        assert!(matches!(
            queue.dispatch("c", 1, 2),
            Err(BrokerError::PrefetchExceeded { .. })
        ));
        // Another consumer has its own limit.
        queue.dispatch("other", 1, 3).unwrap();

        // Acking frees the slot.
        queue.ack(first.tag).unwrap();
        assert!(queue.dispatch("c", 1, 4).is_ok());
    }

    #[test]
    fn reset_keeps_only_persistent_messages() {
        let queue = QueueState::new("q", true);
        queue.enqueue(persistent_msg("keep"));
        queue.enqueue(msg("drop"));

        let tags = queue.reset();
        assert!(tags.is_empty());
        assert_eq!(queue.ready_count(), 1);
    }

    #[test]
    fn reset_requeues_persistent_in_flight_in_dispatch_order() {
        let queue = QueueState::new("q", true);
        queue.enqueue(persistent_msg("a"));
        queue.enqueue(persistent_msg("b"));
        queue.enqueue(persistent_msg("c"));

        let a = queue.dispatch("c1", 10, 1).unwrap();
        let b = queue.dispatch("c1", 10, 2).unwrap();
        assert_eq!((a.payload.as_ref(), b.payload.as_ref()), (&b"a"[..], &b"b"[..]));

        let mut tags = queue.reset();
        tags.sort_unstable();
        assert_eq!(tags, vec![1, 2]);

        // Unsettled deliveries come back ahead of "c", oldest first.
        let first = queue.dispatch("c2", 10, 3).unwrap();
        let second = queue.dispatch("c2", 10, 4).unwrap();
        let third = queue.dispatch("c2", 10, 5).unwrap();
        assert_eq!(first.payload, "a");
        assert!(first.redelivered);
        assert_eq!(second.payload, "b");
        assert_eq!(third.payload, "c");
        assert!(!third.redelivered);
    }

    #[test]
    fn sealed_queue_rejects_dispatch_and_discards_enqueues() {
        let queue = QueueState::new("q", false);
        queue.enqueue(msg("before"));
        queue.seal();

        assert!(matches!(
            queue.dispatch("c", 10, 1),
            Err(BrokerError::NotFound { .. })
        ));
        queue.enqueue(msg("after"));
        assert_eq!(queue.ready_count(), 1);
    }

    #[test]
    fn seal_if_unused_refuses_while_deliveries_are_outstanding() {
        let queue = QueueState::new("q", false);
        queue.enqueue(msg("1"));
        let delivery = queue.dispatch("c", 10, 1).unwrap();

        assert!(matches!(
            queue.seal_if_unused(),
            Err(BrokerError::QueueInUse { in_flight: 1, .. })
        ));

        // Settling the delivery makes the seal possible, and the seal is
        // final: no further dispatch succeeds.
        queue.ack(delivery.tag).unwrap();
        queue.seal_if_unused().unwrap();
        queue.enqueue(msg("2"));
        assert!(matches!(
            queue.dispatch("c", 10, 2),
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[test]
    fn purge_returns_outstanding_tags() {
        let queue = QueueState::new("q", false);
        queue.enqueue(msg("1"));
        queue.enqueue(msg("2"));
        queue.dispatch("c", 10, 7).unwrap();

        let tags = queue.purge();
        assert_eq!(tags, vec![7]);
        assert_eq!(queue.ready_count(), 0);
    }
}
