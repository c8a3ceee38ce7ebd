//! Pull-style consumers with cooperative blocking.
//!
//! A [`ConsumerHandle`] is registered against one queue with a prefetch
//! limit. [`recv`](ConsumerHandle::recv) parks on the queue's notifier until
//! a message can actually be dispatched to *this* consumer, so it wakes both
//! when a message arrives and when an ack frees one of its
//! prefetch slots. Waits are cancelable through a [`CancellationToken`] and
//! never leave partial state behind: a canceled wait simply stops competing
//! for messages, and any deliveries already handed out stay acknowledgeable
//! through their tags.

use std::{sync::Arc, time::Duration};

use futures::Stream;
use rand::{distributions::Alphanumeric, Rng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    broker::Broker,
    error::{BrokerError, Result},
    message::Delivery,
    queue::QueueState,
};

/// A registered consumer of one queue.
///
/// Created by [`Broker::consume`](crate::broker::Broker::consume). Dropping
/// the handle aborts any pending wait (the future is simply dropped); it does
/// not settle outstanding deliveries.
pub struct ConsumerHandle {
    broker: Broker,
    queue: Arc<QueueState>,
    id: String,
    prefetch: usize,
    cancel: CancellationToken,
}

impl ConsumerHandle {
    pub(crate) fn new(broker: Broker, queue: Arc<QueueState>, name: &str, prefetch: usize) -> Self {
        let id = format!("{}-{}", name, random_suffix());
        debug!(consumer = %id, queue = queue.name(), prefetch, "consumer registered");
        Self {
            broker,
            queue,
            id,
            prefetch,
            cancel: CancellationToken::new(),
        }
    }

    /// The unique id deliveries to this consumer are tracked under.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancel this consumer. Any wait currently pending in [`recv`](Self::recv)
    /// resolves to `None`, and future calls return `None` immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this consumer when triggered, for wiring into
    /// external shutdown logic.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Non-blocking dispatch attempt.
    ///
    /// Fails with [`BrokerError::Empty`] when nothing is ready,
    /// [`BrokerError::PrefetchExceeded`] when this consumer is at its
    /// unacknowledged limit, and [`BrokerError::NotFound`] once the queue
    /// has been deleted.
    pub fn try_next(&self) -> Result<Delivery> {
        self.broker.dispatch_on(&self.queue, &self.id, self.prefetch)
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the consumer is canceled or its queue is deleted.
    /// The wait is cooperative: the task parks on the queue's notifier and
    /// re-checks after every enqueue or freed prefetch slot.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            // Register for the next wakeup before checking, so a message
            // enqueued between the check and the await is not missed.
            let notified = self.queue.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                return None;
            }

            match self.try_next() {
                Ok(delivery) => return Some(delivery),
                // The queue was deleted out from under the handle; there is
                // nothing left to wait for.
                Err(BrokerError::NotFound { .. }) => return None,
                // Empty or PrefetchExceeded; both conditions clear with a
                // future notification (enqueue or ack).
                Err(_) => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Like [`recv`](Self::recv), but gives up after `timeout`, failing with
    /// [`BrokerError::Empty`].
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Delivery>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(delivery) => Ok(delivery),
            Err(_) => Err(BrokerError::Empty {
                name: self.queue.name().to_string(),
            }),
        }
    }

    /// Convert the handle into a [`Stream`] of deliveries.
    ///
    /// The stream terminates when the consumer is canceled.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> {
        futures::stream::unfold(self, |handle| async move {
            handle.recv().await.map(|delivery| (delivery, handle))
        })
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect()
}
