//! A trait for acknowledging deliveries in an asynchronous context.
//!
//! Consumer-side code frequently wants to settle a delivery without threading
//! a broker handle through every call site. The [`Acker`] trait abstracts the
//! act of settling, and [`DeliveryAcker`] binds one delivery tag to the broker
//! that issued it.
//!
//! # Examples
//!
//! Implementing the `Acker` trait for a custom type:
//!
//! ```
//! use switchyard::acker::Acker;
//! use switchyard::error::Result;
//! use async_trait::async_trait;
//!
//! struct MyAcker;
//!
//! #[async_trait]
//! impl Acker for MyAcker {
//!     async fn ack(&self) -> Result<()> {
//!         // Custom acknowledgement logic here...
//!         Ok(())
//!     }
//!
//!     async fn nack(&self, _requeue: bool) -> Result<()> {
//!         // Custom negative acknowledgement logic here...
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::{broker::Broker, error::Result, message::DeliveryTag};

/// Represents a generic behavior for settling deliveries.
///
/// `ack` permanently removes the delivery; `nack` rejects it, returning the
/// message to the head of its queue when `requeue` is true and dropping it
/// otherwise.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Provides an implementation of the `Acker` trait for boxed types.
#[async_trait]
impl<T: Acker + ?Sized> Acker for Box<T> {
    async fn ack(&self) -> Result<()> {
        (**self).ack().await
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        (**self).nack(requeue).await
    }
}

/// Provides an implementation of the `Acker` trait for `Arc` types.
#[async_trait]
impl<T: Acker + ?Sized> Acker for Arc<T> {
    async fn ack(&self) -> Result<()> {
        (**self).ack().await
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        (**self).nack(requeue).await
    }
}

/// An [`Acker`] bound to one outstanding delivery tag.
///
/// Created by [`Broker::acker`](crate::broker::Broker::acker). Settling twice
/// fails with `UnknownTag`, as the first settlement retires the tag.
pub struct DeliveryAcker {
    broker: Broker,
    tag: DeliveryTag,
}

impl DeliveryAcker {
    pub(crate) fn new(broker: Broker, tag: DeliveryTag) -> Self {
        Self { broker, tag }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }
}

#[async_trait]
impl Acker for DeliveryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.ack(self.tag).await
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.broker.nack(self.tag, requeue).await
    }
}
