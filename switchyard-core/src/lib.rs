#![cfg_attr(docsrs, feature(doc_cfg))]

//! An in-process message-routing engine for Rust.
//!
//! Switchyard reproduces the routing contract of an AMQP-style broker without
//! a broker: exchanges of three kinds (direct, fanout, topic), queues bound
//! to them by pattern, and at-least-once delivery with acknowledgment,
//! prefetch limits, and redelivery on negative acknowledgment, all inside
//! the current process, safe for any number of concurrent publishers and
//! consumers.
//!
//! Features:
//! - **Direct, fanout, and topic exchanges** with standard `*`/`#`
//!   segment-wildcard matching, including backtracking for mid-pattern `#`.
//! - **At-least-once delivery**: every dispatch must be settled with an ack
//!   or nack; requeued messages are redelivered ahead of newer ones.
//! - **Prefetch limits** per consumer, so a slow consumer cannot hoard
//!   unacknowledged messages.
//! - **Blocking, cancelable consumption**, as an awaitable call or a
//!   [`Stream`](futures::Stream).
//! - **Restart emulation**: durable topology and persistent messages survive
//!   [`Broker::reset`](crate::broker::Broker::reset); everything else is
//!   dropped, the way a broker restart would drop it.
//!
//! # Declaring topology
//!
//! Exchanges and queues are created by idempotent declares, then tied
//! together with bindings. Redeclaring with the same attributes is a no-op;
//! redeclaring with different attributes is a conflict.
//!
//! ```
//! use switchyard::{broker::Broker, topology::ExchangeKind};
//!
//! #[tokio::main]
//! async fn main() -> switchyard::error::Result<()> {
//!     let broker = Broker::default();
//!
//!     broker.declare_exchange("trades", ExchangeKind::Topic, true).await?;
//!     broker.declare_queue("bonds", true).await?;
//!     broker.bind("bonds", "trades", "trade.bond.#").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Publishing and consuming
//!
//! A publish enters the router, which deposits an independent copy of the
//! message into every queue whose binding matches. Consumers pull from their
//! queue and settle each delivery:
//!
//! ```
//! use switchyard::{broker::Broker, message::Headers, topology::ExchangeKind};
//!
//! #[tokio::main]
//! async fn main() -> switchyard::error::Result<()> {
//!     let broker = Broker::default();
//!     broker.declare_exchange("trades", ExchangeKind::Direct, false).await?;
//!     broker.declare_queue("audit", false).await?;
//!     broker.bind("audit", "trades", "trade.executed").await?;
//!
//!     let mut headers = Headers::default();
//!     headers.insert("desk".into(), "rates".into());
//!     broker
//!         .publish("trades", "trade.executed", "payload", headers, false)
//!         .await?;
//!
//!     let consumer = broker.consume("audit", Some(1)).await?;
//!     let delivery = consumer.recv().await.expect("not canceled");
//!     broker.ack(delivery.tag).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency model
//!
//! Topology mutations serialize on one store-wide lock; message operations
//! take only their own queue's lock, and a fan-out publish touches its
//! destination queues one at a time. Consumers waiting on an empty queue (or
//! on a full prefetch window) park cooperatively and are woken by the enqueue
//! or ack that unblocks them. See [`broker`] for the full discipline.

pub mod acker;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
mod queue;
pub mod routing;
pub mod topology;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use consumer::ConsumerHandle;
pub use error::{BrokerError, Result};
pub use message::{Delivery, DeliveryTag, HeaderValue, Headers, Message};
pub use topology::ExchangeKind;

pub use async_trait::async_trait;
pub use futures;
pub use tracing;
