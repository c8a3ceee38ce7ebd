//! Message and delivery types.
//!
//! A [`Message`] is an opaque byte payload plus a header table, immutable once
//! published. The router copies messages rather than moving them: a fanned-out
//! publish deposits an independent copy into every destination queue, each
//! with its own delivery identity. Payloads are [`Bytes`], so those copies
//! share the underlying buffer without sharing any mutable state.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A header value attached to a published message.
///
/// Mirrors the value types a broker header table carries: strings, numbers,
/// and booleans.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// The header table of a message.
pub type Headers = HashMap<String, HeaderValue>;

/// A unique, monotonically increasing handle for one in-flight handoff of a
/// message to a consumer. Allocated at dispatch, consumed by ack/nack.
pub type DeliveryTag = u64;

/// An immutable published message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// The opaque payload.
    pub payload: Bytes,
    /// The header table.
    pub headers: Headers,
    /// Whether the message should survive an engine reset when sitting in a
    /// durable queue. Non-persistent messages are dropped on reset.
    pub persistent: bool,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, headers: Headers, persistent: bool) -> Self {
        Self {
            payload: payload.into(),
            headers,
            persistent,
        }
    }
}

/// One outstanding handoff of a message to a consumer.
///
/// Returned by dispatch and by consumer streams. The [`tag`](Self::tag) must
/// be settled with an ack or nack before the owning consumer regains the
/// prefetch slot it occupies.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// The tag identifying this handoff for ack/nack.
    pub tag: DeliveryTag,
    /// The queue the message was dispatched from.
    pub queue: String,
    /// The payload of the delivered message.
    pub payload: Bytes,
    /// The header table of the delivered message.
    pub headers: Headers,
    /// True if this message was previously delivered and requeued.
    pub redelivered: bool,
}
