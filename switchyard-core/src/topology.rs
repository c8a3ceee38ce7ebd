//! The authoritative mapping of exchanges, queues, and bindings.
//!
//! [`Topology`] is plain data: the broker guards it with a single store-wide
//! lock so concurrent declares of the same name cannot race into inconsistent
//! state. Message state deliberately lives *outside* this structure: each
//! declared queue holds an [`Arc`] to its tracker, so routing resolution can
//! release the topology lock before touching any queue's messages.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{BrokerError, EntityKind, Result},
    queue::QueueState,
    routing::binding_matches,
};

/// The routing discipline of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// A binding matches iff its pattern equals the routing key exactly.
    Direct,
    /// Every binding matches, regardless of routing key.
    Fanout,
    /// Dot-segment wildcard matching with `*` and `#`.
    Topic,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Fanout => write!(f, "fanout"),
            Self::Topic => write!(f, "topic"),
        }
    }
}

/// A queue-to-exchange binding.
///
/// The same queue–exchange pair may be bound under several patterns; the
/// `(exchange, queue, pattern)` triple is the unit of identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
}

/// A declared exchange and its bindings.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub bindings: Vec<Binding>,
}

/// The store of declared exchanges and queues.
#[derive(Debug, Default)]
pub(crate) struct Topology {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<QueueState>>,
}

impl Topology {
    /// Idempotent exchange declaration. Redeclaring with a different kind is
    /// a conflict; the durability flag of the first declaration wins.
    pub(crate) fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        if let Some(existing) = self.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::TopologyConflict {
                    kind: EntityKind::Exchange,
                    name: name.to_string(),
                    reason: format!(
                        "declared as {} but exists as {}",
                        kind, existing.kind
                    ),
                });
            }
            return Ok(());
        }

        debug!(exchange = name, %kind, durable, "declaring exchange");
        self.exchanges.insert(
            name.to_string(),
            Exchange {
                kind,
                durable,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    /// Idempotent queue declaration. Redeclaring with a different durability
    /// is a conflict.
    pub(crate) fn declare_queue(&mut self, name: &str, durable: bool) -> Result<Arc<QueueState>> {
        if let Some(existing) = self.queues.get(name) {
            if existing.durable() != durable {
                return Err(BrokerError::TopologyConflict {
                    kind: EntityKind::Queue,
                    name: name.to_string(),
                    reason: format!(
                        "declared with durable={} but exists with durable={}",
                        durable,
                        existing.durable()
                    ),
                });
            }
            return Ok(existing.clone());
        }

        debug!(queue = name, durable, "declaring queue");
        let queue = Arc::new(QueueState::new(name, durable));
        self.queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Bind `queue` to `exchange` under `pattern`. Idempotent for identical
    /// triples.
    pub(crate) fn bind(&mut self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(not_found(EntityKind::Queue, queue));
        }
        let exchange_entry = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| not_found(EntityKind::Exchange, exchange))?;

        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !exchange_entry.bindings.contains(&binding) {
            debug!(queue, exchange, pattern, "binding queue");
            exchange_entry.bindings.push(binding);
        }
        Ok(())
    }

    /// Remove the `(exchange, queue, pattern)` binding.
    pub(crate) fn unbind(&mut self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(not_found(EntityKind::Queue, queue));
        }
        let exchange_entry = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| not_found(EntityKind::Exchange, exchange))?;

        let before = exchange_entry.bindings.len();
        exchange_entry
            .bindings
            .retain(|b| !(b.queue == queue && b.pattern == pattern));
        if exchange_entry.bindings.len() == before {
            return Err(not_found(
                EntityKind::Binding,
                &format!("{exchange} -> {queue} ({pattern})"),
            ));
        }

        debug!(queue, exchange, pattern, "unbound queue");
        Ok(())
    }

    pub(crate) fn delete_exchange(&mut self, name: &str) -> Result<()> {
        self.exchanges
            .remove(name)
            .ok_or_else(|| not_found(EntityKind::Exchange, name))?;
        debug!(exchange = name, "deleted exchange");
        Ok(())
    }

    /// Remove `name` and every binding that points at it, returning the
    /// tracker so the broker can purge its messages. The caller is
    /// responsible for the strict/lenient in-flight policy.
    pub(crate) fn delete_queue(&mut self, name: &str) -> Result<Arc<QueueState>> {
        let queue = self
            .queues
            .remove(name)
            .ok_or_else(|| not_found(EntityKind::Queue, name))?;
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
        debug!(queue = name, "deleted queue");
        Ok(queue)
    }

    pub(crate) fn queue(&self, name: &str) -> Result<Arc<QueueState>> {
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(EntityKind::Queue, name))
    }

    /// Resolve the destination queues for a publish on `exchange` with
    /// `routing_key`. An empty result is not an error: a message that matches
    /// no binding is silently discarded.
    pub(crate) fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<QueueState>>> {
        let exchange_entry = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| not_found(EntityKind::Exchange, exchange))?;

        let mut destinations = Vec::new();
        for binding in &exchange_entry.bindings {
            if !binding_matches(exchange_entry.kind, &binding.pattern, routing_key) {
                continue;
            }
            if let Some(queue) = self.queues.get(&binding.queue) {
                // A queue may match under several patterns; deliver once.
                if !destinations
                    .iter()
                    .any(|q: &Arc<QueueState>| Arc::ptr_eq(q, queue))
                {
                    destinations.push(queue.clone());
                }
            }
        }
        Ok(destinations)
    }

    /// Apply restart semantics to the topology: non-durable exchanges and
    /// queues disappear, and bindings survive only if both endpoints do.
    /// Returns the surviving queues so the broker can reset their messages.
    pub(crate) fn reset(&mut self) -> Vec<Arc<QueueState>> {
        self.exchanges.retain(|_, exchange| exchange.durable);
        // Dropped queues are sealed so consumers still holding a handle see
        // the deletion rather than an empty queue.
        self.queues.retain(|_, queue| {
            if queue.durable() {
                true
            } else {
                queue.seal();
                false
            }
        });
        for exchange in self.exchanges.values_mut() {
            let queues = &self.queues;
            exchange.bindings.retain(|b| queues.contains_key(&b.queue));
        }
        self.queues.values().cloned().collect()
    }
}

fn not_found(kind: EntityKind, name: &str) -> BrokerError {
    BrokerError::NotFound {
        kind,
        name: name.to_string(),
    }
}
