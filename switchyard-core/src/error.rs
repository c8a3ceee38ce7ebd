//! Error taxonomy for the routing engine.
//!
//! Every variant is a local, recoverable condition reported to the caller;
//! none is fatal to the engine itself. A failed operation leaves the topology
//! and all queue state untouched: operations are all-or-nothing. Transport
//! failures (timeouts, broken connections) are the responsibility of whatever
//! layer feeds the engine; they have no representation here.

use thiserror::Error;

/// The kind of topology entity an operation referred to.
///
/// Used to qualify [`BrokerError::NotFound`] so callers can distinguish a
/// missing exchange from a missing queue or binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Exchange,
    Queue,
    Binding,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exchange => write!(f, "exchange"),
            Self::Queue => write!(f, "queue"),
            Self::Binding => write!(f, "binding"),
        }
    }
}

/// Errors surfaced by broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// An operation referenced an exchange, queue, or binding that was never
    /// declared (or has since been deleted).
    #[error("{kind} not found: {name}")]
    NotFound { kind: EntityKind, name: String },

    /// A redeclaration attempted to change attributes of an existing entity.
    ///
    /// Declarations are idempotent only for identical attributes; an exchange
    /// redeclared with a different kind, or a queue redeclared with a
    /// different durability, conflicts with the live entity.
    #[error("topology conflict on {kind} {name}: {reason}")]
    TopologyConflict {
        kind: EntityKind,
        name: String,
        reason: String,
    },

    /// Strict-mode queue deletion was blocked by unacknowledged deliveries.
    #[error("queue {name} has {in_flight} unacknowledged deliveries")]
    QueueInUse { name: String, in_flight: usize },

    /// A non-blocking dispatch found no ready message.
    #[error("queue {name} has no ready messages")]
    Empty { name: String },

    /// The consumer is already at its unacknowledged-delivery limit.
    #[error("consumer {consumer} reached its prefetch limit of {limit}")]
    PrefetchExceeded { consumer: String, limit: usize },

    /// An ack or nack referenced a delivery tag that is not outstanding.
    ///
    /// Tags become stale once acknowledged, once their message is dropped, or
    /// across an engine reset.
    #[error("delivery tag {tag} is not outstanding")]
    UnknownTag { tag: u64 },
}

pub type Result<T> = std::result::Result<T, BrokerError>;
