//! Broker configuration.
//!
//! [`BrokerConfig`] is adorned with [`clap`] attributes so front ends can
//! populate it from command-line arguments or the environment. It is handed
//! to [`Broker::new`](crate::broker::Broker::new) once at startup and is
//! immutable thereafter.

use clap::Args;

const DEFAULT_PREFETCH: usize = 1;
const HELP_HEADING: &str = "Switchyard options";

/// Engine-wide policy knobs.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct BrokerConfig {
    /// The default number of unacknowledged deliveries a consumer may hold.
    /// Applies to bare dispatch calls and to consumers that do not specify
    /// their own prefetch.
    #[arg(long, help_heading = HELP_HEADING, env = "SWITCHYARD_PREFETCH", default_value_t = DEFAULT_PREFETCH)]
    pub default_prefetch: usize,

    /// Allow deleting a queue that still has unacknowledged deliveries,
    /// dropping them. Without this flag such deletions fail with QueueInUse.
    #[arg(long, help_heading = HELP_HEADING, env = "SWITCHYARD_LENIENT_DELETE")]
    pub lenient_queue_delete: bool,
}

impl BrokerConfig {
    /// Strict deletion is the default: a queue with in-flight deliveries
    /// cannot be deleted unless `lenient_queue_delete` is set.
    pub fn strict_queue_delete(&self) -> bool {
        !self.lenient_queue_delete
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_prefetch: DEFAULT_PREFETCH,
            lenient_queue_delete: false,
        }
    }
}
