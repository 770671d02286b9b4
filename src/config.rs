//! Controller configuration, parsed from positional command-line arguments.

use clap::Parser;

/// Positional configuration for the controller process.
///
/// Mirrors `spec.md` §6: `cport`, `replicationFactor`, `timeout` in
/// milliseconds, and `rebalancePeriod` in milliseconds, in that order.
#[derive(Parser, Debug, Clone)]
#[command(name = "dfs-controller")]
#[command(author, version, about = "Coordinating controller for a replicated distributed file store")]
pub struct Config {
    /// TCP port the controller listens on for client and data-node connections.
    pub cport: u16,

    /// Target replication factor `R`: number of replicas held per file.
    pub replication_factor: usize,

    /// Deadline, in milliseconds, for any single fan-out/ack round (STORE,
    /// REMOVE, or rebalance dispatch).
    pub timeout_ms: u64,

    /// Period, in milliseconds, between automatic rebalance passes.
    pub rebalance_period_ms: u64,
}

impl Config {
    /// Returns the fan-out/ack deadline as a [`std::time::Duration`].
    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    /// Returns the rebalance period as a [`std::time::Duration`].
    #[must_use]
    pub fn rebalance_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rebalance_period_ms)
    }
}
