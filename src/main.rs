//! Process entry point for the distributed-file-store controller.

use anyhow::Result;
use clap::Parser;
use dfs_controller_core::{Config, Controller};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        cport = config.cport,
        replication_factor = config.replication_factor,
        timeout_ms = config.timeout_ms,
        rebalance_period_ms = config.rebalance_period_ms,
        "starting controller"
    );

    Controller::new(config).run().await
}
