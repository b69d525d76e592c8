//! Tiered Block Store Server
//!
//! Loads the configuration, builds the storage hierarchy and block store,
//! and serves metrics until interrupted.

use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tiered_blockstore::{GreedyEvictor, MetricsEndpoint, StoreConfig, TieredBlockStore};
use tracing::{error, info};

/// # Usage
/// ```bash
/// # Start with default config (tiered_blockstore.yaml)
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Tiered Block Store");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "tiered_blockstore.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = StoreConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    info!("Configuration loaded successfully");
    info!("  - Allocator: {}", config.allocator);
    info!("  - Tiers: {}", config.tiers.len());
    info!(
        "  - Eviction attempts: {}, timeout: {} ms",
        config.retry.max_eviction_attempts, config.retry.timeout_ms
    );

    let store = Arc::new(
        TieredBlockStore::from_config(&config, Arc::new(GreedyEvictor))
            .context("failed to build block store")?,
    );

    let meta = store.store_meta();
    for tier in &meta.tiers {
        info!(
            "  {} (ordinal {}): {} dirs, {} bytes",
            tier.alias,
            tier.ordinal,
            tier.dirs.len(),
            tier.capacity_bytes
        );
    }

    if let Some(endpoint) = config.metrics_endpoint.as_ref().filter(|e| e.enabled) {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .with_context(|| format!("invalid metrics address {}", endpoint.address))?;
        let server = MetricsEndpoint::new(Arc::clone(&store), addr);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Metrics endpoint stopped: {}", e);
            }
        });
    }

    info!("Block store running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    Ok(())
}
