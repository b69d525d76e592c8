//! Prometheus metrics for the block store

use crate::allocator::AllocatorKind;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics for allocation and eviction
#[derive(Clone)]
pub struct StoreMetrics {
    registry: Registry,

    /// Allocation calls by policy and result (success/no_space)
    pub allocations_total: Arc<IntCounterVec>,

    /// Allocator attempts needed per allocation
    pub allocation_attempts: Arc<HistogramVec>,

    /// Eviction rounds by result (freed/exhausted)
    pub eviction_rounds_total: Arc<IntCounterVec>,

    pub evicted_blocks_total: Arc<IntCounter>,

    pub evicted_bytes_total: Arc<IntCounter>,

    /// Capacity per tier
    pub tier_capacity_bytes: Arc<IntGaugeVec>,

    /// Committed bytes per tier
    pub tier_committed_bytes: Arc<IntGaugeVec>,
}

impl StoreMetrics {
    /// Create metrics in a fresh private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let allocations_total = IntCounterVec::new(
            Opts::new(
                "tiered_blockstore_allocations_total",
                "Total number of allocation requests",
            ),
            &["policy", "result"],
        )?;
        registry.register(Box::new(allocations_total.clone()))?;

        let allocation_attempts = HistogramVec::new(
            HistogramOpts::new(
                "tiered_blockstore_allocation_attempts",
                "Allocator attempts per allocation request",
            )
            .buckets(vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 16.0]),
            &["policy"],
        )?;
        registry.register(Box::new(allocation_attempts.clone()))?;

        let eviction_rounds_total = IntCounterVec::new(
            Opts::new(
                "tiered_blockstore_eviction_rounds_total",
                "Total number of eviction rounds",
            ),
            &["result"],
        )?;
        registry.register(Box::new(eviction_rounds_total.clone()))?;

        let evicted_blocks_total = IntCounter::new(
            "tiered_blockstore_evicted_blocks_total",
            "Total number of blocks evicted",
        )?;
        registry.register(Box::new(evicted_blocks_total.clone()))?;

        let evicted_bytes_total = IntCounter::new(
            "tiered_blockstore_evicted_bytes_total",
            "Total number of bytes freed by eviction",
        )?;
        registry.register(Box::new(evicted_bytes_total.clone()))?;

        let tier_capacity_bytes = IntGaugeVec::new(
            Opts::new(
                "tiered_blockstore_tier_capacity_bytes",
                "Configured capacity of each tier",
            ),
            &["tier"],
        )?;
        registry.register(Box::new(tier_capacity_bytes.clone()))?;

        let tier_committed_bytes = IntGaugeVec::new(
            Opts::new(
                "tiered_blockstore_tier_committed_bytes",
                "Bytes committed in each tier, including in-progress writes",
            ),
            &["tier"],
        )?;
        registry.register(Box::new(tier_committed_bytes.clone()))?;

        Ok(Self {
            registry,
            allocations_total: Arc::new(allocations_total),
            allocation_attempts: Arc::new(allocation_attempts),
            eviction_rounds_total: Arc::new(eviction_rounds_total),
            evicted_blocks_total: Arc::new(evicted_blocks_total),
            evicted_bytes_total: Arc::new(evicted_bytes_total),
            tier_capacity_bytes: Arc::new(tier_capacity_bytes),
            tier_committed_bytes: Arc::new(tier_committed_bytes),
        })
    }

    /// Record the outcome of one allocation request
    pub fn record_allocation(&self, policy: AllocatorKind, success: bool, attempts: usize) {
        let result = if success { "success" } else { "no_space" };
        self.allocations_total
            .with_label_values(&[policy.as_str(), result])
            .inc();
        self.allocation_attempts
            .with_label_values(&[policy.as_str()])
            .observe(attempts as f64);
    }

    /// Record one eviction round
    pub fn record_eviction(&self, freed: bool, blocks: u64, bytes: u64) {
        let result = if freed { "freed" } else { "exhausted" };
        self.eviction_rounds_total
            .with_label_values(&[result])
            .inc();
        self.evicted_blocks_total.inc_by(blocks);
        self.evicted_bytes_total.inc_by(bytes);
    }

    /// Set the usage gauges of one tier
    pub fn set_tier_usage(&self, tier: &str, capacity_bytes: u64, committed_bytes: u64) {
        self.tier_capacity_bytes
            .with_label_values(&[tier])
            .set(capacity_bytes as i64);
        self.tier_committed_bytes
            .with_label_values(&[tier])
            .set(committed_bytes as i64);
    }

    pub fn allocation_count(&self, policy: AllocatorKind, success: bool) -> u64 {
        let result = if success { "success" } else { "no_space" };
        self.allocations_total
            .with_label_values(&[policy.as_str(), result])
            .get()
    }

    pub fn eviction_count(&self, freed: bool) -> u64 {
        let result = if freed { "freed" } else { "exhausted" };
        self.eviction_rounds_total
            .with_label_values(&[result])
            .get()
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for StoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMetrics").finish_non_exhaustive()
    }
}
