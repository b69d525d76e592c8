//! Tiered Block Store
//!
//! Space allocation for a worker that keeps fixed blocks of data on a
//! hierarchy of storage tiers (memory, SSD, HDD...). Each tier owns a set of
//! directories with a fixed byte capacity; the store decides which directory
//! hosts each new block and evicts resident blocks when room is needed.
//!
//! # Overview
//!
//! - [`StorageHierarchy`]: tiers in ordinal order, each with its directories.
//!   Every change to a directory's committed bytes happens inside that
//!   directory's commit transaction.
//! - [`Allocator`]: picks a directory for a block using one of three policies
//!   ([`AllocatorKind::FirstFit`], [`AllocatorKind::MaxFree`],
//!   [`AllocatorKind::RoundRobin`]) and reserves the bytes.
//! - [`Evictor`]: proposes resident blocks to evict when an allocation fails.
//! - [`TieredBlockStore`]: the session-facing write path (create, grow, commit,
//!   abort, move, pin, remove) with the allocate/evict/retry loop.
//! - [`MetricsEndpoint`]: Prometheus metrics and a JSON capacity report over HTTP.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tiered_blockstore::{BlockStoreLocation, GreedyEvictor, StoreConfig, TieredBlockStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig::from_file("tiered_blockstore.yaml")?;
//! let store = TieredBlockStore::from_config(&config, Arc::new(GreedyEvictor))?;
//!
//! let session = 1;
//! let mut temp = store
//!     .create_block(session, 42, &BlockStoreLocation::any_tier(), 4096)
//!     .await?;
//! store.request_space(&mut temp, 4096).await?;
//! let meta = store.commit_block(&mut temp)?;
//! println!("block {} stored in {}", meta.block_id, meta.location());
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! allocator: max_free          # first_fit | max_free | round_robin
//! tiers:
//!   - alias: MEM
//!     ordinal: 0
//!     dirs:
//!       - path: /mnt/ramdisk
//!         capacity: 1GB
//!   - alias: SSD
//!     ordinal: 1
//!     dirs:
//!       - path: /mnt/ssd0
//!         capacity: 100GB
//! retry:
//!   max_eviction_attempts: 3
//!   timeout_ms: 5000
//! metrics_endpoint:
//!   enabled: true
//!   address: "127.0.0.1:9091"
//! ```
//!
//! See [`StoreConfig`] for every option.

pub mod allocator;
pub mod config;
pub mod error;
pub mod evictor;
pub mod hierarchy;
pub mod location;
pub mod meta;
pub mod metrics;
pub mod metrics_endpoint;
pub mod store;
pub mod view;

// Re-export commonly used types
pub use allocator::{AllocationPolicy, Allocator, AllocatorKind};
pub use config::{RetryConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use evictor::{EvictionCandidate, EvictionPlan, EvictionRequest, Evictor, GreedyEvictor, NoopEvictor};
pub use hierarchy::{DirId, DirSpec, StorageDir, StorageHierarchy, StorageTier, TierSpec};
pub use location::BlockStoreLocation;
pub use meta::{BlockId, BlockMeta, Claim, SessionId, TempBlockMeta, TempBlockState};
pub use metrics::StoreMetrics;
pub use metrics_endpoint::MetricsEndpoint;
pub use store::{StoreMeta, TieredBlockStore};
pub use view::CapacityView;
