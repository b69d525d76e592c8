//! Eviction collaborator interface
//!
//! When an allocation comes back with `NoSpace`, the store asks an [`Evictor`]
//! which resident blocks to give up. The evictor only proposes a plan; the
//! store carries it out, skipping blocks that were pinned, moved or removed in
//! the meantime, and then retries the allocation with a fresh view.

use crate::hierarchy::DirId;
use crate::location::BlockStoreLocation;
use crate::meta::{BlockId, SessionId};
use crate::view::CapacityView;
use async_trait::async_trait;
use std::fmt;
use tracing::debug;

/// What the allocation that failed was looking for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionRequest {
    pub session_id: SessionId,
    pub location: BlockStoreLocation,
    pub bytes: u64,
}

/// A resident, unpinned block that may be evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub block_id: BlockId,
    pub dir: DirId,
    pub size: u64,
}

/// Blocks to evict, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub to_evict: Vec<EvictionCandidate>,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.to_evict.is_empty()
    }

    /// Total bytes the plan frees if fully carried out
    pub fn bytes(&self) -> u64 {
        self.to_evict.iter().map(|c| c.size).sum()
    }
}

/// Decides which blocks to evict so that an allocation can succeed
///
/// `candidates` only contains blocks inside `request.location`, grouped by
/// directory in search order. Return `None` when no plan can free enough
/// space; the allocation then fails with `NoSpace`.
#[async_trait]
pub trait Evictor: Send + Sync + fmt::Debug {
    async fn plan(
        &self,
        request: &EvictionRequest,
        view: &CapacityView,
        candidates: &[EvictionCandidate],
    ) -> Option<EvictionPlan>;
}

/// Never evicts anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvictor;

#[async_trait]
impl Evictor for NoopEvictor {
    async fn plan(
        &self,
        _request: &EvictionRequest,
        _view: &CapacityView,
        _candidates: &[EvictionCandidate],
    ) -> Option<EvictionPlan> {
        None
    }
}

/// Frees space in the first directory that can be emptied enough
///
/// Walks directories in search order and, within a directory, evicts blocks
/// in the order given until the directory's available space covers the
/// request. Directories that cannot reach the target are left untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyEvictor;

#[async_trait]
impl Evictor for GreedyEvictor {
    async fn plan(
        &self,
        request: &EvictionRequest,
        view: &CapacityView,
        candidates: &[EvictionCandidate],
    ) -> Option<EvictionPlan> {
        let mut start = 0;
        while start < candidates.len() {
            let dir = candidates[start].dir;
            let end = candidates[start..]
                .iter()
                .position(|c| c.dir != dir)
                .map(|offset| start + offset)
                .unwrap_or(candidates.len());

            if !view.is_excluded(dir) {
                let mut available = view.available_bytes(dir);
                let mut plan = EvictionPlan::default();
                for candidate in &candidates[start..end] {
                    if available >= request.bytes {
                        break;
                    }
                    available += candidate.size;
                    plan.to_evict.push(*candidate);
                }
                if available >= request.bytes {
                    debug!(
                        "Greedy eviction in {}: {} blocks, {} bytes",
                        dir,
                        plan.to_evict.len(),
                        plan.bytes()
                    );
                    return Some(plan);
                }
            }
            start = end;
        }
        None
    }
}
