//! Per-allocation snapshot of available space
//!
//! A [`CapacityView`] copies each directory's counters once, under that
//! directory's lock, and then answers every question an allocator asks from
//! the copy. Space held for another operation's in-flight eviction is hidden.
//! A view serves exactly one allocator call; after an eviction or a commit
//! the caller takes a new one.

use crate::hierarchy::{DirId, StorageHierarchy};
use crate::meta::{Claim, SessionId};
use std::collections::HashSet;

#[derive(Debug)]
pub struct CapacityView {
    claim: Claim,
    // available[tier][dir]
    available: Vec<Vec<u64>>,
    excluded: HashSet<DirId>,
}

impl CapacityView {
    /// Snapshot `hierarchy` as seen by `session`
    pub fn new(hierarchy: &StorageHierarchy, session: SessionId) -> Self {
        Self::with_exclusions(hierarchy, session, HashSet::new())
    }

    /// Snapshot `hierarchy`, skipping the directories in `excluded` entirely
    pub fn with_exclusions(
        hierarchy: &StorageHierarchy,
        session: SessionId,
        excluded: HashSet<DirId>,
    ) -> Self {
        Self::for_claim(hierarchy, Claim::untracked(session), excluded)
    }

    /// Snapshot `hierarchy` for one store operation
    ///
    /// Holds owned by `claim` count as available; reservations made through
    /// this view belong to `claim`.
    pub fn for_claim(hierarchy: &StorageHierarchy, claim: Claim, excluded: HashSet<DirId>) -> Self {
        let available = hierarchy
            .tiers()
            .iter()
            .map(|tier| {
                tier.dirs()
                    .iter()
                    .map(|dir| dir.snapshot(claim).available_bytes())
                    .collect()
            })
            .collect();

        Self {
            claim,
            available,
            excluded,
        }
    }

    /// Session the view was taken for
    pub fn session(&self) -> SessionId {
        self.claim.session
    }

    pub fn claim(&self) -> Claim {
        self.claim
    }

    /// Bytes available in `dir` according to this view; 0 for unknown directories
    pub fn available_bytes(&self, dir: DirId) -> u64 {
        self.available
            .get(dir.tier)
            .and_then(|tier| tier.get(dir.dir))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_excluded(&self, dir: DirId) -> bool {
        self.excluded.contains(&dir)
    }

    /// Record `size` bytes as taken from `dir` in this view only
    pub fn mark_reserved(&mut self, dir: DirId, size: u64) {
        if let Some(slot) = self
            .available
            .get_mut(dir.tier)
            .and_then(|tier| tier.get_mut(dir.dir))
        {
            *slot = slot.saturating_sub(size);
        }
    }
}
