//! Block allocators
//!
//! An allocator picks the directory that will host a new block. All policies
//! share the same contract and differ only in the order they try directories:
//!
//! - [`FirstFit`]: tier ordinal order, then directory index
//! - [`MaxFree`]: most available space first
//! - [`RoundRobin`]: per-tier rotation starting after the last directory used
//!
//! For each candidate the allocator consults the [`CapacityView`] and then
//! re-validates against the real directory inside its commit transaction.
//! Losing that race to a concurrent allocation is not an error: the search
//! simply moves on to the next candidate. Only when every matching directory
//! has been tried does the call report `NoSpace`.

pub mod first_fit;
pub mod max_free;
pub mod round_robin;

pub use first_fit::FirstFit;
pub use max_free::MaxFree;
pub use round_robin::RoundRobin;

use crate::error::{Result, StoreError};
use crate::hierarchy::{StorageDir, StorageHierarchy};
use crate::location::BlockStoreLocation;
use crate::meta::{BlockId, TempBlockMeta};
use crate::view::CapacityView;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Allocator policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    FirstFit,
    MaxFree,
    RoundRobin,
}

impl AllocatorKind {
    pub const ALL: [AllocatorKind; 3] = [
        AllocatorKind::FirstFit,
        AllocatorKind::MaxFree,
        AllocatorKind::RoundRobin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocatorKind::FirstFit => "first_fit",
            AllocatorKind::MaxFree => "max_free",
            AllocatorKind::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocatorKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first_fit" | "greedy" => Ok(AllocatorKind::FirstFit),
            "max_free" => Ok(AllocatorKind::MaxFree),
            "round_robin" => Ok(AllocatorKind::RoundRobin),
            _ => Err(StoreError::UnknownPolicy(s.to_string())),
        }
    }
}

/// Directory selection policy, one variant per allocator kind
#[derive(Debug)]
pub enum AllocationPolicy {
    FirstFit(FirstFit),
    MaxFree(MaxFree),
    RoundRobin(RoundRobin),
}

/// Allocator bound to one hierarchy
///
/// The hierarchy is only read during the search; the single mutation is the
/// per-directory commit performed by [`reserve_in`].
#[derive(Debug)]
pub struct Allocator {
    hierarchy: Arc<StorageHierarchy>,
    policy: AllocationPolicy,
}

impl Allocator {
    /// Build an allocator of the given kind
    pub fn new(kind: AllocatorKind, hierarchy: Arc<StorageHierarchy>) -> Self {
        let policy = match kind {
            AllocatorKind::FirstFit => AllocationPolicy::FirstFit(FirstFit),
            AllocatorKind::MaxFree => AllocationPolicy::MaxFree(MaxFree),
            AllocatorKind::RoundRobin => {
                AllocationPolicy::RoundRobin(RoundRobin::new(hierarchy.tiers().len()))
            }
        };
        Self { hierarchy, policy }
    }

    /// Build an allocator from a policy name such as "max_free"
    ///
    /// Fails with `UnknownPolicy` for names outside the known set.
    pub fn create(kind: &str, hierarchy: Arc<StorageHierarchy>) -> Result<Self> {
        Ok(Self::new(kind.parse()?, hierarchy))
    }

    pub fn kind(&self) -> AllocatorKind {
        match self.policy {
            AllocationPolicy::FirstFit(_) => AllocatorKind::FirstFit,
            AllocationPolicy::MaxFree(_) => AllocatorKind::MaxFree,
            AllocationPolicy::RoundRobin(_) => AllocatorKind::RoundRobin,
        }
    }

    pub fn hierarchy(&self) -> &Arc<StorageHierarchy> {
        &self.hierarchy
    }

    /// Reserve `size` bytes for `block_id` in a directory matching `location`
    ///
    /// On success the bytes are already charged to the chosen directory and
    /// the returned [`TempBlockMeta`] is `Reserved`. `NoSpace` means no matching
    /// directory could take the block right now; it is never a permanent
    /// verdict, even when the request exceeds every directory's capacity.
    /// Unknown tiers or directories in `location` are reported as such, and
    /// a zero `size` is an `InvalidRequest`.
    pub fn allocate(
        &self,
        view: &mut CapacityView,
        location: &BlockStoreLocation,
        block_id: BlockId,
        size: u64,
    ) -> Result<TempBlockMeta> {
        if size == 0 {
            return Err(StoreError::InvalidRequest(
                "allocation size must be positive".to_string(),
            ));
        }

        let hierarchy = self.hierarchy.as_ref();
        let reserved = match &self.policy {
            AllocationPolicy::FirstFit(policy) => {
                policy.allocate(hierarchy, view, location, block_id, size)?
            }
            AllocationPolicy::MaxFree(policy) => {
                policy.allocate(hierarchy, view, location, block_id, size)?
            }
            AllocationPolicy::RoundRobin(policy) => {
                policy.allocate(hierarchy, view, location, block_id, size)?
            }
        };

        match reserved {
            Some(temp) => {
                debug!(
                    "{} placed block {} ({} bytes) in {}",
                    self.kind(),
                    block_id,
                    size,
                    temp.location()
                );
                Ok(temp)
            }
            None => {
                debug!(
                    "{} found no space for block {} ({} bytes) in {}",
                    self.kind(),
                    block_id,
                    size,
                    location
                );
                Err(StoreError::no_space(location, size))
            }
        }
    }
}

/// Try to reserve `size` bytes for `block_id` in `dir`
///
/// Exclusion is checked before capacity. A directory that passes the view's
/// check is re-validated under its commit lock; if the space is gone the view
/// marks the directory as full and `None` is returned so the caller can move on.
pub(crate) fn reserve_in(
    view: &mut CapacityView,
    dir: &StorageDir,
    block_id: BlockId,
    size: u64,
) -> Option<TempBlockMeta> {
    let id = dir.id();
    if view.is_excluded(id) || view.available_bytes(id) < size {
        return None;
    }

    if !dir.begin_commit().try_reserve(block_id, view.claim(), size) {
        debug!(
            "Lost race for {}:{} while placing block {}, continuing",
            dir.tier_alias(),
            id.dir,
            block_id
        );
        let stale = view.available_bytes(id);
        view.mark_reserved(id, stale);
        return None;
    }

    view.mark_reserved(id, size);
    Some(TempBlockMeta::new(
        block_id,
        view.claim(),
        id,
        dir.tier_alias().to_string(),
        size,
    ))
}


#[cfg(test)]
mod tests {
    use super::test_support::hierarchy;
    use super::*;
    use crate::hierarchy::DirId;
    use crate::meta::Claim;
    use std::collections::HashSet;

    #[test]
    fn test_factory_kinds() {
        let h = hierarchy(&[("MEM", 0, &[100])]);
        for kind in AllocatorKind::ALL {
            let allocator = Allocator::create(kind.as_str(), h.clone()).unwrap();
            assert_eq!(allocator.kind(), kind);
        }
        assert_eq!(
            Allocator::create("greedy", h.clone()).unwrap().kind(),
            AllocatorKind::FirstFit
        );
        assert_eq!(
            Allocator::create("Round-Robin", h.clone()).unwrap().kind(),
            AllocatorKind::RoundRobin
        );
        assert_eq!(
            Allocator::create("lru", h).unwrap_err(),
            StoreError::UnknownPolicy("lru".to_string())
        );
    }

    #[test]
    fn test_allocate_unknown_tier_is_not_no_space() {
        let h = hierarchy(&[("MEM", 0, &[100])]);
        for kind in AllocatorKind::ALL {
            let allocator = Allocator::new(kind, h.clone());
            let mut view = CapacityView::new(&h, 1);
            let err = allocator
                .allocate(&mut view, &BlockStoreLocation::any_dir_in_tier("SSD"), 1, 10)
                .unwrap_err();
            assert_eq!(err, StoreError::UnknownTier("SSD".to_string()));
        }
    }

    #[test]
    fn test_excluded_dirs_are_skipped() {
        let h = hierarchy(&[("MEM", 0, &[1000]), ("SSD", 1, &[1000])]);
        let excluded: HashSet<_> = [DirId::new(0, 0)].into_iter().collect();
        for kind in AllocatorKind::ALL {
            let allocator = Allocator::new(kind, h.clone());
            let mut view = CapacityView::with_exclusions(&h, 1, excluded.clone());
            let temp = allocator
                .allocate(&mut view, &BlockStoreLocation::any_tier(), kind as u64, 10)
                .unwrap();
            assert_eq!(temp.dir(), DirId::new(1, 0));
        }
    }

    #[test]
    fn test_stale_view_continues_search() {
        // The view believes MEM has room, but another writer filled it first
        let h = hierarchy(&[("MEM", 0, &[1000]), ("SSD", 1, &[1000])]);
        for kind in AllocatorKind::ALL {
            let allocator = Allocator::new(kind, h.clone());
            let mut view = CapacityView::new(&h, 1);

            let mem = h.dir(DirId::new(0, 0)).unwrap();
            let other = Claim::untracked(2);
            assert!(mem.begin_commit().try_reserve(1000 + kind as u64, other, 1000));

            let temp = allocator
                .allocate(&mut view, &BlockStoreLocation::any_tier(), kind as u64, 600)
                .unwrap();
            assert_eq!(temp.dir(), DirId::new(1, 0));
            assert_eq!(mem.committed_bytes(), 1000);

            mem.begin_commit().abort_temp(1000 + kind as u64, other);
            h.dir(DirId::new(1, 0))
                .unwrap()
                .begin_commit()
                .abort_temp(kind as u64, temp.claim());
        }
    }

    #[test]
    fn test_request_larger_than_capacity_is_no_space() {
        let h = hierarchy(&[("MEM", 0, &[1000]), ("SSD", 1, &[500, 500])]);
        for kind in AllocatorKind::ALL {
            let allocator = Allocator::new(kind, h.clone());
            let mut view = CapacityView::new(&h, 1);
            let err = allocator
                .allocate(&mut view, &BlockStoreLocation::specific("SSD", 0), 1, 600)
                .unwrap_err();
            assert!(err.is_no_space());
            assert_eq!(h.committed_bytes(), 0);
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        let h = hierarchy(&[("MEM", 0, &[1000])]);
        for kind in AllocatorKind::ALL {
            let allocator = Allocator::new(kind, h.clone());
            let mut view = CapacityView::new(&h, 1);
            let err = allocator
                .allocate(&mut view, &BlockStoreLocation::any_tier(), 1, 0)
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidRequest(_)));
            assert_eq!(h.dir(DirId::new(0, 0)).unwrap().temp_block_count(), 0);
        }
    }
}
