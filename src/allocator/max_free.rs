//! Max-free allocation: the matching directory with the most room wins

use super::reserve_in;
use crate::error::Result;
use crate::hierarchy::{StorageDir, StorageHierarchy};
use crate::location::BlockStoreLocation;
use crate::meta::{BlockId, TempBlockMeta};
use crate::view::CapacityView;

/// Picks the directory with the largest available space
///
/// Ties go to the earlier directory in tier ordinal/index order. If the best
/// candidate is lost to a concurrent writer the next best is tried.
#[derive(Debug, Default)]
pub struct MaxFree;

impl MaxFree {
    pub fn allocate(
        &self,
        hierarchy: &StorageHierarchy,
        view: &mut CapacityView,
        location: &BlockStoreLocation,
        block_id: BlockId,
        size: u64,
    ) -> Result<Option<TempBlockMeta>> {
        let mut candidates: Vec<&StorageDir> = hierarchy
            .directories_matching(location)?
            .into_iter()
            .filter(|dir| !view.is_excluded(dir.id()) && view.available_bytes(dir.id()) >= size)
            .collect();

        // Stable sort keeps search order among equals
        candidates.sort_by(|a, b| {
            view.available_bytes(b.id())
                .cmp(&view.available_bytes(a.id()))
        });

        for dir in candidates {
            if let Some(temp) = reserve_in(view, dir, block_id, size) {
                return Ok(Some(temp));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use crate::allocator::test_support::hierarchy;
    use crate::allocator::{Allocator, AllocatorKind};
    use crate::hierarchy::DirId;
    use crate::location::BlockStoreLocation;
    use crate::view::CapacityView;

    #[test]
    fn test_picks_largest_available() {
        let h = hierarchy(&[("SSD", 0, &[100, 300])]);
        let allocator = Allocator::new(AllocatorKind::MaxFree, h.clone());

        let mut view = CapacityView::new(&h, 1);
        let temp = allocator
            .allocate(&mut view, &BlockStoreLocation::any_dir_in_tier("SSD"), 1, 50)
            .unwrap();
        assert_eq!(temp.dir(), DirId::new(0, 1));
    }

    #[test]
    fn test_spans_tiers_for_any_tier() {
        let h = hierarchy(&[("MEM", 0, &[200]), ("HDD", 1, &[5000])]);
        let allocator = Allocator::new(AllocatorKind::MaxFree, h.clone());

        let mut view = CapacityView::new(&h, 1);
        let temp = allocator
            .allocate(&mut view, &BlockStoreLocation::any_tier(), 1, 100)
            .unwrap();
        assert_eq!(temp.tier_alias(), "HDD");
    }

    #[test]
    fn test_ties_follow_search_order() {
        let h = hierarchy(&[("MEM", 0, &[500]), ("SSD", 1, &[500, 500])]);
        let allocator = Allocator::new(AllocatorKind::MaxFree, h.clone());

        let mut view = CapacityView::new(&h, 1);
        let first = allocator
            .allocate(&mut view, &BlockStoreLocation::any_tier(), 1, 100)
            .unwrap();
        assert_eq!(first.dir(), DirId::new(0, 0));

        // MEM now has 400 left, the SSD dirs tie at 500
        let mut view = CapacityView::new(&h, 1);
        let second = allocator
            .allocate(&mut view, &BlockStoreLocation::any_tier(), 2, 100)
            .unwrap();
        assert_eq!(second.dir(), DirId::new(1, 0));
    }
}
