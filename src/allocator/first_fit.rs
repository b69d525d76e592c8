//! First-fit allocation: the first matching directory with room wins

use super::reserve_in;
use crate::error::Result;
use crate::hierarchy::StorageHierarchy;
use crate::location::BlockStoreLocation;
use crate::meta::{BlockId, TempBlockMeta};
use crate::view::CapacityView;

/// Walks directories in tier ordinal order, then by index
///
/// Deterministic and cheap; fills the fastest tier's early directories first.
#[derive(Debug, Default)]
pub struct FirstFit;

impl FirstFit {
    pub fn allocate(
        &self,
        hierarchy: &StorageHierarchy,
        view: &mut CapacityView,
        location: &BlockStoreLocation,
        block_id: BlockId,
        size: u64,
    ) -> Result<Option<TempBlockMeta>> {
        for dir in hierarchy.directories_matching(location)? {
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
    fn test_lower_ordinal_wins() {
        let h = hierarchy(&[("MEM", 0, &[1000]), ("SSD", 1, &[500, 500])]);
        let allocator = Allocator::new(AllocatorKind::FirstFit, h.clone());

        let mut view = CapacityView::new(&h, 1);
        let temp = allocator
            .allocate(&mut view, &BlockStoreLocation::any_tier(), 1, 600)
            .unwrap();
        assert_eq!(temp.tier_alias(), "MEM");
        assert_eq!(temp.dir(), DirId::new(0, 0));
    }

    #[test]
    fn test_fills_in_order() {
        let h = hierarchy(&[("MEM", 0, &[1000]), ("SSD", 1, &[500, 500])]);
        let allocator = Allocator::new(AllocatorKind::FirstFit, h.clone());
        let mut placed = Vec::new();

        for block_id in 0..4 {
            let mut view = CapacityView::new(&h, 1);
            let temp = allocator
                .allocate(&mut view, &BlockStoreLocation::any_tier(), block_id, 500)
                .unwrap();
            placed.push(temp.dir());
        }

        assert_eq!(
            placed,
            vec![
                DirId::new(0, 0),
                DirId::new(0, 0),
                DirId::new(1, 0),
                DirId::new(1, 1)
            ]
        );

        let mut view = CapacityView::new(&h, 1);
        assert!(allocator
            .allocate(&mut view, &BlockStoreLocation::any_tier(), 9, 1)
            .unwrap_err()
            .is_no_space());
    }
}
