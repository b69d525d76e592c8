//! Round-robin allocation: rotate through each tier's directories

use super::reserve_in;
use crate::error::Result;
use crate::hierarchy::StorageHierarchy;
use crate::location::BlockStoreLocation;
use crate::meta::{BlockId, TempBlockMeta};
use crate::view::CapacityView;
use parking_lot::Mutex;

/// Keeps one cursor per tier: the index of the directory last allocated into
///
/// A search in a tier starts right after the cursor and wraps around. The
/// tier's cursor lock is held across that tier's scan and commit, so two
/// writers targeting the same tier never pick from the same starting point.
/// Cursors live as long as the allocator and start empty.
#[derive(Debug)]
pub struct RoundRobin {
    cursors: Vec<Mutex<Option<usize>>>,
}

impl RoundRobin {
    pub fn new(tier_count: usize) -> Self {
        Self {
            cursors: (0..tier_count).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Directory index last allocated into for tier position `tier`
    pub fn cursor(&self, tier: usize) -> Option<usize> {
        self.cursors.get(tier).and_then(|cursor| *cursor.lock())
    }

    pub fn allocate(
        &self,
        hierarchy: &StorageHierarchy,
        view: &mut CapacityView,
        location: &BlockStoreLocation,
        block_id: BlockId,
        size: u64,
    ) -> Result<Option<TempBlockMeta>> {
        // Validates the location and tells us which tiers are involved
        let matched = hierarchy.directories_matching(location)?;

        for tier in hierarchy.tiers() {
            if !matched.iter().any(|dir| dir.id().tier == tier.position()) {
                continue;
            }
            let Some(cursor_lock) = self.cursors.get(tier.position()) else {
                continue;
            };

            let mut cursor = cursor_lock.lock();
            let dirs = tier.dirs();
            let start = cursor.map(|last| (last + 1) % dirs.len()).unwrap_or(0);

            for offset in 0..dirs.len() {
                let index = (start + offset) % dirs.len();
                if !location.matches(tier.alias(), index) {
                    continue;
                }
                if let Some(temp) = reserve_in(view, &dirs[index], block_id, size) {
                    *cursor = Some(index);
                    return Ok(Some(temp));
                }
            }
        }
        Ok(None)
    }
}
