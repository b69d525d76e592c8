//! Storage hierarchy: tiers of directories with bounded capacity
//!
//! Tiers are ranked by ordinal (0 is the fastest medium) and each owns an
//! ordered list of directories. A directory's committed bytes are the only
//! mutable accounting state; every change goes through a [`DirTxn`], a scoped
//! handle over that directory's lock. No lock spans more than one directory.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::location::BlockStoreLocation;
use crate::meta::{BlockId, Claim, SessionId};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Position of a directory inside the hierarchy
///
/// `tier` is the tier's position in ordinal order, `dir` the directory's
/// index within that tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DirId {
    pub tier: usize,
    pub dir: usize,
}

impl DirId {
    pub fn new(tier: usize, dir: usize) -> Self {
        Self { tier, dir }
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.dir)
    }
}

/// Description of a directory to create
#[derive(Debug, Clone)]
pub struct DirSpec {
    pub path: PathBuf,
    pub capacity_bytes: u64,
}

/// Description of a tier to create
#[derive(Debug, Clone)]
pub struct TierSpec {
    pub alias: String,
    pub ordinal: u32,
    pub dirs: Vec<DirSpec>,
}

#[derive(Debug)]
struct TempEntry {
    owner: Claim,
    size: u64,
}

#[derive(Debug, Default)]
struct DirState {
    committed_bytes: u64,
    blocks: BTreeMap<BlockId, u64>,
    temp_blocks: HashMap<BlockId, TempEntry>,
    // Bytes freed by eviction and set aside for the operation that asked for them
    holds: HashMap<Claim, u64>,
}

impl DirState {
    fn held_by_others(&self, holder: Claim) -> u64 {
        self.holds
            .iter()
            .filter(|(owner, _)| **owner != holder)
            .map(|(_, bytes)| *bytes)
            .sum()
    }

    fn held_total(&self) -> u64 {
        self.holds.values().sum()
    }

    fn consume_hold(&mut self, holder: Claim, bytes: u64) {
        if let Some(held) = self.holds.get_mut(&holder) {
            *held = held.saturating_sub(bytes);
            if *held == 0 {
                self.holds.remove(&holder);
            }
        }
    }

    fn owns_temp(&self, block_id: BlockId, owner: Claim) -> bool {
        self.temp_blocks
            .get(&block_id)
            .is_some_and(|entry| entry.owner == owner)
    }
}

/// Point-in-time copy of one directory's counters
///
/// `held_bytes` only counts holds owned by claims other than the one the
/// snapshot was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSnapshot {
    pub capacity_bytes: u64,
    pub committed_bytes: u64,
    pub held_bytes: u64,
}

impl DirSnapshot {
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes
            .saturating_sub(self.committed_bytes)
            .saturating_sub(self.held_bytes)
    }
}

/// A fixed-capacity allocation unit within a tier
#[derive(Debug)]
pub struct StorageDir {
    id: DirId,
    tier_alias: String,
    path: PathBuf,
    capacity_bytes: u64,
    state: Mutex<DirState>,
}

impl StorageDir {
    fn new(id: DirId, tier_alias: String, spec: DirSpec) -> Self {
        Self {
            id,
            tier_alias,
            path: spec.path,
            capacity_bytes: spec.capacity_bytes,
            state: Mutex::new(DirState::default()),
        }
    }

    pub fn id(&self) -> DirId {
        self.id
    }

    /// Alias of the owning tier
    pub fn tier_alias(&self) -> &str {
        &self.tier_alias
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn committed_bytes(&self) -> u64 {
        self.state.lock().committed_bytes
    }

    /// Bytes neither committed nor held for any session
    pub fn available_bytes(&self) -> u64 {
        let state = self.state.lock();
        self.capacity_bytes
            .saturating_sub(state.committed_bytes)
            .saturating_sub(state.held_total())
    }

    /// Bytes currently held for in-flight evictions
    pub fn held_bytes(&self) -> u64 {
        self.state.lock().held_total()
    }

    /// Copy capacity and usage as seen by `holder`
    pub fn snapshot(&self, holder: Claim) -> DirSnapshot {
        let state = self.state.lock();
        DirSnapshot {
            capacity_bytes: self.capacity_bytes,
            committed_bytes: state.committed_bytes,
            held_bytes: state.held_by_others(holder),
        }
    }

    /// Resident committed blocks in block id order
    pub fn resident_blocks(&self) -> Vec<(BlockId, u64)> {
        self.state
            .lock()
            .blocks
            .iter()
            .map(|(id, size)| (*id, *size))
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn temp_block_count(&self) -> usize {
        self.state.lock().temp_blocks.len()
    }

    pub fn has_block(&self, block_id: BlockId) -> bool {
        self.state.lock().blocks.contains_key(&block_id)
    }

    /// Size of a resident block
    pub fn block_size(&self, block_id: BlockId) -> Option<u64> {
        self.state.lock().blocks.get(&block_id).copied()
    }

    pub fn has_temp_block(&self, block_id: BlockId) -> bool {
        self.state.lock().temp_blocks.contains_key(&block_id)
    }

    /// Open the commit critical section for this directory
    ///
    /// The returned handle holds the directory lock until dropped. Keep it
    /// short and never hold it across an `.await`.
    pub fn begin_commit(&self) -> DirTxn<'_> {
        DirTxn {
            dir: self,
            state: self.state.lock(),
        }
    }
}

/// Exclusive mutation handle over one directory
pub struct DirTxn<'a> {
    dir: &'a StorageDir,
    state: MutexGuard<'a, DirState>,
}

impl<'a> DirTxn<'a> {
    pub fn dir(&self) -> &'a StorageDir {
        self.dir
    }

    /// Bytes `holder` may still reserve: holds owned by other claims are off limits
    pub fn available_for(&self, holder: Claim) -> u64 {
        self.dir
            .capacity_bytes
            .saturating_sub(self.state.committed_bytes)
            .saturating_sub(self.state.held_by_others(holder))
    }

    /// Re-validate free space and charge a new temp block to this directory
    ///
    /// Returns `false` when the space is gone, which happens when another
    /// allocator committed here after our view was taken, or when `block_id`
    /// already has a temp block in this directory.
    pub(crate) fn try_reserve(&mut self, block_id: BlockId, owner: Claim, size: u64) -> bool {
        if self.state.temp_blocks.contains_key(&block_id) || self.available_for(owner) < size {
            return false;
        }

        self.state.committed_bytes += size;
        self.state.consume_hold(owner, size);
        self.state
            .temp_blocks
            .insert(block_id, TempEntry { owner, size });
        true
    }

    /// Grow a temp block owned by `owner` in place, drawing on `holder`'s holds
    pub(crate) fn try_grow(
        &mut self,
        block_id: BlockId,
        owner: Claim,
        holder: Claim,
        additional: u64,
    ) -> Result<bool> {
        if !self.state.owns_temp(block_id, owner) {
            return Err(StoreError::BlockNotFound(block_id));
        }
        if self.available_for(holder) < additional {
            return Ok(false);
        }

        self.state.committed_bytes += additional;
        self.state.consume_hold(holder, additional);
        if let Some(entry) = self.state.temp_blocks.get_mut(&block_id) {
            entry.size += additional;
        }
        Ok(true)
    }

    /// Turn `owner`'s temp block into a resident block; committed bytes are unchanged
    pub(crate) fn commit_temp(&mut self, block_id: BlockId, owner: Claim) -> Option<u64> {
        if !self.state.owns_temp(block_id, owner) {
            return None;
        }
        let entry = self.state.temp_blocks.remove(&block_id)?;
        self.state.blocks.insert(block_id, entry.size);
        Some(entry.size)
    }

    /// Drop `owner`'s temp block and give its bytes back
    pub(crate) fn abort_temp(&mut self, block_id: BlockId, owner: Claim) -> Option<u64> {
        if !self.state.owns_temp(block_id, owner) {
            return None;
        }
        let entry = self.state.temp_blocks.remove(&block_id)?;
        self.state.committed_bytes -= entry.size;
        Some(entry.size)
    }

    /// Delete a resident block and give its bytes back
    pub(crate) fn remove_block(&mut self, block_id: BlockId) -> Option<u64> {
        let size = self.state.blocks.remove(&block_id)?;
        self.state.committed_bytes -= size;
        Some(size)
    }

    /// Delete a resident block and hold the freed bytes for `holder`
    pub(crate) fn evict_block_for(&mut self, block_id: BlockId, holder: Claim) -> Option<u64> {
        let size = self.remove_block(block_id)?;
        *self.state.holds.entry(holder).or_insert(0) += size;
        Some(size)
    }

    pub(crate) fn release_holds(&mut self, holder: Claim) {
        self.state.holds.remove(&holder);
    }

    pub(crate) fn release_session_holds(&mut self, session: SessionId) {
        self.state.holds.retain(|owner, _| owner.session != session);
    }
}

/// A ranked category of storage medium
#[derive(Debug)]
pub struct StorageTier {
    alias: String,
    ordinal: u32,
    position: usize,
    dirs: Vec<StorageDir>,
}

impl StorageTier {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Position in search order
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn dirs(&self) -> &[StorageDir] {
        &self.dirs
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.dirs.iter().map(|d| d.capacity_bytes()).sum()
    }

    pub fn committed_bytes(&self) -> u64 {
        self.dirs.iter().map(|d| d.committed_bytes()).sum()
    }
}

/// The full tier/directory hierarchy of one worker
#[derive(Debug)]
pub struct StorageHierarchy {
    tiers: Vec<StorageTier>,
}

impl StorageHierarchy {
    /// Build a hierarchy from tier descriptions
    ///
    /// Tiers are ordered by ordinal regardless of input order. Aliases and
    /// ordinals must be unique and every tier needs at least one directory.
    pub fn new(mut specs: Vec<TierSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(StoreError::ConfigError(
                "hierarchy must contain at least one tier".to_string(),
            ));
        }

        let mut aliases = HashSet::new();
        let mut ordinals = HashSet::new();
        for spec in &specs {
            if spec.alias.is_empty() {
                return Err(StoreError::ConfigError(
                    "tier alias must not be empty".to_string(),
                ));
            }
            if !aliases.insert(spec.alias.clone()) {
                return Err(StoreError::ConfigError(format!(
                    "duplicate tier alias '{}'",
                    spec.alias
                )));
            }
            if !ordinals.insert(spec.ordinal) {
                return Err(StoreError::ConfigError(format!(
                    "duplicate tier ordinal {}",
                    spec.ordinal
                )));
            }
            if spec.dirs.is_empty() {
                return Err(StoreError::ConfigError(format!(
                    "tier '{}' has no directories",
                    spec.alias
                )));
            }
        }

        specs.sort_by_key(|spec| spec.ordinal);

        let tiers = specs
            .into_iter()
            .enumerate()
            .map(|(position, spec)| {
                let dirs = spec
                    .dirs
                    .into_iter()
                    .enumerate()
                    .map(|(index, dir)| {
                        StorageDir::new(DirId::new(position, index), spec.alias.clone(), dir)
                    })
                    .collect();
                StorageTier {
                    alias: spec.alias,
                    ordinal: spec.ordinal,
                    position,
                    dirs,
                }
            })
            .collect::<Vec<_>>();

        for tier in &tiers {
            info!(
                "Tier {} (ordinal {}): {} dirs, {} bytes",
                tier.alias,
                tier.ordinal,
                tier.dirs.len(),
                tier.capacity_bytes()
            );
        }

        Ok(Self { tiers })
    }

    /// Build the hierarchy described by a validated configuration
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::new(config.tier_specs())
    }

    /// Tiers in ordinal order
    pub fn tiers(&self) -> &[StorageTier] {
        &self.tiers
    }

    pub fn tier(&self, alias: &str) -> Result<&StorageTier> {
        self.tiers
            .iter()
            .find(|tier| tier.alias == alias)
            .ok_or_else(|| StoreError::UnknownTier(alias.to_string()))
    }

    pub fn dir(&self, id: DirId) -> Option<&StorageDir> {
        self.tiers.get(id.tier)?.dirs.get(id.dir)
    }

    /// All directories in search order
    pub fn dirs(&self) -> impl Iterator<Item = &StorageDir> {
        self.tiers.iter().flat_map(|tier| tier.dirs.iter())
    }

    pub fn dir_count(&self) -> usize {
        self.tiers.iter().map(|tier| tier.dirs.len()).sum()
    }

    /// Validated `AnyDirInTier` location
    pub fn any_dir_in_tier(&self, alias: &str) -> Result<BlockStoreLocation> {
        self.tier(alias)?;
        Ok(BlockStoreLocation::any_dir_in_tier(alias))
    }

    /// Validated `Specific` location
    pub fn specific(&self, alias: &str, dir: usize) -> Result<BlockStoreLocation> {
        let tier = self.tier(alias)?;
        if dir >= tier.dirs.len() {
            return Err(StoreError::UnknownDir {
                tier: alias.to_string(),
                index: dir,
            });
        }
        Ok(BlockStoreLocation::specific(alias, dir))
    }

    /// Directories satisfying `location`, in tier-ordinal then index order
    pub fn directories_matching(&self, location: &BlockStoreLocation) -> Result<Vec<&StorageDir>> {
        match location {
            BlockStoreLocation::AnyTier => Ok(self.dirs().collect()),
            BlockStoreLocation::AnyDirInTier { tier } => {
                Ok(self.tier(tier)?.dirs.iter().collect())
            }
            BlockStoreLocation::Specific { tier, dir } => {
                let found = self.tier(tier)?;
                found
                    .dirs
                    .get(*dir)
                    .map(|d| vec![d])
                    .ok_or_else(|| StoreError::UnknownDir {
                        tier: tier.clone(),
                        index: *dir,
                    })
            }
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.tiers.iter().map(|tier| tier.capacity_bytes()).sum()
    }

    pub fn committed_bytes(&self) -> u64 {
        self.tiers.iter().map(|tier| tier.committed_bytes()).sum()
    }

    /// Bytes held for in-flight evictions across all directories
    pub fn held_bytes(&self) -> u64 {
        self.dirs().map(|dir| dir.held_bytes()).sum()
    }

    /// Drop every eviction hold owned by `holder`
    pub(crate) fn release_holds(&self, holder: Claim) {
        for dir in self.dirs() {
            dir.begin_commit().release_holds(holder);
        }
    }

    /// Drop every eviction hold owned by any operation of `session`
    pub(crate) fn release_session_holds(&self, session: SessionId) {
        for dir in self.dirs() {
            dir.begin_commit().release_session_holds(session);
        }
    }
}
