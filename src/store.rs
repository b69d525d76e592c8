//! Tiered block store
//!
//! [`TieredBlockStore`] is the write path a worker exposes to its clients. A
//! session creates a temp block in some location, may grow it while writing,
//! and finally commits or aborts it. Committed blocks can be pinned, moved to
//! another location and removed.
//!
//! When the allocator reports `NoSpace`, the store runs an eviction round: the
//! [`Evictor`] proposes victims, the store evicts the ones that are still
//! evictable and holds the freed bytes for the requesting operation, then the
//! allocator tries again with a fresh view. Attempts are bounded by
//! `retry.max_eviction_attempts` and the whole operation by `retry.timeout_ms`.
//!
//! Every call that reserves or evicts runs under its own [`Claim`]: temp
//! blocks, index claims and eviction holds are tied to that operation, not
//! just to its session.
//!
//! Lock order is always block index first, then a single directory.

use crate::allocator::{Allocator, AllocatorKind};
use crate::config::{RetryConfig, StoreConfig};
use crate::error::{Result, StoreError};
use crate::evictor::{EvictionCandidate, EvictionRequest, Evictor};
use crate::hierarchy::{DirId, StorageDir, StorageHierarchy};
use crate::location::BlockStoreLocation;
use crate::meta::{BlockId, BlockMeta, Claim, SessionId, TempBlockMeta, TempBlockState};
use crate::metrics::StoreMetrics;
use crate::view::CapacityView;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Temp(Claim),
    Committed,
    Moving,
}

impl EntryState {
    fn as_str(&self) -> &'static str {
        match self {
            EntryState::Temp(_) => "temp",
            EntryState::Committed => "committed",
            EntryState::Moving => "moving",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    // None while the initial allocation is still searching
    dir: Option<DirId>,
    state: EntryState,
    pins: u32,
}

impl IndexEntry {
    fn evictable_in(&self, dir: DirId) -> bool {
        self.state == EntryState::Committed && self.pins == 0 && self.dir == Some(dir)
    }
}

/// Usage of one directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirUsage {
    pub index: usize,
    pub path: String,
    pub capacity_bytes: u64,
    pub committed_bytes: u64,
    pub held_bytes: u64,
    pub blocks: usize,
    pub temp_blocks: usize,
}

/// Usage of one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub alias: String,
    pub ordinal: u32,
    pub capacity_bytes: u64,
    pub committed_bytes: u64,
    pub dirs: Vec<DirUsage>,
}

/// Capacity and usage report for the whole store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreMeta {
    pub allocator: AllocatorKind,
    pub capacity_bytes: u64,
    pub committed_bytes: u64,
    pub blocks: usize,
    pub temp_blocks: usize,
    pub tiers: Vec<TierUsage>,
}

enum Undo {
    Nothing,
    Unclaim(BlockId),
    Unmove(BlockId),
}

/// Rolls back a pending operation whose future was dropped before finishing
///
/// Always releases the operation's eviction holds.
struct PendingOp<'a> {
    store: &'a TieredBlockStore,
    op: Claim,
    undo: Undo,
}

impl<'a> PendingOp<'a> {
    fn new(store: &'a TieredBlockStore, op: Claim, undo: Undo) -> Self {
        Self { store, op, undo }
    }

    fn disarm(&mut self) {
        self.undo = Undo::Nothing;
    }
}

impl Drop for PendingOp<'_> {
    fn drop(&mut self) {
        self.store.hierarchy.release_holds(self.op);
        match self.undo {
            Undo::Nothing => {}
            Undo::Unclaim(block_id) => {
                let mut index = self.store.index.write();
                let ours = matches!(
                    index.get(&block_id),
                    Some(entry) if entry.state == EntryState::Temp(self.op) && entry.dir.is_none()
                );
                if ours {
                    index.remove(&block_id);
                }
            }
            Undo::Unmove(block_id) => {
                if let Some(entry) = self.store.index.write().get_mut(&block_id) {
                    if entry.state == EntryState::Moving {
                        entry.state = EntryState::Committed;
                    }
                }
            }
        }
    }
}

/// Block store over a tiered storage hierarchy
pub struct TieredBlockStore {
    hierarchy: Arc<StorageHierarchy>,
    allocator: Allocator,
    evictor: Arc<dyn Evictor>,
    index: RwLock<HashMap<BlockId, IndexEntry>>,
    next_ticket: AtomicU64,
    retry: RetryConfig,
    metrics: StoreMetrics,
}

impl TieredBlockStore {
    /// Create a store over an existing hierarchy
    pub fn new(
        hierarchy: Arc<StorageHierarchy>,
        kind: AllocatorKind,
        evictor: Arc<dyn Evictor>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let metrics = StoreMetrics::new()?;
        let allocator = Allocator::new(kind, Arc::clone(&hierarchy));

        info!(
            "Block store ready: allocator={}, tiers={}, dirs={}, capacity={} bytes",
            kind,
            hierarchy.tiers().len(),
            hierarchy.dir_count(),
            hierarchy.capacity_bytes()
        );

        Ok(Self {
            hierarchy,
            allocator,
            evictor,
            index: RwLock::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            retry,
            metrics,
        })
    }

    /// Validate `config` and build the hierarchy and store it describes
    pub fn from_config(config: &StoreConfig, evictor: Arc<dyn Evictor>) -> Result<Self> {
        config.validate()?;
        let hierarchy = Arc::new(StorageHierarchy::from_config(config)?);
        Self::new(
            hierarchy,
            config.allocator_kind()?,
            evictor,
            config.retry.clone(),
        )
    }

    pub fn hierarchy(&self) -> &Arc<StorageHierarchy> {
        &self.hierarchy
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    fn claim(&self, session: SessionId) -> Claim {
        Claim::new(session, self.next_ticket.fetch_add(1, Ordering::Relaxed))
    }

    /// Start writing a new block of `initial_bytes` in `location`
    ///
    /// Evicts committed blocks inside `location` when needed. Fails with
    /// `NoSpace` once eviction cannot help or the retry budget is spent.
    pub async fn create_block(
        &self,
        session: SessionId,
        block_id: BlockId,
        location: &BlockStoreLocation,
        initial_bytes: u64,
    ) -> Result<TempBlockMeta> {
        if initial_bytes == 0 {
            return Err(StoreError::InvalidRequest(
                "initial block size must be positive".to_string(),
            ));
        }
        self.hierarchy.directories_matching(location)?;

        let claim = self.claim(session);
        {
            let mut index = self.index.write();
            if index.contains_key(&block_id) {
                return Err(StoreError::BlockAlreadyExists(block_id));
            }
            index.insert(
                block_id,
                IndexEntry {
                    dir: None,
                    state: EntryState::Temp(claim),
                    pins: 0,
                },
            );
        }

        let mut pending = PendingOp::new(self, claim, Undo::Unclaim(block_id));
        let no_exclusions = HashSet::new();
        let temp = self
            .within_deadline(
                location,
                initial_bytes,
                self.allocate_with_eviction(
                    claim,
                    location,
                    block_id,
                    initial_bytes,
                    &no_exclusions,
                ),
            )
            .await?;

        let mut index = self.index.write();
        match index.get_mut(&block_id) {
            Some(entry) if entry.state == EntryState::Temp(claim) => {
                entry.dir = Some(temp.dir());
                pending.disarm();
                Ok(temp)
            }
            _ => {
                // Our claim was dropped by a session cleanup while allocating;
                // the id may already belong to someone else
                drop(index);
                if let Some(dir) = self.hierarchy.dir(temp.dir()) {
                    dir.begin_commit().abort_temp(block_id, claim);
                }
                Err(StoreError::BlockNotFound(block_id))
            }
        }
    }

    /// Grow a temp block by `additional` bytes in its current directory
    pub async fn request_space(&self, temp: &mut TempBlockMeta, additional: u64) -> Result<()> {
        ensure_reserved(temp)?;
        if additional == 0 {
            return Ok(());
        }

        let block_id = temp.block_id();
        let owner = temp.claim();
        self.check_temp(block_id, owner, temp.dir())?;
        let dir = self
            .hierarchy
            .dir(temp.dir())
            .ok_or(StoreError::BlockNotFound(block_id))?;
        let location = temp.location();

        let op = self.claim(owner.session);
        let _pending = PendingOp::new(self, op, Undo::Nothing);
        self.within_deadline(
            &location,
            additional,
            self.grow_with_eviction(dir, block_id, owner, op, &location, additional),
        )
        .await?;

        temp.grow(additional);
        Ok(())
    }

    /// Make a temp block resident
    pub fn commit_block(&self, temp: &mut TempBlockMeta) -> Result<BlockMeta> {
        ensure_reserved(temp)?;
        let block_id = temp.block_id();

        let mut index = self.index.write();
        let entry = index
            .get_mut(&block_id)
            .filter(|entry| {
                entry.state == EntryState::Temp(temp.claim()) && entry.dir == Some(temp.dir())
            })
            .ok_or(StoreError::BlockNotFound(block_id))?;
        let dir = self
            .hierarchy
            .dir(temp.dir())
            .ok_or(StoreError::BlockNotFound(block_id))?;
        let size = dir
            .begin_commit()
            .commit_temp(block_id, temp.claim())
            .ok_or(StoreError::BlockNotFound(block_id))?;

        entry.state = EntryState::Committed;
        temp.set_state(TempBlockState::Committed);
        debug!("Committed block {} ({} bytes) in {}", block_id, size, temp.location());

        Ok(BlockMeta {
            block_id,
            dir: temp.dir(),
            tier_alias: temp.tier_alias().to_string(),
            size,
        })
    }

    /// Drop a temp block and return its bytes
    pub fn abort_block(&self, temp: &mut TempBlockMeta) -> Result<()> {
        ensure_reserved(temp)?;
        let block_id = temp.block_id();

        let mut index = self.index.write();
        let owned = matches!(
            index.get(&block_id),
            Some(entry) if entry.state == EntryState::Temp(temp.claim()) && entry.dir == Some(temp.dir())
        );
        if !owned {
            return Err(StoreError::BlockNotFound(block_id));
        }
        if let Some(dir) = self.hierarchy.dir(temp.dir()) {
            dir.begin_commit().abort_temp(block_id, temp.claim());
        }
        index.remove(&block_id);
        temp.set_state(TempBlockState::Aborted);
        debug!("Aborted block {}", block_id);
        Ok(())
    }

    /// Delete a resident block
    ///
    /// Pinned blocks and blocks being moved cannot be removed.
    pub fn remove_block(&self, block_id: BlockId) -> Result<BlockMeta> {
        let mut index = self.index.write();
        let entry = *index
            .get(&block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        ensure_committed(block_id, &entry)?;
        if entry.pins > 0 {
            return Err(StoreError::InvalidBlockState {
                block_id,
                expected: "unpinned",
                actual: "pinned",
            });
        }

        let dir_id = entry.dir.ok_or(StoreError::BlockNotFound(block_id))?;
        let dir = self
            .hierarchy
            .dir(dir_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        let size = dir
            .begin_commit()
            .remove_block(block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        index.remove(&block_id);
        debug!("Removed block {} ({} bytes)", block_id, size);

        Ok(BlockMeta {
            block_id,
            dir: dir_id,
            tier_alias: dir.tier_alias().to_string(),
            size,
        })
    }

    /// Move a resident block into `location`
    ///
    /// Does nothing when the block already lives inside `location`. The source
    /// directory is never chosen as destination. The block stays readable at
    /// its source until the move completes.
    pub async fn move_block(
        &self,
        session: SessionId,
        block_id: BlockId,
        location: &BlockStoreLocation,
    ) -> Result<BlockMeta> {
        self.hierarchy.directories_matching(location)?;

        let (source, size) = {
            let mut index = self.index.write();
            let entry = index
                .get_mut(&block_id)
                .ok_or(StoreError::BlockNotFound(block_id))?;
            ensure_committed(block_id, entry)?;
            if entry.pins > 0 {
                return Err(StoreError::InvalidBlockState {
                    block_id,
                    expected: "unpinned",
                    actual: "pinned",
                });
            }

            let source = entry.dir.ok_or(StoreError::BlockNotFound(block_id))?;
            let dir = self
                .hierarchy
                .dir(source)
                .ok_or(StoreError::BlockNotFound(block_id))?;
            let size = dir
                .block_size(block_id)
                .ok_or(StoreError::BlockNotFound(block_id))?;
            let current = BlockStoreLocation::specific(dir.tier_alias(), source.dir);
            if current.belongs_to(location) {
                return Ok(BlockMeta {
                    block_id,
                    dir: source,
                    tier_alias: dir.tier_alias().to_string(),
                    size,
                });
            }

            entry.state = EntryState::Moving;
            (source, size)
        };

        let op = self.claim(session);
        let mut pending = PendingOp::new(self, op, Undo::Unmove(block_id));
        let excluded: HashSet<DirId> = [source].into_iter().collect();
        let temp = self
            .within_deadline(
                location,
                size,
                self.allocate_with_eviction(op, location, block_id, size, &excluded),
            )
            .await?;

        let dest = temp.dir();
        let dest_dir = self
            .hierarchy
            .dir(dest)
            .ok_or(StoreError::BlockNotFound(block_id))?;

        let mut index = self.index.write();
        let Some(entry) = index
            .get_mut(&block_id)
            .filter(|entry| entry.state == EntryState::Moving)
        else {
            dest_dir.begin_commit().abort_temp(block_id, op);
            return Err(StoreError::BlockNotFound(block_id));
        };
        if dest_dir.begin_commit().commit_temp(block_id, op).is_none() {
            return Err(StoreError::BlockNotFound(block_id));
        }
        if let Some(source_dir) = self.hierarchy.dir(source) {
            source_dir.begin_commit().remove_block(block_id);
        }
        entry.dir = Some(dest);
        entry.state = EntryState::Committed;
        pending.disarm();

        info!(
            "Moved block {} ({} bytes) from {} to {}",
            block_id,
            size,
            source,
            temp.location()
        );

        Ok(BlockMeta {
            block_id,
            dir: dest,
            tier_alias: temp.tier_alias().to_string(),
            size,
        })
    }

    /// Protect a resident block from eviction, removal and moves
    pub fn pin_block(&self, block_id: BlockId) -> Result<()> {
        let mut index = self.index.write();
        let entry = index
            .get_mut(&block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        ensure_committed(block_id, entry)?;
        entry.pins += 1;
        Ok(())
    }

    pub fn unpin_block(&self, block_id: BlockId) -> Result<()> {
        let mut index = self.index.write();
        let entry = index
            .get_mut(&block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        if entry.pins == 0 {
            return Err(StoreError::InvalidBlockState {
                block_id,
                expected: "pinned",
                actual: "unpinned",
            });
        }
        entry.pins -= 1;
        Ok(())
    }

    /// Evict until some directory in `location` has `bytes` available
    pub async fn free_space(
        &self,
        session: SessionId,
        location: &BlockStoreLocation,
        bytes: u64,
    ) -> Result<()> {
        let dirs: Vec<DirId> = self
            .hierarchy
            .directories_matching(location)?
            .iter()
            .map(|dir| dir.id())
            .collect();
        if bytes == 0 {
            return Ok(());
        }

        let op = self.claim(session);
        let _pending = PendingOp::new(self, op, Undo::Nothing);
        self.within_deadline(
            location,
            bytes,
            self.evict_until_available(op, location, &dirs, bytes),
        )
        .await
    }

    /// Abort every temp block owned by `session` and drop its holds
    ///
    /// Returns the number of temp blocks aborted.
    pub fn cleanup_session(&self, session: SessionId) -> usize {
        let mut index = self.index.write();
        let owned: Vec<(BlockId, Claim, Option<DirId>)> = index
            .iter()
            .filter_map(|(block_id, entry)| match entry.state {
                EntryState::Temp(claim) if claim.session == session => {
                    Some((*block_id, claim, entry.dir))
                }
                _ => None,
            })
            .collect();

        for (block_id, claim, dir) in &owned {
            if let Some(dir) = dir.and_then(|id| self.hierarchy.dir(id)) {
                dir.begin_commit().abort_temp(*block_id, *claim);
            }
            index.remove(block_id);
        }
        drop(index);

        self.hierarchy.release_session_holds(session);
        if !owned.is_empty() {
            info!(
                "Cleaned up {} temp blocks of session {}",
                owned.len(),
                session
            );
        }
        owned.len()
    }

    /// Metadata of a resident block
    pub fn get_block_meta(&self, block_id: BlockId) -> Result<BlockMeta> {
        let index = self.index.read();
        let entry = index
            .get(&block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        if matches!(entry.state, EntryState::Temp(_)) {
            return Err(StoreError::BlockNotFound(block_id));
        }

        let dir_id = entry.dir.ok_or(StoreError::BlockNotFound(block_id))?;
        let dir = self
            .hierarchy
            .dir(dir_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;
        let size = dir
            .block_size(block_id)
            .ok_or(StoreError::BlockNotFound(block_id))?;

        Ok(BlockMeta {
            block_id,
            dir: dir_id,
            tier_alias: dir.tier_alias().to_string(),
            size,
        })
    }

    /// Check whether a resident block exists
    pub fn has_block(&self, block_id: BlockId) -> bool {
        self.get_block_meta(block_id).is_ok()
    }

    pub fn is_pinned(&self, block_id: BlockId) -> bool {
        self.index
            .read()
            .get(&block_id)
            .map(|entry| entry.pins > 0)
            .unwrap_or(false)
    }

    /// Capacity and usage of every tier and directory
    pub fn store_meta(&self) -> StoreMeta {
        let tiers: Vec<TierUsage> = self
            .hierarchy
            .tiers()
            .iter()
            .map(|tier| {
                let dirs: Vec<DirUsage> = tier
                    .dirs()
                    .iter()
                    .map(|dir| DirUsage {
                        index: dir.id().dir,
                        path: dir.path().display().to_string(),
                        capacity_bytes: dir.capacity_bytes(),
                        committed_bytes: dir.committed_bytes(),
                        held_bytes: dir.held_bytes(),
                        blocks: dir.block_count(),
                        temp_blocks: dir.temp_block_count(),
                    })
                    .collect();
                TierUsage {
                    alias: tier.alias().to_string(),
                    ordinal: tier.ordinal(),
                    capacity_bytes: dirs.iter().map(|d| d.capacity_bytes).sum(),
                    committed_bytes: dirs.iter().map(|d| d.committed_bytes).sum(),
                    dirs,
                }
            })
            .collect();

        StoreMeta {
            allocator: self.allocator.kind(),
            capacity_bytes: tiers.iter().map(|t| t.capacity_bytes).sum(),
            committed_bytes: tiers.iter().map(|t| t.committed_bytes).sum(),
            blocks: tiers
                .iter()
                .flat_map(|t| t.dirs.iter())
                .map(|d| d.blocks)
                .sum(),
            temp_blocks: tiers
                .iter()
                .flat_map(|t| t.dirs.iter())
                .map(|d| d.temp_blocks)
                .sum(),
            tiers,
        }
    }

    /// Refresh the usage gauges and render all metrics
    pub fn encode_metrics(&self) -> Result<String> {
        for tier in self.hierarchy.tiers() {
            self.metrics
                .set_tier_usage(tier.alias(), tier.capacity_bytes(), tier.committed_bytes());
        }
        Ok(self.metrics.encode()?)
    }

    async fn within_deadline<T>(
        &self,
        location: &BlockStoreLocation,
        bytes: u64,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.retry.timeout(), operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Timed out after {:?} looking for {} bytes in {}",
                    self.retry.timeout(),
                    bytes,
                    location
                );
                Err(StoreError::no_space(location, bytes))
            }
        }
    }

    async fn backoff(&self) {
        let backoff = self.retry.backoff();
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
    }

    /// Allocate, evicting between attempts while the budget allows
    async fn allocate_with_eviction(
        &self,
        op: Claim,
        location: &BlockStoreLocation,
        block_id: BlockId,
        size: u64,
        excluded: &HashSet<DirId>,
    ) -> Result<TempBlockMeta> {
        let kind = self.allocator.kind();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut view = CapacityView::for_claim(&self.hierarchy, op, excluded.clone());
            let no_space = match self.allocator.allocate(&mut view, location, block_id, size) {
                Ok(temp) => {
                    self.metrics.record_allocation(kind, true, attempts);
                    return Ok(temp);
                }
                Err(err) if err.is_no_space() => err,
                Err(err) => return Err(err),
            };

            if attempts > self.retry.max_eviction_attempts
                || !self.evict(op, location, size, excluded).await?
            {
                self.metrics.record_allocation(kind, false, attempts);
                return Err(no_space);
            }
            self.backoff().await;
        }
    }

    /// Grow `owner`'s temp block in place, evicting from its directory
    /// between attempts; freed bytes are held for `op`
    async fn grow_with_eviction(
        &self,
        dir: &StorageDir,
        block_id: BlockId,
        owner: Claim,
        op: Claim,
        location: &BlockStoreLocation,
        additional: u64,
    ) -> Result<()> {
        let no_exclusions = HashSet::new();
        let mut attempts = 0;
        loop {
            attempts += 1;
            if dir.begin_commit().try_grow(block_id, owner, op, additional)? {
                return Ok(());
            }
            if attempts > self.retry.max_eviction_attempts
                || !self
                    .evict(op, location, additional, &no_exclusions)
                    .await?
            {
                debug!(
                    "Cannot grow block {} by {} bytes in {}",
                    block_id, additional, location
                );
                return Err(StoreError::no_space(location, additional));
            }
            self.backoff().await;
        }
    }

    /// Evict until one of `dirs` has `bytes` available for `op`
    async fn evict_until_available(
        &self,
        op: Claim,
        location: &BlockStoreLocation,
        dirs: &[DirId],
        bytes: u64,
    ) -> Result<()> {
        let no_exclusions = HashSet::new();
        let mut rounds = 0;
        loop {
            let view = CapacityView::for_claim(&self.hierarchy, op, HashSet::new());
            if dirs.iter().any(|dir| view.available_bytes(*dir) >= bytes) {
                return Ok(());
            }
            rounds += 1;
            if rounds > self.retry.max_eviction_attempts
                || !self.evict(op, location, bytes, &no_exclusions).await?
            {
                return Err(StoreError::no_space(location, bytes));
            }
            self.backoff().await;
        }
    }

    /// Committed, unpinned blocks inside `location`, grouped by directory
    fn eviction_candidates(
        &self,
        location: &BlockStoreLocation,
        excluded: &HashSet<DirId>,
    ) -> Result<Vec<EvictionCandidate>> {
        let dirs = self.hierarchy.directories_matching(location)?;
        let index = self.index.read();

        let mut candidates = Vec::new();
        for dir in dirs.into_iter().filter(|dir| !excluded.contains(&dir.id())) {
            let id = dir.id();
            for (block_id, size) in dir.resident_blocks() {
                if index
                    .get(&block_id)
                    .is_some_and(|entry| entry.evictable_in(id))
                {
                    candidates.push(EvictionCandidate {
                        block_id,
                        dir: id,
                        size,
                    });
                }
            }
        }
        Ok(candidates)
    }

    /// Run one eviction round for `op`
    ///
    /// Returns whether the allocation is worth retrying.
    async fn evict(
        &self,
        op: Claim,
        location: &BlockStoreLocation,
        bytes: u64,
        excluded: &HashSet<DirId>,
    ) -> Result<bool> {
        let candidates = self.eviction_candidates(location, excluded)?;
        let view = CapacityView::for_claim(&self.hierarchy, op, excluded.clone());
        let request = EvictionRequest {
            session_id: op.session,
            location: location.clone(),
            bytes,
        };

        let Some(plan) = self.evictor.plan(&request, &view, &candidates).await else {
            debug!(
                "Evictor cannot free {} bytes in {} ({} candidates)",
                bytes,
                location,
                candidates.len()
            );
            self.metrics.record_eviction(false, 0, 0);
            return Ok(false);
        };
        if plan.is_empty() {
            return Ok(true);
        }

        let mut evicted_blocks = 0u64;
        let mut evicted_bytes = 0u64;
        {
            let mut index = self.index.write();
            for candidate in &plan.to_evict {
                let evictable = index
                    .get(&candidate.block_id)
                    .is_some_and(|entry| entry.evictable_in(candidate.dir));
                if !evictable {
                    debug!("Skipping eviction of block {}", candidate.block_id);
                    continue;
                }
                let Some(dir) = self.hierarchy.dir(candidate.dir) else {
                    continue;
                };
                if let Some(size) = dir
                    .begin_commit()
                    .evict_block_for(candidate.block_id, op)
                {
                    index.remove(&candidate.block_id);
                    evicted_blocks += 1;
                    evicted_bytes += size;
                }
            }
        }

        let freed = evicted_blocks > 0;
        self.metrics
            .record_eviction(freed, evicted_blocks, evicted_bytes);
        if freed {
            info!(
                "Evicted {} blocks ({} bytes) in {} for operation {}",
                evicted_blocks, evicted_bytes, location, op
            );
        } else {
            warn!(
                "Eviction plan for {} bytes in {} freed nothing",
                bytes, location
            );
        }
        Ok(freed)
    }

    fn check_temp(&self, block_id: BlockId, owner: Claim, dir: DirId) -> Result<()> {
        let index = self.index.read();
        match index.get(&block_id) {
            Some(entry) if entry.state == EntryState::Temp(owner) && entry.dir == Some(dir) => {
                Ok(())
            }
            _ => Err(StoreError::BlockNotFound(block_id)),
        }
    }
}

impl std::fmt::Debug for TieredBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredBlockStore")
            .field("allocator", &self.allocator.kind())
            .field("evictor", &self.evictor)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn ensure_reserved(temp: &TempBlockMeta) -> Result<()> {
    if temp.state() != TempBlockState::Reserved {
        return Err(StoreError::InvalidBlockState {
            block_id: temp.block_id(),
            expected: "reserved",
            actual: temp.state().as_str(),
        });
    }
    Ok(())
}

fn ensure_committed(block_id: BlockId, entry: &IndexEntry) -> Result<()> {
    if entry.state != EntryState::Committed {
        return Err(StoreError::InvalidBlockState {
            block_id,
            expected: "committed",
            actual: entry.state.as_str(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::test_support::hierarchy;
    use crate::evictor::{GreedyEvictor, NoopEvictor};

    fn store(kind: AllocatorKind, evictor: Arc<dyn Evictor>) -> TieredBlockStore {
        let h = hierarchy(&[("MEM", 0, &[1000]), ("SSD", 1, &[500, 500])]);
        TieredBlockStore::new(h, kind, evictor, RetryConfig::default()).unwrap()
    }

    async fn write_block(
        store: &TieredBlockStore,
        session: SessionId,
        block_id: BlockId,
        location: &BlockStoreLocation,
        size: u64,
    ) -> BlockMeta {
        let mut temp = store
            .create_block(session, block_id, location, size)
            .await
            .unwrap();
        store.commit_block(&mut temp).unwrap()
    }

    #[tokio::test]
    async fn test_block_lifecycle() {
        let store = store(AllocatorKind::FirstFit, Arc::new(NoopEvictor));
        let mut temp = store
            .create_block(1, 10, &BlockStoreLocation::any_tier(), 300)
            .await
            .unwrap();
        assert_eq!(temp.state(), TempBlockState::Reserved);
        assert!(!store.has_block(10));

        store.request_space(&mut temp, 200).await.unwrap();
        assert_eq!(temp.size(), 500);

        let meta = store.commit_block(&mut temp).unwrap();
        assert_eq!(meta.size, 500);
        assert_eq!(meta.tier_alias, "MEM");
        assert_eq!(temp.state(), TempBlockState::Committed);
        assert!(store.has_block(10));
        assert_eq!(store.get_block_meta(10).unwrap(), meta);

        // Committing twice is a state error
        assert!(matches!(
            store.commit_block(&mut temp),
            Err(StoreError::InvalidBlockState { .. })
        ));

        store.remove_block(10).unwrap();
        assert!(!store.has_block(10));
        assert_eq!(store.hierarchy().committed_bytes(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_block_id() {
        let store = store(AllocatorKind::MaxFree, Arc::new(NoopEvictor));
        let location = BlockStoreLocation::any_tier();
        let _temp = store.create_block(1, 7, &location, 10).await.unwrap();

        assert_eq!(
            store.create_block(2, 7, &location, 10).await.unwrap_err(),
            StoreError::BlockAlreadyExists(7)
        );
    }

    #[tokio::test]
    async fn test_failed_create_releases_block_id() {
        let store = store(AllocatorKind::FirstFit, Arc::new(NoopEvictor));
        let mem = BlockStoreLocation::any_dir_in_tier("MEM");

        let err = store.create_block(1, 5, &mem, 2000).await.unwrap_err();
        assert!(err.is_no_space());
        assert_eq!(store.hierarchy().committed_bytes(), 0);

        // Same id can be used again
        store.create_block(1, 5, &mem, 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_returns_space() {
        let store = store(AllocatorKind::RoundRobin, Arc::new(NoopEvictor));
        let mut temp = store
            .create_block(1, 1, &BlockStoreLocation::any_dir_in_tier("SSD"), 400)
            .await
            .unwrap();
        assert_eq!(store.hierarchy().committed_bytes(), 400);

        store.abort_block(&mut temp).unwrap();
        assert_eq!(temp.state(), TempBlockState::Aborted);
        assert_eq!(store.hierarchy().committed_bytes(), 0);
        assert!(store.abort_block(&mut temp).is_err());
    }

    #[tokio::test]
    async fn test_eviction_makes_room() {
        let store = store(AllocatorKind::FirstFit, Arc::new(GreedyEvictor));
        let mem = BlockStoreLocation::any_dir_in_tier("MEM");
        write_block(&store, 1, 1, &mem, 500).await;
        write_block(&store, 1, 2, &mem, 500).await;

        let temp = store.create_block(2, 3, &mem, 600).await.unwrap();
        assert_eq!(temp.tier_alias(), "MEM");
        assert!(!store.has_block(1));
        assert!(!store.has_block(2));
        assert_eq!(store.hierarchy().committed_bytes(), 600);
        // Holds are gone once the call returns
        assert_eq!(store.store_meta().tiers[0].dirs[0].held_bytes, 0);
        assert_eq!(store.metrics().eviction_count(true), 1);
    }

    #[tokio::test]
    async fn test_pinned_blocks_are_not_evicted() {
        let store = store(AllocatorKind::FirstFit, Arc::new(GreedyEvictor));
        let mem = BlockStoreLocation::any_dir_in_tier("MEM");
        write_block(&store, 1, 1, &mem, 1000).await;
        store.pin_block(1).unwrap();

        let err = store.create_block(2, 2, &mem, 100).await.unwrap_err();
        assert!(err.is_no_space());
        assert!(store.has_block(1));
        assert!(store.remove_block(1).is_err());

        store.unpin_block(1).unwrap();
        assert!(store.unpin_block(1).is_err());
        store.create_block(2, 2, &mem, 100).await.unwrap();
        assert!(!store.has_block(1));
    }

    #[tokio::test]
    async fn test_request_space_without_room() {
        let store = store(AllocatorKind::FirstFit, Arc::new(NoopEvictor));
        let ssd0 = BlockStoreLocation::specific("SSD", 0);
        let mut temp = store.create_block(1, 1, &ssd0, 400).await.unwrap();

        let err = store.request_space(&mut temp, 101).await.unwrap_err();
        assert!(err.is_no_space());
        assert_eq!(temp.size(), 400);
        store.request_space(&mut temp, 100).await.unwrap();
        assert_eq!(store.hierarchy().committed_bytes(), 500);
    }

    #[tokio::test]
    async fn test_move_block() {
        let store = store(AllocatorKind::FirstFit, Arc::new(NoopEvictor));
        let meta = write_block(&store, 1, 1, &BlockStoreLocation::any_tier(), 300).await;
        assert_eq!(meta.tier_alias, "MEM");

        // Already inside the target: nothing to do
        let same = store
            .move_block(1, 1, &BlockStoreLocation::any_tier())
            .await
            .unwrap();
        assert_eq!(same, meta);

        let moved = store
            .move_block(1, 1, &BlockStoreLocation::any_dir_in_tier("SSD"))
            .await
            .unwrap();
        assert_eq!(moved.tier_alias, "SSD");
        assert_eq!(moved.size, 300);
        assert_eq!(store.get_block_meta(1).unwrap(), moved);
        assert_eq!(store.hierarchy().committed_bytes(), 300);
        assert_eq!(store.store_meta().tiers[0].committed_bytes, 0);
    }

    #[tokio::test]
    async fn test_cleanup_session() {
        let store = store(AllocatorKind::MaxFree, Arc::new(NoopEvictor));
        let location = BlockStoreLocation::any_tier();
        store.create_block(1, 1, &location, 100).await.unwrap();
        store.create_block(1, 2, &location, 100).await.unwrap();
        let mut other = store.create_block(2, 3, &location, 100).await.unwrap();

        assert_eq!(store.cleanup_session(1), 2);
        assert_eq!(store.hierarchy().committed_bytes(), 100);
        assert_eq!(store.cleanup_session(1), 0);
        store.commit_block(&mut other).unwrap();
    }

    #[tokio::test]
    async fn test_free_space() {
        let store = store(AllocatorKind::FirstFit, Arc::new(GreedyEvictor));
        let ssd = BlockStoreLocation::any_dir_in_tier("SSD");
        write_block(&store, 1, 1, &BlockStoreLocation::specific("SSD", 0), 500).await;
        write_block(&store, 1, 2, &BlockStoreLocation::specific("SSD", 1), 500).await;

        store.free_space(3, &ssd, 200).await.unwrap();
        assert_eq!(store.store_meta().blocks, 1);
        assert_eq!(store.hierarchy().held_bytes(), 0);

        let err = store.free_space(3, &ssd, 501).await.unwrap_err();
        assert!(err.is_no_space());
    }

    #[tokio::test]
    async fn test_unknown_location() {
        let store = store(AllocatorKind::FirstFit, Arc::new(NoopEvictor));
        assert_eq!(
            store
                .create_block(1, 1, &BlockStoreLocation::any_dir_in_tier("HDD"), 10)
                .await
                .unwrap_err(),
            StoreError::UnknownTier("HDD".to_string())
        );
        assert!(!store.has_block(1));
    }
}
