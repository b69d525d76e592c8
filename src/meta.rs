//! Block metadata: committed blocks and in-progress reservations

use crate::hierarchy::DirId;
use crate::location::BlockStoreLocation;
use serde::Serialize;
use std::fmt;

/// Block identifier, unique across the store
pub type BlockId = u64;

/// Write session identifier
pub type SessionId = u64;

/// One store operation on behalf of a session
///
/// Temp blocks and eviction holds are owned by a claim rather than by the
/// bare session: two operations of the same session, or an operation that
/// outlived a cleanup of its session, never touch each other's reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Claim {
    pub session: SessionId,
    pub ticket: u64,
}

impl Claim {
    pub fn new(session: SessionId, ticket: u64) -> Self {
        Self { session, ticket }
    }

    /// Claim for callers that drive an allocator directly (ticket 0)
    pub fn untracked(session: SessionId) -> Self {
        Self::new(session, 0)
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.ticket)
    }
}

/// Lifecycle of a temp block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempBlockState {
    /// Space is charged to the directory and owned by the writing session
    Reserved,
    /// Converted into a resident block
    Committed,
    /// Space released back to the directory
    Aborted,
}

impl TempBlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TempBlockState::Reserved => "reserved",
            TempBlockState::Committed => "committed",
            TempBlockState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TempBlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Space provisionally claimed for a block that is still being written
///
/// Returned by a successful allocation in state [`TempBlockState::Reserved`].
/// The reserved size is already counted in the directory's committed bytes,
/// so committing needs no further accounting and aborting gives it back.
///
/// Not `Clone`: only the holder of this handle may grow, commit or abort
/// the reservation.
#[derive(Debug, PartialEq, Eq)]
pub struct TempBlockMeta {
    block_id: BlockId,
    claim: Claim,
    dir: DirId,
    tier_alias: String,
    size: u64,
    state: TempBlockState,
}

impl TempBlockMeta {
    pub(crate) fn new(
        block_id: BlockId,
        claim: Claim,
        dir: DirId,
        tier_alias: String,
        size: u64,
    ) -> Self {
        Self {
            block_id,
            claim,
            dir,
            tier_alias,
            size,
            state: TempBlockState::Reserved,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn session_id(&self) -> SessionId {
        self.claim.session
    }

    /// Operation that reserved the block
    pub fn claim(&self) -> Claim {
        self.claim
    }

    /// Directory holding the reservation
    pub fn dir(&self) -> DirId {
        self.dir
    }

    pub fn tier_alias(&self) -> &str {
        &self.tier_alias
    }

    /// Reserved bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> TempBlockState {
        self.state
    }

    /// The exact directory as a location
    pub fn location(&self) -> BlockStoreLocation {
        BlockStoreLocation::specific(self.tier_alias.clone(), self.dir.dir)
    }

    pub(crate) fn grow(&mut self, additional: u64) {
        self.size += additional;
    }

    pub(crate) fn set_state(&mut self, state: TempBlockState) {
        self.state = state;
    }
}

/// A committed, resident block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub dir: DirId,
    pub tier_alias: String,
    pub size: u64,
}

impl BlockMeta {
    pub fn location(&self) -> BlockStoreLocation {
        BlockStoreLocation::specific(self.tier_alias.clone(), self.dir.dir)
    }
}
