//! Error types for the tiered block store

use crate::location::BlockStoreLocation;
use crate::meta::BlockId;
use thiserror::Error;

/// Result type alias for block store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types that can occur in the block store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown tier alias: {0}")]
    UnknownTier(String),

    #[error("Unknown directory {index} in tier {tier}")]
    UnknownDir { tier: String, index: usize },

    #[error("Unknown allocator policy: {0}")]
    UnknownPolicy(String),

    #[error("No space for {requested} bytes in {location}")]
    NoSpace {
        location: BlockStoreLocation,
        requested: u64,
    },

    #[error("Block {0} already exists")]
    BlockAlreadyExists(BlockId),

    #[error("Block {0} not found")]
    BlockNotFound(BlockId),

    #[error("Block {block_id} is {actual}, expected {expected}")]
    InvalidBlockState {
        block_id: BlockId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError(err.to_string())
    }
}

impl From<prometheus::Error> for StoreError {
    fn from(err: prometheus::Error) -> Self {
        StoreError::MetricsError(err.to_string())
    }
}

impl StoreError {
    /// Create a `NoSpace` error for a location and request size
    pub fn no_space(location: &BlockStoreLocation, requested: u64) -> Self {
        StoreError::NoSpace {
            location: location.clone(),
            requested,
        }
    }

    /// Whether this is the routine "no directory fits right now" outcome
    pub fn is_no_space(&self) -> bool {
        matches!(self, StoreError::NoSpace { .. })
    }

    /// Determine if this error may clear up on a later attempt
    ///
    /// Only `NoSpace` is transient: capacity changes as blocks are evicted,
    /// removed or aborted. Unknown tiers, directories and policies are
    /// configuration mistakes and stay wrong no matter how often they are retried.
    pub fn should_retry(&self) -> bool {
        match self {
            StoreError::NoSpace { .. } => true,

            StoreError::ConfigError(_) => false,
            StoreError::UnknownTier(_) => false,
            StoreError::UnknownDir { .. } => false,
            StoreError::UnknownPolicy(_) => false,
            StoreError::BlockAlreadyExists(_) => false,
            StoreError::BlockNotFound(_) => false,
            StoreError::InvalidBlockState { .. } => false,
            StoreError::InvalidRequest(_) => false,
            StoreError::IoError(_) => false,
            StoreError::MetricsError(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_no_space_is_retryable() {
        let no_space = StoreError::no_space(&BlockStoreLocation::any_tier(), 10);
        assert!(no_space.is_no_space());
        assert!(no_space.should_retry());

        assert!(!StoreError::UnknownTier("NVME".to_string()).should_retry());
        assert!(!StoreError::UnknownPolicy("lifo".to_string()).should_retry());
        assert!(!StoreError::BlockNotFound(7).should_retry());
    }

    #[test]
    fn test_no_space_message() {
        let err = StoreError::no_space(&BlockStoreLocation::specific("SSD", 0), 600);
        assert_eq!(err.to_string(), "No space for 600 bytes in SSD:0");
    }
}
