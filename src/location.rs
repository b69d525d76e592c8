//! Location constraints for block placement

use std::fmt;

/// Where a block may be placed
///
/// A location narrows the set of directories an allocation may use:
/// - `AnyTier` matches every directory of every tier
/// - `AnyDirInTier` matches every directory of one tier
/// - `Specific` matches exactly one directory
///
/// Locations are plain values. They are checked against a hierarchy when used,
/// see [`StorageHierarchy::directories_matching`](crate::hierarchy::StorageHierarchy::directories_matching).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockStoreLocation {
    AnyTier,
    AnyDirInTier { tier: String },
    Specific { tier: String, dir: usize },
}

impl BlockStoreLocation {
    /// Location matching every directory in every tier
    pub fn any_tier() -> Self {
        BlockStoreLocation::AnyTier
    }

    /// Location matching every directory of `tier`
    pub fn any_dir_in_tier(tier: impl Into<String>) -> Self {
        BlockStoreLocation::AnyDirInTier { tier: tier.into() }
    }

    /// Location matching directory `dir` of `tier`
    pub fn specific(tier: impl Into<String>, dir: usize) -> Self {
        BlockStoreLocation::Specific {
            tier: tier.into(),
            dir,
        }
    }

    /// Tier alias this location is restricted to, if any
    pub fn tier_alias(&self) -> Option<&str> {
        match self {
            BlockStoreLocation::AnyTier => None,
            BlockStoreLocation::AnyDirInTier { tier } => Some(tier),
            BlockStoreLocation::Specific { tier, .. } => Some(tier),
        }
    }

    /// Directory index this location is restricted to, if any
    pub fn dir_index(&self) -> Option<usize> {
        match self {
            BlockStoreLocation::Specific { dir, .. } => Some(*dir),
            _ => None,
        }
    }

    /// Check whether directory `dir` of tier `tier_alias` satisfies this location
    pub fn matches(&self, tier_alias: &str, dir: usize) -> bool {
        match self {
            BlockStoreLocation::AnyTier => true,
            BlockStoreLocation::AnyDirInTier { tier } => tier == tier_alias,
            BlockStoreLocation::Specific { tier, dir: index } => {
                tier == tier_alias && *index == dir
            }
        }
    }

    /// Check whether every directory matched by `self` is also matched by `other`
    pub fn belongs_to(&self, other: &BlockStoreLocation) -> bool {
        match (self, other) {
            (_, BlockStoreLocation::AnyTier) => true,
            (BlockStoreLocation::AnyTier, _) => false,
            (_, BlockStoreLocation::AnyDirInTier { tier }) => {
                self.tier_alias() == Some(tier.as_str())
            }
            (BlockStoreLocation::AnyDirInTier { .. }, BlockStoreLocation::Specific { .. }) => false,
            (
                BlockStoreLocation::Specific { tier, dir },
                BlockStoreLocation::Specific {
                    tier: other_tier,
                    dir: other_dir,
                },
            ) => tier == other_tier && dir == other_dir,
        }
    }
}

impl fmt::Display for BlockStoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStoreLocation::AnyTier => write!(f, "any tier"),
            BlockStoreLocation::AnyDirInTier { tier } => write!(f, "{}:any", tier),
            BlockStoreLocation::Specific { tier, dir } => write!(f, "{}:{}", tier, dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_rules() {
        let any = BlockStoreLocation::any_tier();
        let ssd = BlockStoreLocation::any_dir_in_tier("SSD");
        let ssd1 = BlockStoreLocation::specific("SSD", 1);

        assert!(any.matches("MEM", 0));
        assert!(any.matches("SSD", 3));

        assert!(ssd.matches("SSD", 0));
        assert!(ssd.matches("SSD", 1));
        assert!(!ssd.matches("MEM", 0));

        assert!(ssd1.matches("SSD", 1));
        assert!(!ssd1.matches("SSD", 0));
        assert!(!ssd1.matches("HDD", 1));
    }

    #[test]
    fn test_belongs_to() {
        let any = BlockStoreLocation::any_tier();
        let ssd = BlockStoreLocation::any_dir_in_tier("SSD");
        let hdd = BlockStoreLocation::any_dir_in_tier("HDD");
        let ssd0 = BlockStoreLocation::specific("SSD", 0);
        let ssd1 = BlockStoreLocation::specific("SSD", 1);

        assert!(ssd0.belongs_to(&any));
        assert!(ssd0.belongs_to(&ssd));
        assert!(ssd0.belongs_to(&ssd0));
        assert!(!ssd0.belongs_to(&ssd1));
        assert!(!ssd0.belongs_to(&hdd));

        assert!(ssd.belongs_to(&any));
        assert!(ssd.belongs_to(&ssd));
        assert!(!ssd.belongs_to(&ssd0));
        assert!(!any.belongs_to(&ssd));
    }

    #[test]
    fn test_accessors_and_display() {
        let ssd1 = BlockStoreLocation::specific("SSD", 1);
        assert_eq!(ssd1.tier_alias(), Some("SSD"));
        assert_eq!(ssd1.dir_index(), Some(1));
        assert_eq!(ssd1.to_string(), "SSD:1");

        assert_eq!(BlockStoreLocation::any_tier().tier_alias(), None);
        assert_eq!(BlockStoreLocation::any_tier().to_string(), "any tier");
        assert_eq!(BlockStoreLocation::any_dir_in_tier("MEM").to_string(), "MEM:any");
    }
}
