//! Configuration management for the tiered block store

use crate::allocator::AllocatorKind;
use crate::error::{Result, StoreError};
use crate::hierarchy::{DirSpec, TierSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a worker's block store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Allocator policy: "first_fit", "max_free" or "round_robin" (default: max_free)
    /// Read once when the store is built.
    #[serde(default = "default_allocator")]
    pub allocator: String,

    /// Storage tiers; search order follows `ordinal`, not list order
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Allocation retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// One storage tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    /// Unique tier name, e.g. "MEM", "SSD", "HDD"
    pub alias: String,

    /// Rank of the tier; 0 is the fastest
    pub ordinal: u32,

    /// Directories of this tier
    #[serde(default)]
    pub dirs: Vec<DirConfig>,
}

/// One directory within a tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirConfig {
    /// Mount point of the directory
    pub path: String,

    /// Capacity as a byte count or a size string such as "512MB"
    pub capacity: SpaceSize,
}

/// A byte count written either as an integer or as a string with a unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SpaceSize {
    Bytes(u64),
    Text(String),
}

impl SpaceSize {
    pub fn bytes(&self) -> Result<u64> {
        match self {
            SpaceSize::Bytes(bytes) => Ok(*bytes),
            SpaceSize::Text(text) => parse_space_size(text),
        }
    }
}

/// Retry/eviction loop settings for allocations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Eviction rounds attempted after the first failed allocation (default: 3)
    #[serde(default = "default_max_eviction_attempts")]
    pub max_eviction_attempts: usize,

    /// Upper bound for a whole allocation including evictions, in ms (default: 5000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Pause between eviction and the next allocation attempt, in ms (default: 0)
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_eviction_attempts: default_max_eviction_attempts(),
            timeout_ms: default_timeout_ms(),
            backoff_ms: 0,
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9091")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

// Default value functions for serde
fn default_allocator() -> String {
    "max_free".to_string()
}

fn default_max_eviction_attempts() -> usize {
    3
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_metrics_address() -> String {
    "127.0.0.1:9091".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            allocator: default_allocator(),
            tiers: Vec::new(),
            retry: RetryConfig::default(),
            metrics_endpoint: None,
        }
    }
}

/// Parse "1024", "64KB", "1.5 GB" and similar into bytes (binary units)
pub fn parse_space_size(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number.parse().map_err(|_| {
        StoreError::ConfigError(format!("invalid space size '{}'", text))
    })?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        other => {
            return Err(StoreError::ConfigError(format!(
                "unknown space size unit '{}' in '{}'",
                other, text
            )))
        }
    };

    Ok((value * multiplier as f64) as u64)
}

impl StoreConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(StoreConfig)` if loading and validation succeed
    /// * `Err(StoreError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            StoreError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content).map_err(|e| {
            StoreError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - allocator must name a known policy
    /// - at least one tier, with unique aliases and ordinals
    /// - every tier has at least one directory with non-zero capacity
    /// - retry timeout must be > 0
    /// - metrics address must parse when the endpoint is enabled
    pub fn validate(&self) -> Result<()> {
        self.allocator_kind()?;

        if self.tiers.is_empty() {
            return Err(StoreError::ConfigError(
                "at least one tier must be configured".to_string(),
            ));
        }

        let mut aliases = HashSet::new();
        let mut ordinals = HashSet::new();
        for tier in &self.tiers {
            if tier.alias.trim().is_empty() {
                return Err(StoreError::ConfigError(
                    "tier alias must not be empty".to_string(),
                ));
            }
            if !aliases.insert(tier.alias.as_str()) {
                return Err(StoreError::ConfigError(format!(
                    "duplicate tier alias '{}'",
                    tier.alias
                )));
            }
            if !ordinals.insert(tier.ordinal) {
                return Err(StoreError::ConfigError(format!(
                    "duplicate tier ordinal {}",
                    tier.ordinal
                )));
            }
            if tier.dirs.is_empty() {
                return Err(StoreError::ConfigError(format!(
                    "tier '{}' must have at least one directory",
                    tier.alias
                )));
            }
            for dir in &tier.dirs {
                if dir.capacity.bytes()? == 0 {
                    return Err(StoreError::ConfigError(format!(
                        "directory '{}' in tier '{}' must have non-zero capacity",
                        dir.path, tier.alias
                    )));
                }
            }
        }

        if self.retry.timeout_ms == 0 {
            return Err(StoreError::ConfigError(
                "retry.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(endpoint) = &self.metrics_endpoint {
            if endpoint.enabled {
                endpoint.address.parse::<SocketAddr>().map_err(|e| {
                    StoreError::ConfigError(format!(
                        "invalid metrics_endpoint address '{}': {}",
                        endpoint.address, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// The configured allocator policy
    pub fn allocator_kind(&self) -> Result<AllocatorKind> {
        self.allocator.parse()
    }

    /// Tier descriptions for building the hierarchy
    ///
    /// Assumes `validate()` passed; unparsable capacities become 0.
    pub fn tier_specs(&self) -> Vec<TierSpec> {
        self.tiers
            .iter()
            .map(|tier| TierSpec {
                alias: tier.alias.clone(),
                ordinal: tier.ordinal,
                dirs: tier
                    .dirs
                    .iter()
                    .map(|dir| DirSpec {
                        path: PathBuf::from(&dir.path),
                        capacity_bytes: dir.capacity.bytes().unwrap_or(0),
                    })
                    .collect(),
            })
            .collect()
    }
}
