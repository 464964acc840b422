//! Configuration schema for Stockpile
//!
//! Configuration is stored at `~/.config/stockpile/config.toml`

use crate::quota::policy::PolicyKind;
use crate::replication::session::ProactiveCopyMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Local store settings
    pub store: StoreConfig,

    /// Size limits and eviction
    pub quota: QuotaConfig,

    /// Proactive replication settings
    pub replication: ReplicationConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Identifier of this machine in the cluster
    pub machine_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            machine_id: "local".to_string(),
        }
    }
}

/// Local store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding content and staged writes
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("stockpile")
                .join("store"),
        }
    }
}

/// Quota configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Hard limit in MB; reservations never push usage above it
    pub hard_limit_mb: u64,

    /// Soft limit as a percentage of the hard limit; purges evict down to it
    pub soft_limit_percent: u8,

    /// Eviction ranking: "lru", "largest" or "composite"
    pub eviction_policy: PolicyKind,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            hard_limit_mb: 10 * 1024,
            soft_limit_percent: 90,
            eviction_policy: PolicyKind::default(),
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Which peer classes receive proactive copies
    pub mode: ProactiveCopyMode,

    /// Skip proactive copy once content has this many known locations
    pub locations_threshold: usize,

    /// Timeout for each proactive push
    pub push_timeout_secs: u64,

    /// Inbound pushes accepted concurrently before rejecting; 0 refuses all pushes
    pub max_concurrent_inbound_pushes: usize,

    /// Machines sharing this machine's ring partition
    pub ring: Vec<String>,

    /// Other known machines
    pub peers: Vec<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ProactiveCopyMode::default(),
            locations_threshold: 3,
            push_timeout_secs: 30,
            max_concurrent_inbound_pushes: 8,
            ring: vec![],
            peers: vec![],
        }
    }
}
