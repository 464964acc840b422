//! Error types for Stockpile
//!
//! All modules use `StockpileResult<T>` as their return type.

use crate::hash::ContentHash;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Stockpile operations
pub type StockpileResult<T> = Result<T, StockpileError>;

/// All errors that can occur in Stockpile
#[derive(Error, Debug)]
pub enum StockpileError {
    // Quota errors
    #[error(
        "Cannot reserve {requested} bytes: {available} bytes available after eviction (hard limit {hard_limit} bytes)"
    )]
    CapacityExceeded {
        requested: u64,
        available: u64,
        hard_limit: u64,
    },

    #[error("Quota request #{request} was completed twice")]
    DoubleCompletion { request: u64 },

    #[error("Quota request #{request} was dropped without being completed")]
    RequestAbandoned { request: u64 },

    #[error("Quota keeper has stopped")]
    KeeperStopped,

    #[error("Invalid quota calibration: {0}")]
    InvalidCalibration(String),

    // Content errors
    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("Content not found: {0}")]
    ContentNotFound(ContentHash),

    #[error("Content is pinned: {0}")]
    ContentPinned(ContentHash),

    #[error("Hash mismatch: expected {expected}, received {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Size mismatch for {hash}: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        hash: ContentHash,
        expected: u64,
        actual: u64,
    },

    // Transfer errors
    #[error("Transfer of {hash} aborted: {reason}")]
    TransferAborted { hash: ContentHash, reason: String },

    #[error("Peer {machine} unavailable: {reason}")]
    PeerUnavailable { machine: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StockpileError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a transfer aborted error
    pub fn aborted(hash: ContentHash, reason: impl Into<String>) -> Self {
        Self::TransferAborted {
            hash,
            reason: reason.into(),
        }
    }

    /// Create a peer unavailable error
    pub fn peer_unavailable(machine: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PeerUnavailable {
            machine: machine.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::TransferAborted { .. }
                | Self::PeerUnavailable { .. }
                | Self::ContentPinned(_)
        )
    }

    /// Whether the error indicates a defect in request processing rather
    /// than an expected failure mode
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::DoubleCompletion { .. } | Self::RequestAbandoned { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::CapacityExceeded { .. } => {
                Some("Run: stockpile purge, or raise quota.hard_limit_mb")
            }
            Self::InvalidCalibration(_) => {
                Some("soft limit must not exceed the hard limit, and the hard limit must be > 0")
            }
            Self::InvalidHash(_) => Some("Hashes are 64 lowercase hex characters (SHA-256)"),
            Self::ContentPinned(_) => Some("Retry once the content is no longer in use"),
            Self::ConfigInvalid { .. } => Some("Run: stockpile config init --force"),
            _ => None,
        }
    }
}
