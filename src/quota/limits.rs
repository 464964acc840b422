//! Soft/hard size limits and usage reporting

use crate::config::schema::QuotaConfig;
use crate::error::{StockpileError, StockpileResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Convert MB to bytes
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

/// Unvalidated thresholds, as supplied by configuration or an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationInput {
    /// Reservations never push usage above this
    pub hard_limit_bytes: u64,
    /// Purges evict down to this
    pub soft_limit_bytes: u64,
}

impl CalibrationInput {
    /// Derive thresholds from the `[quota]` config section
    pub fn from_config(config: &QuotaConfig) -> Self {
        Self::from_percent(mb_to_bytes(config.hard_limit_mb), config.soft_limit_percent)
    }

    /// Soft limit expressed as a percentage of the hard limit
    ///
    /// Percentages above 100 produce an inverted pair that validation rejects.
    pub fn from_percent(hard_limit_bytes: u64, soft_limit_percent: u8) -> Self {
        let soft = (u128::from(hard_limit_bytes) * u128::from(soft_limit_percent) / 100) as u64;
        Self {
            hard_limit_bytes,
            soft_limit_bytes: if soft_limit_percent > 100 {
                hard_limit_bytes.saturating_add(1).max(soft)
            } else {
                soft
            },
        }
    }

    /// Check the thresholds and produce limits the keeper can apply
    pub fn validate(self) -> StockpileResult<QuotaLimits> {
        if self.hard_limit_bytes == 0 {
            return Err(StockpileError::InvalidCalibration(
                "hard limit must be greater than zero".to_string(),
            ));
        }

        if self.soft_limit_bytes > self.hard_limit_bytes {
            return Err(StockpileError::InvalidCalibration(format!(
                "soft limit {} exceeds hard limit {}",
                self.soft_limit_bytes, self.hard_limit_bytes
            )));
        }

        Ok(QuotaLimits {
            hard_limit_bytes: self.hard_limit_bytes,
            soft_limit_bytes: self.soft_limit_bytes,
        })
    }
}

/// Validated thresholds in effect for the keeper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    hard_limit_bytes: u64,
    soft_limit_bytes: u64,
}

impl QuotaLimits {
    /// Validate and build limits
    pub fn new(hard_limit_bytes: u64, soft_limit_bytes: u64) -> StockpileResult<Self> {
        CalibrationInput {
            hard_limit_bytes,
            soft_limit_bytes,
        }
        .validate()
    }

    /// Limits from the `[quota]` config section
    pub fn from_config(config: &QuotaConfig) -> StockpileResult<Self> {
        CalibrationInput::from_config(config).validate()
    }

    /// Total capacity; used bytes never exceed this after a reservation
    pub fn hard_limit_bytes(&self) -> u64 {
        self.hard_limit_bytes
    }

    /// Purge target
    pub fn soft_limit_bytes(&self) -> u64 {
        self.soft_limit_bytes
    }
}

impl fmt::Display for QuotaLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "soft {} / hard {}",
            format_bytes(self.soft_limit_bytes),
            format_bytes(self.hard_limit_bytes)
        )
    }
}

/// Store size status relative to the configured limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeStatus {
    /// At or under the soft limit
    Ok,
    /// Between the soft and hard limits
    Warning,
    /// At or over the hard limit
    Exceeded,
}

impl SizeStatus {
    /// Determine status from current usage
    pub fn from_usage(used_bytes: u64, limits: &QuotaLimits) -> Self {
        if used_bytes >= limits.hard_limit_bytes() {
            Self::Exceeded
        } else if used_bytes > limits.soft_limit_bytes() {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of limit used
    pub fn percentage(used_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return 0.0;
        }
        (used_bytes as f64 / limit_bytes as f64) * 100.0
    }
}

/// Point-in-time view of the keeper's accounting
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    /// Bytes of committed content in the index
    pub content_bytes: u64,
    /// Bytes granted to outstanding reservations
    pub reserved_bytes: u64,
    /// Number of index entries
    pub entry_count: usize,
    /// Limits in effect
    pub limits: QuotaLimits,
    /// Requests drained since start
    pub requests_processed: u64,
    /// Entries evicted since start
    pub evicted_entries: u64,
    /// Bytes evicted since start
    pub evicted_bytes: u64,
}

impl QuotaUsage {
    pub(crate) fn empty(limits: QuotaLimits) -> Self {
        Self {
            content_bytes: 0,
            reserved_bytes: 0,
            entry_count: 0,
            limits,
            requests_processed: 0,
            evicted_entries: 0,
            evicted_bytes: 0,
        }
    }

    /// Committed plus reserved bytes
    pub fn used_bytes(&self) -> u64 {
        self.content_bytes + self.reserved_bytes
    }

    /// Capacity left before the hard limit
    pub fn free_bytes(&self) -> u64 {
        self.limits.hard_limit_bytes().saturating_sub(self.used_bytes())
    }

    /// Status relative to the limits
    pub fn status(&self) -> SizeStatus {
        SizeStatus::from_usage(self.used_bytes(), &self.limits)
    }
}
