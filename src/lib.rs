//! Stockpile - content-addressable build cache
//!
//! Stores build artifacts by SHA-256 hash under a soft/hard disk quota,
//! evicting cold content to make room, and replicates freshly produced
//! content to peer machines.

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod index;
pub mod quota;
pub mod replication;
pub mod storage;
pub mod ui;

pub use error::{StockpileError, StockpileResult};
