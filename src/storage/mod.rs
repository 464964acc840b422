//! Content byte storage
//!
//! Provides a trait for storing blobs by hash that can be implemented by
//! different backends:
//! - `MemoryStorage`: process-local, for tests and loopback clusters
//! - `FileSystemStorage`: sharded directory tree under the store root
//!
//! Writes are staged: bytes become visible under their hash only when
//! [`StagedWrite::finish`] succeeds. Aborting, or dropping a staged write
//! without finishing it, discards everything written so far.

pub mod fs;
pub mod memory;

pub use fs::FileSystemStorage;
pub use memory::MemoryStorage;

use crate::error::StockpileResult;
use crate::hash::ContentHash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Byte stream of stored content
pub type ContentStream = Pin<Box<dyn AsyncRead + Send>>;

/// Content found in storage when scanning at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub hash: ContentHash,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Abstract content storage interface
#[async_trait]
pub trait ContentStorage: Send + Sync + fmt::Debug {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Start an all-or-nothing write of `hash`
    async fn begin_write(
        &self,
        hash: ContentHash,
        expected_size: u64,
    ) -> StockpileResult<Box<dyn StagedWrite>>;

    /// Read the whole blob into memory
    async fn read(&self, hash: &ContentHash) -> StockpileResult<Vec<u8>>;

    /// Open the blob for streaming; returns its size and a reader
    async fn open(&self, hash: &ContentHash) -> StockpileResult<(u64, ContentStream)>;

    /// Delete the blob; `false` when it was not present
    async fn delete(&self, hash: &ContentHash) -> StockpileResult<bool>;

    /// Whether the blob is present
    async fn exists(&self, hash: &ContentHash) -> StockpileResult<bool>;

    /// Every blob currently stored
    async fn list(&self) -> StockpileResult<Vec<StoredContent>>;
}

/// Write in progress; invisible until finished
#[async_trait]
pub trait StagedWrite: Send {
    /// Append bytes
    async fn write_chunk(&mut self, chunk: &[u8]) -> StockpileResult<()>;

    /// Bytes appended so far
    fn bytes_written(&self) -> u64;

    /// Publish the content under its hash
    async fn finish(self: Box<Self>) -> StockpileResult<()>;

    /// Discard everything written
    async fn abort(self: Box<Self>);
}
