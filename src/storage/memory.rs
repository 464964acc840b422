//! In-memory content storage

use crate::error::{StockpileError, StockpileResult};
use crate::hash::ContentHash;
use crate::storage::{ContentStorage, ContentStream, StagedWrite, StoredContent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct Blob {
    bytes: Arc<Vec<u8>>,
    stored_at: DateTime<Utc>,
}

type BlobMap = Arc<Mutex<HashMap<ContentHash, Blob>>>;

fn lock(blobs: &BlobMap) -> MutexGuard<'_, HashMap<ContentHash, Blob>> {
    blobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Blobs held in process memory
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    blobs: BlobMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes directly, bypassing staging
    pub fn insert(&self, hash: ContentHash, bytes: Vec<u8>) {
        lock(&self.blobs).insert(
            hash,
            Blob {
                bytes: Arc::new(bytes),
                stored_at: Utc::now(),
            },
        );
    }

    /// Whether the blob is present
    pub fn contains(&self, hash: &ContentHash) -> bool {
        lock(&self.blobs).contains_key(hash)
    }

    /// Number of blobs stored
    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bytes(&self, hash: &ContentHash) -> StockpileResult<Arc<Vec<u8>>> {
        lock(&self.blobs)
            .get(hash)
            .map(|b| Arc::clone(&b.bytes))
            .ok_or(StockpileError::ContentNotFound(*hash))
    }
}

#[async_trait]
impl ContentStorage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin_write(
        &self,
        hash: ContentHash,
        expected_size: u64,
    ) -> StockpileResult<Box<dyn StagedWrite>> {
        Ok(Box::new(MemoryStagedWrite {
            blobs: Arc::clone(&self.blobs),
            hash,
            buffer: Vec::with_capacity(expected_size.min(16 * 1024 * 1024) as usize),
        }))
    }

    async fn read(&self, hash: &ContentHash) -> StockpileResult<Vec<u8>> {
        Ok(self.bytes(hash)?.as_ref().clone())
    }

    async fn open(&self, hash: &ContentHash) -> StockpileResult<(u64, ContentStream)> {
        let bytes = self.bytes(hash)?;
        let size = bytes.len() as u64;
        Ok((size, Box::pin(Cursor::new(bytes.as_ref().clone()))))
    }

    async fn delete(&self, hash: &ContentHash) -> StockpileResult<bool> {
        Ok(lock(&self.blobs).remove(hash).is_some())
    }

    async fn exists(&self, hash: &ContentHash) -> StockpileResult<bool> {
        Ok(self.contains(hash))
    }

    async fn list(&self) -> StockpileResult<Vec<StoredContent>> {
        Ok(lock(&self.blobs)
            .iter()
            .map(|(hash, blob)| StoredContent {
                hash: *hash,
                size_bytes: blob.bytes.len() as u64,
                modified: blob.stored_at,
            })
            .collect())
    }
}

struct MemoryStagedWrite {
    blobs: BlobMap,
    hash: ContentHash,
    buffer: Vec<u8>,
}

#[async_trait]
impl StagedWrite for MemoryStagedWrite {
    async fn write_chunk(&mut self, chunk: &[u8]) -> StockpileResult<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn finish(self: Box<Self>) -> StockpileResult<()> {
        let this = *self;
        lock(&this.blobs).insert(
            this.hash,
            Blob {
                bytes: Arc::new(this.buffer),
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}
