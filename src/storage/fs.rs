//! File-system content storage
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/content/<first 2 hex>/<hash>.blob    published content
//! <root>/tmp/<hash>.<uuid>.partial            staged writes
//! ```
//!
//! A staged write is renamed into `content/` when finished, so readers only
//! ever see complete blobs. Leftover `.partial` files from a crash are
//! removed on startup.

use crate::error::{StockpileError, StockpileResult};
use crate::hash::ContentHash;
use crate::storage::{ContentStorage, ContentStream, StagedWrite, StoredContent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const BLOB_EXTENSION: &str = "blob";
const PARTIAL_EXTENSION: &str = "partial";

/// Blobs stored as files under a root directory
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    /// Open the store at `root`, creating directories and clearing stale
    /// staged writes
    pub async fn open(root: impl Into<PathBuf>) -> StockpileResult<Self> {
        let storage = Self { root: root.into() };

        for dir in [storage.content_dir(), storage.tmp_dir()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StockpileError::io(format!("creating {}", dir.display()), e))?;
        }

        let removed = storage.clear_partials().await?;
        if removed > 0 {
            warn!("Removed {} incomplete writes from {}", removed, storage.root.display());
        }

        Ok(storage)
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Final path of a blob
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.content_dir()
            .join(&hex[..2])
            .join(format!("{}.{}", hex, BLOB_EXTENSION))
    }

    fn partial_path(&self, hash: &ContentHash) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}.{}.{}", hash.to_hex(), Uuid::new_v4(), PARTIAL_EXTENSION))
    }

    async fn clear_partials(&self) -> StockpileResult<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(self.tmp_dir())
            .await
            .map_err(|e| StockpileError::io("reading tmp directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StockpileError::io("reading tmp entry", e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == PARTIAL_EXTENSION)
                && fs::remove_file(&path).await.is_ok()
            {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl ContentStorage for FileSystemStorage {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn begin_write(
        &self,
        hash: ContentHash,
        _expected_size: u64,
    ) -> StockpileResult<Box<dyn StagedWrite>> {
        let tmp_path = self.partial_path(&hash);
        let file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| StockpileError::io(format!("creating {}", tmp_path.display()), e))?;

        debug!("Staging {} at {}", hash.short(), tmp_path.display());
        Ok(Box::new(FileStagedWrite {
            file: Some(file),
            tmp_path,
            final_path: self.blob_path(&hash),
            written: 0,
        }))
    }

    async fn read(&self, hash: &ContentHash) -> StockpileResult<Vec<u8>> {
        let path = self.blob_path(hash);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StockpileError::ContentNotFound(*hash))
            }
            Err(e) => Err(StockpileError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn open(&self, hash: &ContentHash) -> StockpileResult<(u64, ContentStream)> {
        let path = self.blob_path(hash);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StockpileError::ContentNotFound(*hash));
            }
            Err(e) => return Err(StockpileError::io(format!("opening {}", path.display()), e)),
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| StockpileError::io(format!("reading metadata of {}", path.display()), e))?
            .len();
        Ok((size, Box::pin(file)))
    }

    async fn delete(&self, hash: &ContentHash) -> StockpileResult<bool> {
        let path = self.blob_path(hash);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StockpileError::io(format!("deleting {}", path.display()), e)),
        }
    }

    async fn exists(&self, hash: &ContentHash) -> StockpileResult<bool> {
        let path = self.blob_path(hash);
        fs::try_exists(&path)
            .await
            .map_err(|e| StockpileError::io(format!("checking {}", path.display()), e))
    }

    async fn list(&self) -> StockpileResult<Vec<StoredContent>> {
        let mut found = Vec::new();
        let mut shards = fs::read_dir(self.content_dir())
            .await
            .map_err(|e| StockpileError::io("reading content directory", e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| StockpileError::io("reading content shard", e))?
        {
            if !shard.path().is_dir() {
                continue;
            }
            let mut blobs = fs::read_dir(shard.path())
                .await
                .map_err(|e| StockpileError::io("reading content shard", e))?;

            while let Some(blob) = blobs
                .next_entry()
                .await
                .map_err(|e| StockpileError::io("reading content entry", e))?
            {
                let path = blob.path();
                if !path.extension().is_some_and(|ext| ext == BLOB_EXTENSION) {
                    continue;
                }
                let Some(hash) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<ContentHash>().ok())
                else {
                    warn!("Ignoring unrecognized file in store: {}", path.display());
                    continue;
                };
                let metadata = blob
                    .metadata()
                    .await
                    .map_err(|e| StockpileError::io(format!("reading {}", path.display()), e))?;
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                found.push(StoredContent {
                    hash,
                    size_bytes: metadata.len(),
                    modified,
                });
            }
        }

        Ok(found)
    }
}

struct FileStagedWrite {
    file: Option<fs::File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

#[async_trait]
impl StagedWrite for FileStagedWrite {
    async fn write_chunk(&mut self, chunk: &[u8]) -> StockpileResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StockpileError::Internal("staged write already closed".to_string()))?;
        file.write_all(chunk)
            .await
            .map_err(|e| StockpileError::io(format!("writing {}", self.tmp_path.display()), e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    async fn finish(self: Box<Self>) -> StockpileResult<()> {
        let mut this = self;
        if let Some(mut file) = this.file.take() {
            file.flush()
                .await
                .map_err(|e| StockpileError::io("flushing staged write", e))?;
            file.sync_all()
                .await
                .map_err(|e| StockpileError::io("syncing staged write", e))?;
        }

        if let Some(parent) = this.final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StockpileError::io(format!("creating {}", parent.display()), e))?;
        }

        fs::rename(&this.tmp_path, &this.final_path)
            .await
            .map_err(|e| {
                StockpileError::io(format!("publishing {}", this.final_path.display()), e)
            })?;

        // Renamed away; nothing left for Drop to clean up
        this.tmp_path = PathBuf::new();
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let mut this = self;
        drop(this.file.take());
        if let Err(e) = fs::remove_file(&this.tmp_path).await {
            debug!("Failed to remove {}: {}", this.tmp_path.display(), e);
        }
        this.tmp_path = PathBuf::new();
    }
}

impl Drop for FileStagedWrite {
    fn drop(&mut self) {
        if !self.tmp_path.as_os_str().is_empty() {
            drop(self.file.take());
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
