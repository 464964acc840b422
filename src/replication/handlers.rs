//! Inbound replication handlers
//!
//! The transport decodes peer requests and calls these traits. Every handler
//! returns a result value; none of them fail with an error.

use crate::context::OperationContext;
use crate::error::{StockpileError, StockpileResult};
use crate::hash::ContentHash;
use crate::replication::results::{CopyFileResult, DeleteResult, PutResult};
use crate::storage::ContentStream;
use async_trait::async_trait;
use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Where pushed bytes come from
pub enum PushSource {
    /// A file on this machine
    File(PathBuf),
    /// A stream of known length
    Stream { size: u64, stream: ContentStream },
}

impl PushSource {
    /// In-memory bytes
    pub fn bytes(data: Vec<u8>) -> Self {
        Self::Stream {
            size: data.len() as u64,
            stream: Box::pin(Cursor::new(data)),
        }
    }

    /// Resolve to a length and a reader
    pub async fn open(self) -> StockpileResult<(u64, ContentStream)> {
        match self {
            Self::Stream { size, stream } => Ok((size, stream)),
            Self::File(path) => {
                let file = tokio::fs::File::open(&path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        StockpileError::PathNotFound(path.clone())
                    } else {
                        StockpileError::io(format!("opening {}", path.display()), e)
                    }
                })?;
                let size = file
                    .metadata()
                    .await
                    .map_err(|e| StockpileError::io(format!("reading {}", path.display()), e))?
                    .len();
                Ok((size, Box::pin(file)))
            }
        }
    }
}

impl fmt::Debug for PushSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream { size, .. } => f.debug_struct("Stream").field("size", size).finish(),
        }
    }
}

/// Options for a delete request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Also forward the delete to every other known location
    pub fan_out: bool,
}

/// Pull content this machine does not have from wherever it is available
#[async_trait]
pub trait CopyRequestHandler: Send + Sync {
    /// Concurrent calls for the same hash share one transfer
    async fn handle_copy_file_request(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
    ) -> CopyFileResult;
}

/// Accept content pushed by a peer
#[async_trait]
pub trait PushFileHandler: Send + Sync {
    /// Pushers ask this before sending any bytes
    async fn has_content_locally(&self, ctx: &OperationContext, hash: ContentHash) -> bool;

    /// Reserve space, receive, verify, then commit; cancellation or any
    /// failure leaves no trace in the index
    async fn handle_push_file(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
        source: PushSource,
        cancel: CancellationToken,
    ) -> PutResult;
}

/// Remove content in response to a distributed delete
#[async_trait]
pub trait DeleteFileHandler: Send + Sync {
    /// Idempotent; absent content is a success
    async fn handle_delete(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
        options: DeleteOptions,
    ) -> DeleteResult;
}
