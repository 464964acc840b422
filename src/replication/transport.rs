//! Outbound peer transport
//!
//! `PeerTransport` is the seam to whatever carries requests between
//! machines. `LoopbackTransport` connects endpoints living in the same
//! process, which is enough for single-host clusters and tests.

use crate::context::OperationContext;
use crate::error::{StockpileError, StockpileResult};
use crate::hash::ContentHash;
use crate::replication::handlers::{
    CopyRequestHandler, DeleteFileHandler, DeleteOptions, PushFileHandler, PushSource,
};
use crate::replication::peers::MachineId;
use crate::replication::results::{DeleteResult, PutResult};
use crate::storage::ContentStream;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Content served by a peer
pub struct RemoteContent {
    pub size: u64,
    pub stream: ContentStream,
}

impl fmt::Debug for RemoteContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteContent")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Requests this machine sends to peers
#[async_trait]
pub trait PeerTransport: Send + Sync + fmt::Debug {
    /// Ask whether the target already holds the content
    async fn has_content(
        &self,
        ctx: &OperationContext,
        target: &MachineId,
        hash: ContentHash,
    ) -> StockpileResult<bool>;

    /// Push content to the target
    async fn push(
        &self,
        ctx: &OperationContext,
        target: &MachineId,
        hash: ContentHash,
        size: u64,
        stream: ContentStream,
        cancel: CancellationToken,
    ) -> StockpileResult<PutResult>;

    /// Stream content from a source
    async fn fetch(
        &self,
        ctx: &OperationContext,
        source: &MachineId,
        hash: ContentHash,
    ) -> StockpileResult<RemoteContent>;

    /// Forward a delete
    async fn delete(
        &self,
        ctx: &OperationContext,
        target: &MachineId,
        hash: ContentHash,
    ) -> StockpileResult<DeleteResult>;
}

/// Everything a machine exposes to its peers
#[async_trait]
pub trait PeerEndpoint: CopyRequestHandler + PushFileHandler + DeleteFileHandler {
    /// Serve content for a peer's pull
    async fn serve_content(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
    ) -> StockpileResult<RemoteContent>;
}

/// In-process transport between registered endpoints
///
/// Endpoints are held weakly so a store that owns this transport does not
/// keep itself alive.
#[derive(Default)]
pub struct LoopbackTransport {
    endpoints: RwLock<HashMap<MachineId, Weak<dyn PeerEndpoint>>>,
    unreachable: RwLock<HashSet<MachineId>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `endpoint` reachable as `machine`
    pub fn register<E: PeerEndpoint + 'static>(&self, machine: MachineId, endpoint: &Arc<E>) {
        let weak: Weak<E> = Arc::downgrade(endpoint);
        let weak: Weak<dyn PeerEndpoint> = weak;
        debug!("Loopback endpoint registered: {}", machine);
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(machine, weak);
    }

    /// Simulate a network partition to or from `machine`
    pub fn set_reachable(&self, machine: &MachineId, reachable: bool) {
        let mut unreachable = self.unreachable.write().unwrap_or_else(PoisonError::into_inner);
        if reachable {
            unreachable.remove(machine);
        } else {
            unreachable.insert(machine.clone());
        }
    }

    fn endpoint(&self, machine: &MachineId) -> StockpileResult<Arc<dyn PeerEndpoint>> {
        if self
            .unreachable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(machine)
        {
            return Err(StockpileError::peer_unavailable(machine.as_str(), "unreachable"));
        }

        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(machine)
            .and_then(Weak::upgrade)
            .ok_or_else(|| StockpileError::peer_unavailable(machine.as_str(), "not connected"))
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        f.debug_struct("LoopbackTransport")
            .field("endpoints", &endpoints)
            .finish()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn has_content(
        &self,
        ctx: &OperationContext,
        target: &MachineId,
        hash: ContentHash,
    ) -> StockpileResult<bool> {
        let endpoint = self.endpoint(target)?;
        Ok(endpoint.has_content_locally(ctx, hash).await)
    }

    async fn push(
        &self,
        ctx: &OperationContext,
        target: &MachineId,
        hash: ContentHash,
        size: u64,
        stream: ContentStream,
        cancel: CancellationToken,
    ) -> StockpileResult<PutResult> {
        let endpoint = self.endpoint(target)?;
        Ok(endpoint
            .handle_push_file(ctx, hash, PushSource::Stream { size, stream }, cancel)
            .await)
    }

    async fn fetch(
        &self,
        ctx: &OperationContext,
        source: &MachineId,
        hash: ContentHash,
    ) -> StockpileResult<RemoteContent> {
        let endpoint = self.endpoint(source)?;
        endpoint.serve_content(ctx, hash).await
    }

    async fn delete(
        &self,
        ctx: &OperationContext,
        target: &MachineId,
        hash: ContentHash,
    ) -> StockpileResult<DeleteResult> {
        let endpoint = self.endpoint(target)?;
        Ok(endpoint
            .handle_delete(ctx, hash, DeleteOptions::default())
            .await)
    }
}
