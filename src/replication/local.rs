//! Local content store
//!
//! Ties the quota keeper, byte storage, peer locator and transport together
//! and serves the replication handlers for this machine.
//!
//! Ingest path (local put, inbound push, pull):
//!
//! 1. Reserve `size` bytes through the keeper
//! 2. Stream into a staged write, hashing as bytes arrive
//! 3. Verify size and hash, then publish the staged write
//! 4. Commit the reservation into the index
//!
//! Any failure before step 4 aborts the staged write and drops the
//! reservation, so the index never holds partial content.

use crate::config::{Config, ReplicationConfig};
use crate::context::OperationContext;
use crate::error::{StockpileError, StockpileResult};
use crate::hash::{ContentHash, ContentHasher};
use crate::index::{ContentEntry, ContentIndex};
use crate::quota::{CommitOutcome, PinGuard, QuotaKeeper, QuotaLimits, RemoveOutcome};
use crate::replication::handlers::{
    CopyRequestHandler, DeleteFileHandler, DeleteOptions, PushFileHandler, PushSource,
};
use crate::replication::peers::{LocationRegistry, MachineId, PeerLocator, StaticRing};
use crate::replication::results::{
    CopyFileResult, DeleteResult, DeleteStatus, ProactiveCopyResult, PushRejection, PutResult,
};
use crate::replication::session::{ProactiveCopySession, ProactiveCopySettings};
use crate::replication::transport::{LoopbackTransport, PeerEndpoint, PeerTransport, RemoteContent};
use crate::storage::{ContentStorage, ContentStream, FileSystemStorage, StagedWrite};
use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

type SharedPull = Shared<BoxFuture<'static, CopyFileResult>>;
type PullMap = Arc<Mutex<HashMap<ContentHash, SharedPull>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replication tunables for a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationSettings {
    pub proactive: ProactiveCopySettings,
    /// Inbound pushes accepted at once; further pushes are rejected and 0
    /// refuses pushes entirely
    pub max_concurrent_inbound_pushes: usize,
}

impl ReplicationSettings {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            proactive: ProactiveCopySettings::from_config(config),
            max_concurrent_inbound_pushes: config.max_concurrent_inbound_pushes,
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self::from_config(&ReplicationConfig::default())
    }
}

/// Everything needed to bring bytes into the store
#[derive(Clone)]
struct Ingestor {
    machine: MachineId,
    keeper: QuotaKeeper,
    storage: Arc<dyn ContentStorage>,
    locator: Arc<dyn PeerLocator>,
}

impl Ingestor {
    async fn ingest(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
        size: u64,
        mut stream: ContentStream,
        cancel: &CancellationToken,
    ) -> StockpileResult<CommitOutcome> {
        let reservation = self.keeper.reserve(size).await?;
        let mut staged = self.storage.begin_write(hash, size).await?;

        if let Err(e) = receive(hash, size, &mut stream, staged.as_mut(), cancel).await {
            debug!("[{}] Discarding {} bytes of {}", ctx, staged.bytes_written(), hash.short());
            staged.abort().await;
            return Err(e);
        }

        staged.finish().await?;
        let outcome = reservation.commit(hash).await?;
        self.locator.register_location(&hash, &self.machine).await;

        info!("[{}] Stored {} ({} bytes, {:?})", ctx, hash.short(), size, outcome);
        Ok(outcome)
    }
}

/// Copy `stream` into `staged`, checking length and digest
async fn receive(
    hash: ContentHash,
    size: u64,
    stream: &mut ContentStream,
    staged: &mut dyn StagedWrite,
    cancel: &CancellationToken,
) -> StockpileResult<()> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(StockpileError::aborted(hash, "cancelled"));
            }
            read = stream.read(&mut buf) => {
                read.map_err(|e| StockpileError::aborted(hash, e.to_string()))?
            }
        };
        if read == 0 {
            break;
        }

        let received = hasher.bytes_hashed() + read as u64;
        if received > size {
            return Err(StockpileError::SizeMismatch {
                hash,
                expected: size,
                actual: received,
            });
        }
        hasher.update(&buf[..read]);
        staged.write_chunk(&buf[..read]).await?;
    }

    if hasher.bytes_hashed() != size {
        return Err(StockpileError::SizeMismatch {
            hash,
            expected: size,
            actual: hasher.bytes_hashed(),
        });
    }

    let actual = hasher.finalize();
    if actual != hash {
        return Err(StockpileError::HashMismatch {
            expected: hash,
            actual,
        });
    }
    Ok(())
}

/// Hash a file without loading it into memory
async fn hash_file(path: &Path) -> StockpileResult<ContentHash> {
    let (_, mut stream) = PushSource::File(path.to_path_buf()).open().await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = stream
            .read(&mut buf)
            .await
            .map_err(|e| StockpileError::io(format!("reading {}", path.display()), e))?;
        if read == 0 {
            return Ok(hasher.finalize());
        }
        hasher.update(&buf[..read]);
    }
}

/// One pull shared by every caller asking for the same hash
struct PullJob {
    ctx: OperationContext,
    hash: ContentHash,
    ingestor: Ingestor,
    transport: Arc<dyn PeerTransport>,
    pulls: PullMap,
}

impl PullJob {
    async fn run(self) -> CopyFileResult {
        let result = self.pull().await;
        lock(&self.pulls).remove(&self.hash);
        result
    }

    async fn pull(&self) -> CopyFileResult {
        let hash = self.hash;
        let sources: Vec<MachineId> = self
            .ingestor
            .locator
            .locations(&hash)
            .await
            .into_iter()
            .filter(|m| *m != self.ingestor.machine)
            .collect();

        if sources.is_empty() {
            return CopyFileResult::not_found(hash);
        }

        let mut attempts = Vec::new();
        for source in sources {
            let remote = match self.transport.fetch(&self.ctx, &source, hash).await {
                Ok(remote) => remote,
                Err(e) => {
                    if matches!(e, StockpileError::ContentNotFound(_)) {
                        self.ingestor.locator.unregister_location(&hash, &source).await;
                    }
                    attempts.push(format!("{}: {}", source, e));
                    continue;
                }
            };

            let size = remote.size;
            match self
                .ingestor
                .ingest(&self.ctx, hash, size, remote.stream, &CancellationToken::new())
                .await
            {
                Ok(_) => {
                    let result = CopyFileResult::copied(hash, source, size);
                    return if attempts.is_empty() {
                        result
                    } else {
                        result.with_diagnostics(attempts.join("; "))
                    };
                }
                Err(e) => {
                    warn!("[{}] Copy of {} from {} failed: {}", self.ctx, hash.short(), source, e);
                    attempts.push(format!("{}: {}", source, e));
                }
            }
        }

        CopyFileResult::failed(hash, format!("all {} sources failed", attempts.len()))
            .with_diagnostics(attempts.join("; "))
    }
}

/// Marks a hash as being pushed; released on drop
struct PushClaim<'a> {
    pushes: &'a Mutex<HashSet<ContentHash>>,
    hash: ContentHash,
}

impl<'a> PushClaim<'a> {
    fn acquire(pushes: &'a Mutex<HashSet<ContentHash>>, hash: ContentHash) -> Option<Self> {
        if lock(pushes).insert(hash) {
            Some(Self { pushes, hash })
        } else {
            None
        }
    }
}

impl Drop for PushClaim<'_> {
    fn drop(&mut self) {
        lock(self.pushes).remove(&self.hash);
    }
}

/// Stream that keeps its content pinned until dropped
struct PinnedStream {
    inner: ContentStream,
    _pin: PinGuard,
}

impl AsyncRead for PinnedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

/// This machine's content store
pub struct LocalContentStore {
    ingestor: Ingestor,
    transport: Arc<dyn PeerTransport>,
    settings: ReplicationSettings,
    pulls: PullMap,
    pushes: Mutex<HashSet<ContentHash>>,
    push_slots: Semaphore,
}

impl LocalContentStore {
    pub fn new(
        machine: MachineId,
        keeper: QuotaKeeper,
        storage: Arc<dyn ContentStorage>,
        locator: Arc<dyn PeerLocator>,
        transport: Arc<dyn PeerTransport>,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            ingestor: Ingestor {
                machine,
                keeper,
                storage,
                locator,
            },
            transport,
            settings,
            pulls: Arc::new(Mutex::new(HashMap::new())),
            pushes: Mutex::new(HashSet::new()),
            push_slots: Semaphore::new(settings.max_concurrent_inbound_pushes),
        }
    }

    /// Open the file-system store described by `config`
    ///
    /// Content already on disk is indexed and registered as local. Peers are
    /// reached through a loopback transport with nothing registered, so
    /// pushes to configured peers report them as unavailable.
    pub async fn open(config: &Config) -> StockpileResult<Self> {
        let limits = QuotaLimits::from_config(&config.quota)?;
        let storage = FileSystemStorage::open(&config.store.root).await?;
        let existing = storage.list().await?;
        let machine = MachineId::new(config.general.machine_id.as_str());

        let registry = LocationRegistry::new();
        for content in &existing {
            registry.register(&content.hash, &machine);
        }
        let index = Arc::new(ContentIndex::from_existing(
            existing
                .iter()
                .map(|c| (c.hash, c.size_bytes, c.modified)),
        ));
        debug!(
            "Indexed {} entries from {}",
            index.len(),
            config.store.root.display()
        );

        let keeper = QuotaKeeper::start(
            index,
            Arc::new(storage.clone()),
            config.quota.eviction_policy.build(),
            limits,
        );
        let locator = StaticRing::from_config(machine.clone(), &config.replication, registry);

        Ok(Self::new(
            machine,
            keeper,
            Arc::new(storage),
            Arc::new(locator),
            Arc::new(LoopbackTransport::new()),
            ReplicationSettings::from_config(&config.replication),
        ))
    }

    pub fn machine(&self) -> &MachineId {
        &self.ingestor.machine
    }

    pub fn keeper(&self) -> &QuotaKeeper {
        &self.ingestor.keeper
    }

    pub fn index(&self) -> &Arc<ContentIndex> {
        self.ingestor.keeper.index()
    }

    pub fn storage(&self) -> &Arc<dyn ContentStorage> {
        &self.ingestor.storage
    }

    pub fn locator(&self) -> &Arc<dyn PeerLocator> {
        &self.ingestor.locator
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    /// Index entries, ordered by hash
    pub fn list(&self) -> Vec<ContentEntry> {
        self.index().snapshot().entries().to_vec()
    }

    /// Store bytes produced on this machine
    pub async fn put_bytes(&self, ctx: &OperationContext, data: Vec<u8>) -> PutResult {
        let hash = ContentHash::of(&data);
        let size = data.len() as u64;
        if self.index().contains(&hash) {
            self.keeper().touch(hash);
            return PutResult::already_present(hash, size);
        }

        let stream: ContentStream = Box::pin(Cursor::new(data));
        self.put_stream(ctx, hash, size, stream).await
    }

    /// Store a file produced on this machine
    pub async fn put_file(&self, ctx: &OperationContext, path: &Path) -> StockpileResult<PutResult> {
        let hash = hash_file(path).await?;
        if let Some(size) = self.index().size_of(&hash) {
            self.keeper().touch(hash);
            return Ok(PutResult::already_present(hash, size));
        }

        let (size, stream) = PushSource::File(path.to_path_buf()).open().await?;
        Ok(self.put_stream(ctx, hash, size, stream).await)
    }

    async fn put_stream(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
        size: u64,
        stream: ContentStream,
    ) -> PutResult {
        match self
            .ingestor
            .ingest(ctx, hash, size, stream, &CancellationToken::new())
            .await
        {
            Ok(CommitOutcome::Added) => PutResult::stored(hash, size),
            Ok(CommitOutcome::AlreadyPresent) => PutResult::already_present(hash, size),
            Err(e) => PutResult::failed(hash, &e),
        }
    }

    /// Read content, keeping it pinned while the bytes are loaded
    pub async fn read(&self, hash: ContentHash) -> StockpileResult<Vec<u8>> {
        let _pin = self
            .keeper()
            .pin(hash)
            .await?
            .ok_or(StockpileError::ContentNotFound(hash))?;
        let bytes = self.storage().read(&hash).await?;
        self.keeper().touch(hash);
        Ok(bytes)
    }

    /// Replicate freshly stored content to peers
    pub async fn proactive_copy(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
        cancel: CancellationToken,
    ) -> ProactiveCopyResult {
        let session = ProactiveCopySession::new(
            ctx,
            hash,
            self.settings.proactive,
            self.ingestor.locator.as_ref(),
            self.transport.as_ref(),
            self.ingestor.storage.as_ref(),
        );
        session.run(self.index().contains(&hash), cancel).await
    }

    async fn fan_out_delete(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
        peers: Vec<MachineId>,
    ) -> Vec<String> {
        let outcomes = join_all(peers.into_iter().map(|peer| async move {
            let outcome = self.transport.delete(ctx, &peer, hash).await;
            (peer, outcome)
        }))
        .await;

        let mut report = Vec::new();
        for (peer, outcome) in outcomes {
            match outcome {
                Ok(result) if result.succeeded() => {
                    self.locator().unregister_location(&hash, &peer).await;
                    let status = match result.status() {
                        DeleteStatus::Deleted => "deleted",
                        _ => "absent",
                    };
                    report.push(format!("{}: {}", peer, status));
                }
                Ok(result) => report.push(format!(
                    "{}: failed ({})",
                    peer,
                    result.error_message().unwrap_or("unknown error")
                )),
                Err(e) => {
                    warn!("[{}] Forwarded delete of {} to {} failed: {}", ctx, hash.short(), peer, e);
                    report.push(format!("{}: failed ({})", peer, e));
                }
            }
        }
        report
    }
}

#[async_trait]
impl CopyRequestHandler for LocalContentStore {
    async fn handle_copy_file_request(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
    ) -> CopyFileResult {
        if let Some(size) = self.index().size_of(&hash) {
            return CopyFileResult::already_present(hash, size);
        }

        let pull = {
            let mut pulls = lock(&self.pulls);
            match pulls.get(&hash) {
                Some(in_flight) => {
                    debug!("[{}] Joining in-flight copy of {}", ctx, hash.short());
                    in_flight.clone()
                }
                None => {
                    let job = PullJob {
                        ctx: ctx.clone(),
                        hash,
                        ingestor: self.ingestor.clone(),
                        transport: Arc::clone(&self.transport),
                        pulls: Arc::clone(&self.pulls),
                    };
                    // Spawned so the pull finishes even if every waiter goes away
                    let task = tokio::spawn(job.run());
                    let pull = async move {
                        task.await.unwrap_or_else(|e| {
                            CopyFileResult::failed(hash, format!("copy task failed: {}", e))
                        })
                    }
                    .boxed()
                    .shared();
                    pulls.insert(hash, pull.clone());
                    pull
                }
            }
        };

        pull.await
    }
}

#[async_trait]
impl PushFileHandler for LocalContentStore {
    async fn has_content_locally(&self, _ctx: &OperationContext, hash: ContentHash) -> bool {
        self.index().contains(&hash)
    }

    async fn handle_push_file(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
        source: PushSource,
        cancel: CancellationToken,
    ) -> PutResult {
        if self.index().contains(&hash) {
            return PutResult::rejected(hash, PushRejection::ContentAvailableLocally);
        }
        if self.settings.max_concurrent_inbound_pushes == 0 {
            return PutResult::rejected(hash, PushRejection::NotSupported);
        }

        let Some(_claim) = PushClaim::acquire(&self.pushes, hash) else {
            debug!("[{}] Rejecting duplicate push of {}", ctx, hash.short());
            return PutResult::rejected(hash, PushRejection::OngoingCopy);
        };

        let Ok(_slot) = self.push_slots.try_acquire() else {
            warn!("[{}] Inbound push limit reached, rejecting {}", ctx, hash.short());
            return PutResult::rejected(hash, PushRejection::CopyLimitReached);
        };

        let (size, stream) = match source.open().await {
            Ok(opened) => opened,
            Err(e) => return PutResult::failed(hash, &e),
        };

        match self.ingestor.ingest(ctx, hash, size, stream, &cancel).await {
            Ok(CommitOutcome::Added) => PutResult::stored(hash, size),
            Ok(CommitOutcome::AlreadyPresent) => PutResult::already_present(hash, size),
            Err(e) => {
                warn!("[{}] Push of {} failed: {}", ctx, hash.short(), e);
                PutResult::failed(hash, &e)
            }
        }
    }
}

#[async_trait]
impl DeleteFileHandler for LocalContentStore {
    async fn handle_delete(
        &self,
        ctx: &OperationContext,
        hash: ContentHash,
        options: DeleteOptions,
    ) -> DeleteResult {
        let peers: Vec<MachineId> = if options.fan_out {
            self.locator()
                .locations(&hash)
                .await
                .into_iter()
                .filter(|m| m != self.machine())
                .collect()
        } else {
            Vec::new()
        };

        let local = match self.keeper().remove(hash).await {
            Ok(RemoveOutcome::Removed(entry)) => {
                self.locator().unregister_location(&hash, self.machine()).await;
                DeleteResult::deleted(hash, entry.size_bytes)
            }
            Ok(RemoveOutcome::Absent) => {
                self.locator().unregister_location(&hash, self.machine()).await;
                DeleteResult::absent(hash)
            }
            Err(e) => {
                warn!("[{}] Delete of {} failed: {}", ctx, hash.short(), e);
                DeleteResult::failed(hash, &e)
            }
        };
        if local.status() == DeleteStatus::Deleted {
            info!("[{}] Deleted {}", ctx, hash.short());
        }

        if peers.is_empty() {
            return local;
        }
        let report = self.fan_out_delete(ctx, hash, peers).await;
        local.with_diagnostics(report.join("; "))
    }
}

#[async_trait]
impl PeerEndpoint for LocalContentStore {
    async fn serve_content(
        &self,
        _ctx: &OperationContext,
        hash: ContentHash,
    ) -> StockpileResult<RemoteContent> {
        let pin = self
            .keeper()
            .pin(hash)
            .await?
            .ok_or(StockpileError::ContentNotFound(hash))?;
        let (size, inner) = self.storage().open(&hash).await?;
        self.keeper().touch(hash);

        Ok(RemoteContent {
            size,
            stream: Box::pin(PinnedStream { inner, _pin: pin }),
        })
    }
}
