//! Quota keeper
//!
//! Single-writer actor that owns every change to the store's space
//! accounting. Callers enqueue messages on one unbounded FIFO queue without
//! blocking; exactly one drain task applies them in arrival order. Because
//! every reservation observes the effects of all earlier ones, two
//! reservations can never both claim the same free space.
//!
//! ```text
//! reserve / purge / synchronize / calibrate      commit / release / remove / pin
//!                     \                              /
//!                      +--> unbounded queue (FIFO) <+
//!                                  |
//!                                  v
//!                        drain task (one at a time)
//!                          |            |
//!                    ContentIndex   EvictionPolicy --> ContentStorage::delete
//! ```

use crate::error::{StockpileError, StockpileResult};
use crate::hash::ContentHash;
use crate::index::{ContentEntry, ContentIndex, InsertOutcome};
use crate::quota::limits::{CalibrationInput, QuotaLimits, QuotaUsage};
use crate::quota::policy::EvictionPolicy;
use crate::quota::request::{
    CalibrateQuotaRequest, Delivery, QuotaRequest, QuotaTicket, RequestId, ReserveGrant,
    ReserveSpaceRequest, SynchronizationRequest,
};
use crate::storage::ContentStorage;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of committing reserved bytes into the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// New entry created
    Added,
    /// Content was already indexed; the reservation was released
    AlreadyPresent,
}

/// Result of an explicit removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Entry removed and its bytes deleted
    Removed(ContentEntry),
    /// Nothing to remove
    Absent,
}

pub(crate) enum KeeperMessage {
    Request(QuotaRequest),
    Commit {
        reservation: RequestId,
        size: u64,
        hash: ContentHash,
        reply: oneshot::Sender<CommitOutcome>,
    },
    Release {
        reservation: RequestId,
        size: u64,
    },
    Remove {
        hash: ContentHash,
        reply: oneshot::Sender<StockpileResult<RemoveOutcome>>,
    },
    Pin {
        hash: ContentHash,
        reply: oneshot::Sender<bool>,
    },
    Unpin {
        hash: ContentHash,
    },
    Touch {
        hash: ContentHash,
    },
}

/// Handle to the quota keeper; cheap to clone
///
/// The drain task stops once every handle, reservation and pin guard has
/// been dropped.
#[derive(Clone)]
pub struct QuotaKeeper {
    tx: mpsc::UnboundedSender<KeeperMessage>,
    index: Arc<ContentIndex>,
    usage: watch::Receiver<QuotaUsage>,
    policy_name: &'static str,
}

impl QuotaKeeper {
    /// Spawn the drain task on the current Tokio runtime
    pub fn start(
        index: Arc<ContentIndex>,
        storage: Arc<dyn ContentStorage>,
        policy: Arc<dyn EvictionPolicy>,
        limits: QuotaLimits,
    ) -> Self {
        Self::spawn(index, storage, policy, limits).0
    }

    /// Spawn the drain task and also return its join handle
    pub fn spawn(
        index: Arc<ContentIndex>,
        storage: Arc<dyn ContentStorage>,
        policy: Arc<dyn EvictionPolicy>,
        limits: QuotaLimits,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (usage_tx, usage_rx) = watch::channel(QuotaUsage::empty(limits));
        let policy_name = policy.name();

        let mut drain = DrainLoop {
            rx,
            index: Arc::clone(&index),
            storage,
            policy,
            limits,
            outstanding: HashMap::new(),
            reserved_bytes: 0,
            requests_processed: 0,
            evicted_entries: 0,
            evicted_bytes: 0,
            usage_tx,
        };
        drain.publish();

        info!(
            "Quota keeper started: {} entries, {} ({} policy)",
            index.len(),
            limits,
            policy_name
        );
        let task = tokio::spawn(drain.run());

        (
            Self {
                tx,
                index,
                usage: usage_rx,
                policy_name,
            },
            task,
        )
    }

    /// Shared read-only index
    pub fn index(&self) -> &Arc<ContentIndex> {
        &self.index
    }

    /// Name of the eviction policy in use
    pub fn policy_name(&self) -> &'static str {
        self.policy_name
    }

    /// Accounting as of the last drained message
    pub fn usage(&self) -> QuotaUsage {
        self.usage.borrow().clone()
    }

    /// Subscribe to accounting updates
    pub fn subscribe_usage(&self) -> watch::Receiver<QuotaUsage> {
        self.usage.clone()
    }

    fn send(&self, message: KeeperMessage) {
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            if let KeeperMessage::Request(mut request) = message {
                let _ = request.fail(StockpileError::KeeperStopped);
            }
        }
    }

    /// Enqueue a reservation without waiting for it
    pub fn enqueue_reserve(&self, size: u64) -> PendingReservation {
        let (request, ticket) = ReserveSpaceRequest::new(size);
        debug!("Enqueue reserve #{} ({} bytes)", request.id(), size);
        self.send(KeeperMessage::Request(QuotaRequest::ReserveSpace(request)));
        PendingReservation {
            request: ticket.request_id(),
            ticket: Some(ticket),
            tx: self.tx.clone(),
        }
    }

    /// Reserve `size` bytes, evicting if needed
    pub async fn reserve(&self, size: u64) -> StockpileResult<Reservation> {
        self.enqueue_reserve(size).await
    }

    /// Enqueue a purge without waiting for it
    pub fn enqueue_purge(&self) -> QuotaTicket<ReserveGrant> {
        let (request, ticket) = ReserveSpaceRequest::purge();
        debug!("Enqueue purge #{}", request.id());
        self.send(KeeperMessage::Request(QuotaRequest::ReserveSpace(request)));
        ticket
    }

    /// Evict down to the soft limit
    pub async fn purge(&self) -> StockpileResult<ReserveGrant> {
        self.enqueue_purge().await
    }

    /// Enqueue a barrier without waiting for it
    pub fn enqueue_synchronize(&self) -> QuotaTicket<()> {
        let (request, ticket) = SynchronizationRequest::new();
        self.send(KeeperMessage::Request(QuotaRequest::Synchronize(request)));
        ticket
    }

    /// Wait until everything enqueued so far has been processed
    pub async fn synchronize(&self) -> StockpileResult<()> {
        self.enqueue_synchronize().await
    }

    /// Enqueue a calibration without waiting for it
    pub fn enqueue_calibrate(&self, input: CalibrationInput) -> QuotaTicket<QuotaLimits> {
        let (request, ticket) = CalibrateQuotaRequest::new(input);
        self.send(KeeperMessage::Request(QuotaRequest::Calibrate(request)));
        ticket
    }

    /// Replace the thresholds; invalid input leaves the old ones in effect
    pub async fn calibrate(&self, input: CalibrationInput) -> StockpileResult<QuotaLimits> {
        self.enqueue_calibrate(input).await
    }

    /// Remove content from the index and delete its bytes
    pub async fn remove(&self, hash: ContentHash) -> StockpileResult<RemoveOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(KeeperMessage::Remove { hash, reply });
        rx.await.map_err(|_| StockpileError::KeeperStopped)?
    }

    /// Protect content from eviction while the guard lives
    ///
    /// Returns `None` when the content is not indexed.
    pub async fn pin(&self, hash: ContentHash) -> StockpileResult<Option<PinGuard>> {
        let (reply, rx) = oneshot::channel();
        self.send(KeeperMessage::Pin { hash, reply });
        let pinned = rx.await.map_err(|_| StockpileError::KeeperStopped)?;
        Ok(pinned.then(|| PinGuard {
            hash,
            tx: self.tx.clone(),
        }))
    }

    /// Record an access for recency-based policies
    pub fn touch(&self, hash: ContentHash) {
        self.send(KeeperMessage::Touch { hash });
    }
}

/// Reservation that has been enqueued but not yet granted
///
/// Dropping it releases the space, whether or not the grant has already
/// been delivered.
pub struct PendingReservation {
    request: RequestId,
    ticket: Option<QuotaTicket<ReserveGrant>>,
    tx: mpsc::UnboundedSender<KeeperMessage>,
}

impl PendingReservation {
    pub fn request_id(&self) -> RequestId {
        self.request
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        if let Some(grant) = self.ticket.as_mut().and_then(QuotaTicket::reclaim) {
            debug!("Reserve #{} dropped after grant, releasing", grant.request);
            drop(Reservation {
                grant,
                tx: Some(self.tx.clone()),
            });
        }
    }
}

impl IntoFuture for PendingReservation {
    type Output = StockpileResult<Reservation>;
    type IntoFuture = BoxFuture<'static, StockpileResult<Reservation>>;

    fn into_future(self) -> Self::IntoFuture {
        async move {
            let mut pending = self;
            let grant = match pending.ticket.as_mut() {
                Some(ticket) => ticket.recv().await?,
                None => return Err(StockpileError::KeeperStopped),
            };
            pending.ticket = None;
            Ok(Reservation {
                grant,
                tx: Some(pending.tx.clone()),
            })
        }
        .boxed()
    }
}

/// Granted space; released on drop unless committed
#[derive(Debug)]
pub struct Reservation {
    grant: ReserveGrant,
    tx: Option<mpsc::UnboundedSender<KeeperMessage>>,
}

impl Reservation {
    /// Bytes held by this reservation
    pub fn size(&self) -> u64 {
        self.grant.reserve_size
    }

    /// Details of how the reservation was granted
    pub fn grant(&self) -> &ReserveGrant {
        &self.grant
    }

    /// Whether eviction ran to make room
    pub fn is_reserved_from_eviction(&self) -> bool {
        self.grant.is_reserved_from_eviction
    }

    /// Turn the reserved bytes into an index entry for `hash`
    pub async fn commit(mut self, hash: ContentHash) -> StockpileResult<CommitOutcome> {
        let tx = self.tx.take().ok_or(StockpileError::KeeperStopped)?;
        let (reply, rx) = oneshot::channel();
        tx.send(KeeperMessage::Commit {
            reservation: self.grant.request,
            size: self.grant.reserve_size,
            hash,
            reply,
        })
        .map_err(|_| StockpileError::KeeperStopped)?;
        rx.await.map_err(|_| StockpileError::KeeperStopped)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(KeeperMessage::Release {
                reservation: self.grant.request,
                size: self.grant.reserve_size,
            });
        }
    }
}

/// Keeps content pinned until dropped
#[derive(Debug)]
pub struct PinGuard {
    hash: ContentHash,
    tx: mpsc::UnboundedSender<KeeperMessage>,
}

impl PinGuard {
    pub fn hash(&self) -> ContentHash {
        self.hash
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(KeeperMessage::Unpin { hash: self.hash });
    }
}

impl std::fmt::Debug for KeeperMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(r) => write!(f, "Request({} #{})", r.kind(), r.id()),
            Self::Commit { reservation, hash, .. } => {
                write!(f, "Commit(#{} {})", reservation, hash.short())
            }
            Self::Release { reservation, .. } => write!(f, "Release(#{})", reservation),
            Self::Remove { hash, .. } => write!(f, "Remove({})", hash.short()),
            Self::Pin { hash, .. } => write!(f, "Pin({})", hash.short()),
            Self::Unpin { hash } => write!(f, "Unpin({})", hash.short()),
            Self::Touch { hash } => write!(f, "Touch({})", hash.short()),
        }
    }
}

struct DrainLoop {
    rx: mpsc::UnboundedReceiver<KeeperMessage>,
    index: Arc<ContentIndex>,
    storage: Arc<dyn ContentStorage>,
    policy: Arc<dyn EvictionPolicy>,
    limits: QuotaLimits,
    outstanding: HashMap<RequestId, u64>,
    reserved_bytes: u64,
    requests_processed: u64,
    evicted_entries: u64,
    evicted_bytes: u64,
    usage_tx: watch::Sender<QuotaUsage>,
}

impl DrainLoop {
    async fn run(mut self) {
        // Replies are sent after publishing so a caller that sees its result
        // also sees its effect in `usage()`
        while let Some(message) = self.rx.recv().await {
            self.handle(message).await;
            self.publish();
        }
        debug!("Quota keeper queue closed, drain loop stopping");
    }

    fn used_bytes(&self) -> u64 {
        self.index.total_bytes() + self.reserved_bytes
    }

    fn publish(&mut self) {
        let usage = QuotaUsage {
            content_bytes: self.index.total_bytes(),
            reserved_bytes: self.reserved_bytes,
            entry_count: self.index.len(),
            limits: self.limits,
            requests_processed: self.requests_processed,
            evicted_entries: self.evicted_entries,
            evicted_bytes: self.evicted_bytes,
        };
        self.usage_tx.send_replace(usage);
    }

    async fn handle(&mut self, message: KeeperMessage) {
        match message {
            KeeperMessage::Request(request) => self.process(request).await,
            KeeperMessage::Commit {
                reservation,
                size,
                hash,
                reply,
            } => {
                self.release_reservation(reservation, size);
                let outcome = match self.index.insert(hash, size, Utc::now()) {
                    InsertOutcome::Inserted => {
                        debug!("Committed {} ({} bytes)", hash.short(), size);
                        CommitOutcome::Added
                    }
                    InsertOutcome::AlreadyPresent => CommitOutcome::AlreadyPresent,
                };
                self.publish();
                let _ = reply.send(outcome);
            }
            KeeperMessage::Release { reservation, size } => {
                self.release_reservation(reservation, size);
            }
            KeeperMessage::Remove { hash, reply } => {
                let outcome = self.remove(hash).await;
                self.publish();
                let _ = reply.send(outcome);
            }
            KeeperMessage::Pin { hash, reply } => {
                let _ = reply.send(self.index.pin(&hash));
            }
            KeeperMessage::Unpin { hash } => self.index.unpin(&hash),
            KeeperMessage::Touch { hash } => {
                self.index.touch(&hash, Utc::now());
            }
        }
    }

    async fn process(&mut self, request: QuotaRequest) {
        self.requests_processed += 1;
        let id = request.id();
        let kind = request.kind();
        debug!(
            "Processing {} #{} after {:?} in queue",
            kind,
            id,
            request.queued_for()
        );

        let completed = match request {
            QuotaRequest::ReserveSpace(mut request) => {
                let result = self.reserve_space(&request).await;
                self.publish();
                match result {
                    Ok(grant) => {
                        let size = grant.reserve_size;
                        let delivery = request.completion.succeed(grant);
                        if let Ok(Delivery::CallerGone) = delivery {
                            debug!("Reserve #{} abandoned by caller, releasing", id);
                            self.release_reservation(id, size);
                        }
                        delivery
                    }
                    Err(err) => {
                        debug!("Reserve #{} failed: {}", id, err);
                        request.completion.fail(err)
                    }
                }
            }
            QuotaRequest::Synchronize(mut request) => {
                self.publish();
                request.completion.succeed(())
            }
            QuotaRequest::Calibrate(mut request) => match request.input().validate() {
                Ok(limits) => {
                    info!("Quota calibrated: {} (was {})", limits, self.limits);
                    self.limits = limits;
                    self.publish();
                    request.completion.succeed(limits)
                }
                Err(err) => {
                    warn!("Rejected calibration #{}: {}", id, err);
                    self.publish();
                    request.completion.fail(err)
                }
            },
        };

        if let Err(err) = completed {
            error!("Failed to complete {} #{}: {}", kind, id, err);
        }
    }

    async fn reserve_space(&mut self, request: &ReserveSpaceRequest) -> StockpileResult<ReserveGrant> {
        let size = request.reserve_size();
        let hard = self.limits.hard_limit_bytes();

        if size > hard {
            return Err(StockpileError::CapacityExceeded {
                requested: size,
                available: hard.saturating_sub(self.used_bytes()),
                hard_limit: hard,
            });
        }

        let used = self.used_bytes();
        let deficit = if request.is_purge() {
            used.saturating_sub(self.limits.soft_limit_bytes())
        } else {
            (used + size).saturating_sub(hard)
        };

        let evicted = if deficit > 0 {
            self.evict(deficit).await
        } else {
            Vec::new()
        };
        let evicted_bytes: u64 = evicted.iter().map(|e| e.size_bytes).sum();

        if !request.is_purge() && self.used_bytes() + size > hard {
            return Err(StockpileError::CapacityExceeded {
                requested: size,
                available: hard.saturating_sub(self.used_bytes()),
                hard_limit: hard,
            });
        }

        if size > 0 {
            self.outstanding.insert(request.id(), size);
            self.reserved_bytes += size;
        }

        Ok(ReserveGrant {
            request: request.id(),
            reserve_size: size,
            is_reserved_from_eviction: deficit > 0 && !evicted.is_empty(),
            evicted_entries: evicted.len(),
            evicted_bytes,
        })
    }

    /// Remove candidates from the index until `deficit` bytes are freed or
    /// the policy runs out, then delete their bytes
    async fn evict(&mut self, deficit: u64) -> Vec<ContentEntry> {
        let victims = self.select_victims(deficit);

        for entry in &victims {
            info!(
                "Evicted {} ({} bytes, last access {})",
                entry.hash.short(),
                entry.size_bytes,
                entry.last_access.format("%Y-%m-%d %H:%M:%S")
            );
            if let Err(e) = self.storage.delete(&entry.hash).await {
                warn!("Failed to delete evicted content {}: {}", entry.hash, e);
            }
        }

        let freed: u64 = victims.iter().map(|e| e.size_bytes).sum();
        if freed < deficit {
            debug!(
                "Eviction freed {} of {} bytes; no candidates left",
                freed, deficit
            );
        }

        self.evicted_entries += victims.len() as u64;
        self.evicted_bytes += freed;
        victims
    }

    fn select_victims(&self, deficit: u64) -> Vec<ContentEntry> {
        let snapshot = self.index.snapshot();
        let mut freed = 0u64;
        let mut victims = Vec::new();

        for candidate in self.policy.candidates(&snapshot, deficit) {
            if freed >= deficit {
                break;
            }
            if candidate.is_pinned() {
                warn!(
                    "{} policy yielded pinned content {}, skipping",
                    self.policy.name(),
                    candidate.hash.short()
                );
                continue;
            }
            if let Some(entry) = self.index.remove(&candidate.hash) {
                freed += entry.size_bytes;
                victims.push(entry);
            }
        }

        victims
    }

    fn release_reservation(&mut self, reservation: RequestId, size: u64) {
        match self.outstanding.remove(&reservation) {
            Some(held) => self.reserved_bytes -= held,
            None if size > 0 => {
                warn!("Reservation #{} released twice or never granted", reservation)
            }
            None => {}
        }
    }

    async fn remove(&mut self, hash: ContentHash) -> StockpileResult<RemoveOutcome> {
        match self.index.get(&hash) {
            None => Ok(RemoveOutcome::Absent),
            Some(entry) if entry.is_pinned() => Err(StockpileError::ContentPinned(hash)),
            Some(entry) => {
                // Bytes first: a failed delete leaves the entry counted and retryable
                self.storage.delete(&hash).await?;
                let entry = self.index.remove(&hash).unwrap_or(entry);
                info!("Removed {} ({} bytes)", hash.short(), entry.size_bytes);
                Ok(RemoveOutcome::Removed(entry))
            }
        }
    }
}
