//! Quota requests
//!
//! Each request is created by a caller, enqueued exactly once and completed
//! exactly once. Completing twice is reported as `DoubleCompletion`; dropping
//! a request without completing it answers the caller with
//! `RequestAbandoned`. Both are logged at error level because they mean the
//! drain loop mishandled a request.

use crate::error::{StockpileError, StockpileResult};
use crate::quota::limits::{CalibrationInput, QuotaLimits};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::error;

/// Identifier of a quota request, unique within the process
pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Whether the completion reached a waiting caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The caller received the result
    Delivered,
    /// The caller stopped waiting before the result was ready
    CallerGone,
}

/// One-shot completion slot for a request
#[derive(Debug)]
pub struct Completion<T> {
    request: RequestId,
    tx: Option<oneshot::Sender<StockpileResult<T>>>,
}

impl<T> Completion<T> {
    fn new(request: RequestId) -> (Self, QuotaTicket<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                tx: Some(tx),
            },
            QuotaTicket { request, rx },
        )
    }

    /// Complete with a success value
    pub fn succeed(&mut self, value: T) -> StockpileResult<Delivery> {
        self.complete(Ok(value))
    }

    /// Complete with a failure
    pub fn fail(&mut self, err: StockpileError) -> StockpileResult<Delivery> {
        self.complete(Err(err))
    }

    /// Whether a result has already been sent
    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }

    fn complete(&mut self, result: StockpileResult<T>) -> StockpileResult<Delivery> {
        let Some(tx) = self.tx.take() else {
            error!("Quota request #{} completed twice", self.request);
            return Err(StockpileError::DoubleCompletion {
                request: self.request,
            });
        };

        match tx.send(result) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(_) => Ok(Delivery::CallerGone),
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            error!("Quota request #{} dropped without completion", self.request);
            let _ = tx.send(Err(StockpileError::RequestAbandoned {
                request: self.request,
            }));
        }
    }
}

/// Awaitable handle for the result of an enqueued request
#[derive(Debug)]
pub struct QuotaTicket<T> {
    request: RequestId,
    rx: oneshot::Receiver<StockpileResult<T>>,
}

impl<T> QuotaTicket<T> {
    /// Id of the request this ticket belongs to
    pub fn request_id(&self) -> RequestId {
        self.request
    }

    /// Wait for the result without consuming the ticket
    pub(crate) async fn recv(&mut self) -> StockpileResult<T> {
        (&mut self.rx).await.map_err(|_| StockpileError::KeeperStopped)?
    }

    /// Stop waiting and take a success value that was already delivered
    ///
    /// After this call the keeper sees the caller as gone, so a value is
    /// either returned here or never delivered at all.
    pub(crate) fn reclaim(&mut self) -> Option<T> {
        self.rx.close();
        self.rx.try_recv().ok().and_then(Result::ok)
    }
}

impl<T: Send + 'static> IntoFuture for QuotaTicket<T> {
    type Output = StockpileResult<T>;
    type IntoFuture = BoxFuture<'static, StockpileResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.rx.await.map_err(|_| StockpileError::KeeperStopped)? }.boxed()
    }
}

/// Result of a granted reservation or purge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReserveGrant {
    /// Request that produced this grant
    pub request: RequestId,
    /// Bytes reserved (0 for a purge)
    pub reserve_size: u64,
    /// Whether eviction ran to make room
    pub is_reserved_from_eviction: bool,
    /// Entries evicted while processing the request
    pub evicted_entries: usize,
    /// Bytes evicted while processing the request
    pub evicted_bytes: u64,
}

/// Reserve `reserve_size` bytes; 0 means purge down to the soft limit
#[derive(Debug)]
pub struct ReserveSpaceRequest {
    id: RequestId,
    reserve_size: u64,
    enqueued_at: Instant,
    pub(crate) completion: Completion<ReserveGrant>,
}

impl ReserveSpaceRequest {
    /// Create a reservation request and the ticket for its result
    pub fn new(reserve_size: u64) -> (Self, QuotaTicket<ReserveGrant>) {
        let id = next_request_id();
        let (completion, ticket) = Completion::new(id);
        (
            Self {
                id,
                reserve_size,
                enqueued_at: Instant::now(),
                completion,
            },
            ticket,
        )
    }

    /// Create a purge request
    pub fn purge() -> (Self, QuotaTicket<ReserveGrant>) {
        Self::new(0)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn reserve_size(&self) -> u64 {
        self.reserve_size
    }

    /// Whether this is a pure purge
    pub fn is_purge(&self) -> bool {
        self.reserve_size == 0
    }
}

/// Barrier: completes once everything enqueued before it has completed
#[derive(Debug)]
pub struct SynchronizationRequest {
    id: RequestId,
    enqueued_at: Instant,
    pub(crate) completion: Completion<()>,
}

impl SynchronizationRequest {
    pub fn new() -> (Self, QuotaTicket<()>) {
        let id = next_request_id();
        let (completion, ticket) = Completion::new(id);
        (
            Self {
                id,
                enqueued_at: Instant::now(),
                completion,
            },
            ticket,
        )
    }

    pub fn id(&self) -> RequestId {
        self.id
    }
}

/// Replace the soft/hard thresholds; entries are never touched
#[derive(Debug)]
pub struct CalibrateQuotaRequest {
    id: RequestId,
    input: CalibrationInput,
    enqueued_at: Instant,
    pub(crate) completion: Completion<QuotaLimits>,
}

impl CalibrateQuotaRequest {
    pub fn new(input: CalibrationInput) -> (Self, QuotaTicket<QuotaLimits>) {
        let id = next_request_id();
        let (completion, ticket) = Completion::new(id);
        (
            Self {
                id,
                input,
                enqueued_at: Instant::now(),
                completion,
            },
            ticket,
        )
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn input(&self) -> CalibrationInput {
        self.input
    }
}

/// Every operation that changes how much space the store may consume
#[derive(Debug)]
pub enum QuotaRequest {
    ReserveSpace(ReserveSpaceRequest),
    Synchronize(SynchronizationRequest),
    Calibrate(CalibrateQuotaRequest),
}

impl QuotaRequest {
    pub fn id(&self) -> RequestId {
        match self {
            Self::ReserveSpace(r) => r.id,
            Self::Synchronize(r) => r.id,
            Self::Calibrate(r) => r.id,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReserveSpace(r) if r.is_purge() => "purge",
            Self::ReserveSpace(_) => "reserve",
            Self::Synchronize(_) => "synchronize",
            Self::Calibrate(_) => "calibrate",
        }
    }

    /// Time spent in the queue so far
    pub fn queued_for(&self) -> std::time::Duration {
        let enqueued_at = match self {
            Self::ReserveSpace(r) => r.enqueued_at,
            Self::Synchronize(r) => r.enqueued_at,
            Self::Calibrate(r) => r.enqueued_at,
        };
        enqueued_at.elapsed()
    }

    /// Complete the request with a failure, whatever its variant
    pub fn fail(&mut self, err: StockpileError) -> StockpileResult<Delivery> {
        match self {
            Self::ReserveSpace(r) => r.completion.fail(err),
            Self::Synchronize(r) => r.completion.fail(err),
            Self::Calibrate(r) => r.completion.fail(err),
        }
    }
}
