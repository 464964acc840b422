//! Proactive copy
//!
//! After content is produced locally, push it to one ring partner and one
//! machine outside the ring before anyone asks for it. Both pushes run
//! concurrently, each bounded by its own timeout and the caller's
//! cancellation token. Failures are reported in the returned result and
//! logged; they never fail the write that produced the content.

use crate::config::ReplicationConfig;
use crate::context::OperationContext;
use crate::hash::ContentHash;
use crate::replication::peers::{MachineId, PeerLocator};
use crate::replication::results::{
    NotNeededReason, ProactiveCopyResult, PushFileResult, SkipReason,
};
use crate::replication::transport::PeerTransport;
use crate::storage::ContentStorage;
use futures_util::future::join;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which peer classes receive proactive copies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProactiveCopyMode {
    Disabled,
    InsideRing,
    OutsideRing,
    #[default]
    Both,
}

impl ProactiveCopyMode {
    pub fn includes_ring(self) -> bool {
        matches!(self, Self::InsideRing | Self::Both)
    }

    pub fn includes_outside_ring(self) -> bool {
        matches!(self, Self::OutsideRing | Self::Both)
    }
}

impl fmt::Display for ProactiveCopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            Self::Disabled => "disabled",
            Self::InsideRing => "inside_ring",
            Self::OutsideRing => "outside_ring",
            Self::Both => "both",
        };
        write!(f, "{}", mode)
    }
}

/// Tunables for proactive copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProactiveCopySettings {
    pub mode: ProactiveCopyMode,
    /// Skip once content has at least this many known locations
    pub locations_threshold: usize,
    pub push_timeout: Duration,
}

impl ProactiveCopySettings {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            mode: config.mode,
            locations_threshold: config.locations_threshold,
            push_timeout: Duration::from_secs(config.push_timeout_secs),
        }
    }
}

impl Default for ProactiveCopySettings {
    fn default() -> Self {
        Self::from_config(&ReplicationConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Ring,
    OutsideRing,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ring => write!(f, "ring"),
            Self::OutsideRing => write!(f, "outside-ring"),
        }
    }
}

/// Replicates one content item
pub struct ProactiveCopySession<'a> {
    ctx: &'a OperationContext,
    hash: ContentHash,
    settings: ProactiveCopySettings,
    locator: &'a dyn PeerLocator,
    transport: &'a dyn PeerTransport,
    storage: &'a dyn ContentStorage,
}

impl<'a> ProactiveCopySession<'a> {
    pub fn new(
        ctx: &'a OperationContext,
        hash: ContentHash,
        settings: ProactiveCopySettings,
        locator: &'a dyn PeerLocator,
        transport: &'a dyn PeerTransport,
        storage: &'a dyn ContentStorage,
    ) -> Self {
        Self {
            ctx,
            hash,
            settings,
            locator,
            transport,
            storage,
        }
    }

    /// Decide whether a copy is needed and, if so, push to both sides
    ///
    /// `is_local` is whether the content is in the local index.
    pub async fn run(&self, is_local: bool, cancel: CancellationToken) -> ProactiveCopyResult {
        if let Some(reason) = self.not_needed(is_local).await {
            debug!(
                "[{}] Proactive copy of {} not needed: {}",
                self.ctx,
                self.hash.short(),
                reason
            );
            return ProactiveCopyResult::not_needed(reason);
        }

        let candidates = self.locator.candidates(&self.hash).await;
        let ring_target = self.pick(Side::Ring, &candidates.ring);
        let outside_target = self.pick(Side::OutsideRing, &candidates.outside_ring);

        if matches!(
            (&ring_target, &outside_target),
            (Err(_), Err(_))
        ) {
            return ProactiveCopyResult::not_needed(NotNeededReason::NoEligiblePeers);
        }

        let (ring, outside_ring) = join(
            self.push_side(Side::Ring, ring_target, cancel.child_token()),
            self.push_side(Side::OutsideRing, outside_target, cancel.child_token()),
        )
        .await;

        let result = ProactiveCopyResult::needed(ring, outside_ring);
        match result.error_message() {
            Some(message) => warn!("[{}] {} ({})", self.ctx, message, self.hash.short()),
            None => info!(
                "[{}] Proactive copy of {}: {}",
                self.ctx,
                self.hash.short(),
                result
            ),
        }
        result
    }

    async fn not_needed(&self, is_local: bool) -> Option<NotNeededReason> {
        if self.settings.mode == ProactiveCopyMode::Disabled {
            return Some(NotNeededReason::Disabled);
        }
        if !is_local {
            return Some(NotNeededReason::ContentNotLocal);
        }

        let locations = self.locator.locations(&self.hash).await.len();
        if locations >= self.settings.locations_threshold {
            return Some(NotNeededReason::SufficientlyReplicated { locations });
        }

        None
    }

    fn pick(&self, side: Side, ranked: &[MachineId]) -> Result<MachineId, SkipReason> {
        let enabled = match side {
            Side::Ring => self.settings.mode.includes_ring(),
            Side::OutsideRing => self.settings.mode.includes_outside_ring(),
        };
        if !enabled {
            return Err(SkipReason::DisabledByMode);
        }
        ranked.first().cloned().ok_or(SkipReason::NoEligibleTarget)
    }

    async fn push_side(
        &self,
        side: Side,
        target: Result<MachineId, SkipReason>,
        cancel: CancellationToken,
    ) -> PushFileResult {
        let target = match target {
            Ok(target) => target,
            Err(reason) => return PushFileResult::skipped(reason),
        };

        let timeout = self.settings.push_timeout;
        let result = tokio::select! {
            _ = cancel.cancelled() => PushFileResult::failed(target.clone(), "cancelled"),
            outcome = tokio::time::timeout(timeout, self.push_to(&target, cancel.clone())) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        cancel.cancel();
                        PushFileResult::timed_out(target.clone(), timeout)
                    }
                }
            }
        };

        if result.target_holds_content() {
            self.locator.register_location(&self.hash, &target).await;
        } else if !result.succeeded() {
            warn!(
                "[{}] {} copy of {} {}",
                self.ctx,
                side,
                self.hash.short(),
                result
            );
        }
        result
    }

    async fn push_to(&self, target: &MachineId, cancel: CancellationToken) -> PushFileResult {
        match self.transport.has_content(self.ctx, target, self.hash).await {
            Ok(true) => return PushFileResult::already_present(target.clone()),
            Ok(false) => {}
            Err(e) => return PushFileResult::failed(target.clone(), e.to_string()),
        }

        let (size, stream) = match self.storage.open(&self.hash).await {
            Ok(opened) => opened,
            Err(e) => return PushFileResult::failed(target.clone(), e.to_string()),
        };

        debug!(
            "[{}] Pushing {} ({} bytes) to {}",
            self.ctx,
            self.hash.short(),
            size,
            target
        );
        match self
            .transport
            .push(self.ctx, target, self.hash, size, stream, cancel)
            .await
        {
            Ok(put) => PushFileResult::from_put(target.clone(), &put),
            Err(e) => PushFileResult::failed(target.clone(), e.to_string()),
        }
    }
}
