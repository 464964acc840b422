//! Outcome records for replication operations
//!
//! Results are values, not errors: a failed push or copy is reported through
//! the result's status and error message and never escalated to the caller
//! that produced the content.

use crate::error::StockpileError;
use crate::hash::ContentHash;
use crate::replication::peers::MachineId;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Why a peer refused a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushRejection {
    /// The receiver already holds the content
    ContentAvailableLocally,
    /// Another push of the same content is in progress
    OngoingCopy,
    /// Too many inbound pushes in progress
    CopyLimitReached,
    /// The receiver does not accept pushes
    NotSupported,
}

impl fmt::Display for PushRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::ContentAvailableLocally => "content available locally",
            Self::OngoingCopy => "ongoing copy",
            Self::CopyLimitReached => "copy limit reached",
            Self::NotSupported => "not supported",
        };
        write!(f, "{}", reason)
    }
}

/// Outcome of storing content locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum PutStatus {
    Stored,
    AlreadyPresent,
    Rejected(PushRejection),
    Failed,
}

/// Result of putting content into a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutResult {
    hash: ContentHash,
    #[serde(flatten)]
    status: PutStatus,
    size_bytes: u64,
    error: Option<String>,
    diagnostics: Option<String>,
}

impl PutResult {
    fn new(hash: ContentHash, status: PutStatus, size_bytes: u64) -> Self {
        Self {
            hash,
            status,
            size_bytes,
            error: None,
            diagnostics: None,
        }
    }

    pub fn stored(hash: ContentHash, size_bytes: u64) -> Self {
        Self::new(hash, PutStatus::Stored, size_bytes)
    }

    pub fn already_present(hash: ContentHash, size_bytes: u64) -> Self {
        Self::new(hash, PutStatus::AlreadyPresent, size_bytes)
    }

    pub fn rejected(hash: ContentHash, rejection: PushRejection) -> Self {
        let mut result = Self::new(hash, PutStatus::Rejected(rejection), 0);
        if rejection != PushRejection::ContentAvailableLocally {
            result.error = Some(format!("push rejected: {}", rejection));
        }
        result
    }

    pub fn failed(hash: ContentHash, error: &StockpileError) -> Self {
        let mut result = Self::new(hash, PutStatus::Failed, 0);
        result.error = Some(error.to_string());
        result
    }

    /// Attach diagnostic text
    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }

    /// Stored, already present, or rejected because the receiver has it
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            PutStatus::Stored
                | PutStatus::AlreadyPresent
                | PutStatus::Rejected(PushRejection::ContentAvailableLocally)
        )
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn status(&self) -> PutStatus {
        self.status
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }
}

/// Why one side of a proactive copy did not push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The replication mode excludes this side
    DisabledByMode,
    /// No peer of this class is eligible
    NoEligibleTarget,
}

/// Outcome of pushing content to one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum PushStatus {
    Succeeded,
    AlreadyPresent,
    Skipped(SkipReason),
    Rejected(PushRejection),
    Failed,
}

/// Result of one proactive push
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushFileResult {
    #[serde(flatten)]
    status: PushStatus,
    target: Option<MachineId>,
    error: Option<String>,
    diagnostics: Option<String>,
}

impl PushFileResult {
    fn new(status: PushStatus, target: Option<MachineId>) -> Self {
        Self {
            status,
            target,
            error: None,
            diagnostics: None,
        }
    }

    pub fn succeeded_to(target: MachineId) -> Self {
        Self::new(PushStatus::Succeeded, Some(target))
    }

    pub fn already_present(target: MachineId) -> Self {
        Self::new(PushStatus::AlreadyPresent, Some(target))
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self::new(PushStatus::Skipped(reason), None)
    }

    pub fn rejected(target: MachineId, rejection: PushRejection) -> Self {
        let mut result = Self::new(PushStatus::Rejected(rejection), Some(target));
        if rejection != PushRejection::ContentAvailableLocally {
            result.error = Some(format!("rejected: {}", rejection));
        }
        result
    }

    pub fn failed(target: MachineId, message: impl Into<String>) -> Self {
        let mut result = Self::new(PushStatus::Failed, Some(target));
        result.error = Some(message.into());
        result
    }

    pub fn timed_out(target: MachineId, timeout: Duration) -> Self {
        Self::failed(target, format!("timed out after {}s", timeout.as_secs()))
    }

    /// Translate the receiver's put outcome
    pub fn from_put(target: MachineId, put: &PutResult) -> Self {
        let result = match put.status() {
            PutStatus::Stored => Self::succeeded_to(target),
            PutStatus::AlreadyPresent => Self::already_present(target),
            PutStatus::Rejected(rejection) => Self::rejected(target, rejection),
            PutStatus::Failed => Self::failed(
                target,
                put.error_message().unwrap_or("push failed").to_string(),
            ),
        };
        match put.diagnostics() {
            Some(d) => result.with_diagnostics(d),
            None => result,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }

    /// Anything but a failure or a refusal counts as success
    pub fn succeeded(&self) -> bool {
        match self.status {
            PushStatus::Succeeded | PushStatus::AlreadyPresent | PushStatus::Skipped(_) => true,
            PushStatus::Rejected(rejection) => rejection == PushRejection::ContentAvailableLocally,
            PushStatus::Failed => false,
        }
    }

    /// Whether the content is now known to be on the target
    pub fn target_holds_content(&self) -> bool {
        matches!(
            self.status,
            PushStatus::Succeeded
                | PushStatus::AlreadyPresent
                | PushStatus::Rejected(PushRejection::ContentAvailableLocally)
        )
    }

    pub fn status(&self) -> PushStatus {
        self.status
    }

    pub fn target(&self) -> Option<&MachineId> {
        self.target.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }
}

impl fmt::Display for PushFileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self
            .target
            .as_ref()
            .map(|t| t.as_str())
            .unwrap_or("<none>");
        match self.status {
            PushStatus::Succeeded => write!(f, "succeeded to {}", target),
            PushStatus::AlreadyPresent => write!(f, "already present on {}", target),
            PushStatus::Skipped(SkipReason::DisabledByMode) => write!(f, "skipped (disabled)"),
            PushStatus::Skipped(SkipReason::NoEligibleTarget) => {
                write!(f, "skipped (no eligible target)")
            }
            PushStatus::Rejected(rejection) => write!(f, "rejected by {} ({})", target, rejection),
            PushStatus::Failed => write!(
                f,
                "failed on {}: {}",
                target,
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Outcome of pulling content from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Copied,
    AlreadyPresent,
    NotFound,
    Failed,
}

/// Result of a copy (pull) request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyFileResult {
    hash: ContentHash,
    status: CopyStatus,
    source: Option<MachineId>,
    size_bytes: u64,
    error: Option<String>,
    diagnostics: Option<String>,
}

impl CopyFileResult {
    fn new(hash: ContentHash, status: CopyStatus) -> Self {
        Self {
            hash,
            status,
            source: None,
            size_bytes: 0,
            error: None,
            diagnostics: None,
        }
    }

    pub fn copied(hash: ContentHash, source: MachineId, size_bytes: u64) -> Self {
        Self {
            source: Some(source),
            size_bytes,
            ..Self::new(hash, CopyStatus::Copied)
        }
    }

    pub fn already_present(hash: ContentHash, size_bytes: u64) -> Self {
        Self {
            size_bytes,
            ..Self::new(hash, CopyStatus::AlreadyPresent)
        }
    }

    pub fn not_found(hash: ContentHash) -> Self {
        Self {
            error: Some(format!("no known location for {}", hash.short())),
            ..Self::new(hash, CopyStatus::NotFound)
        }
    }

    pub fn failed(hash: ContentHash, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(hash, CopyStatus::Failed)
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, CopyStatus::Copied | CopyStatus::AlreadyPresent)
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn status(&self) -> CopyStatus {
        self.status
    }

    pub fn source(&self) -> Option<&MachineId> {
        self.source.as_ref()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }
}

/// Outcome of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
    Absent,
    Failed,
}

/// Result of a delete request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    hash: ContentHash,
    status: DeleteStatus,
    freed_bytes: u64,
    error: Option<String>,
    diagnostics: Option<String>,
}

impl DeleteResult {
    fn new(hash: ContentHash, status: DeleteStatus) -> Self {
        Self {
            hash,
            status,
            freed_bytes: 0,
            error: None,
            diagnostics: None,
        }
    }

    pub fn deleted(hash: ContentHash, freed_bytes: u64) -> Self {
        Self {
            freed_bytes,
            ..Self::new(hash, DeleteStatus::Deleted)
        }
    }

    pub fn absent(hash: ContentHash) -> Self {
        Self::new(hash, DeleteStatus::Absent)
    }

    pub fn failed(hash: ContentHash, error: &StockpileError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(hash, DeleteStatus::Failed)
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }

    /// Deleting absent content is a success
    pub fn succeeded(&self) -> bool {
        self.status != DeleteStatus::Failed
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn status(&self) -> DeleteStatus {
        self.status
    }

    pub fn freed_bytes(&self) -> u64 {
        self.freed_bytes
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }
}

/// Why a proactive copy was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum NotNeededReason {
    /// Proactive replication is switched off
    Disabled,
    /// The content is not in the local store
    ContentNotLocal,
    /// Enough machines already hold the content
    SufficientlyReplicated { locations: usize },
    /// No peer is eligible to receive it
    NoEligiblePeers,
}

impl fmt::Display for NotNeededReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "proactive copy disabled"),
            Self::ContentNotLocal => write!(f, "content not in local store"),
            Self::SufficientlyReplicated { locations } => {
                write!(f, "already replicated to {} locations", locations)
            }
            Self::NoEligiblePeers => write!(f, "no eligible peers"),
        }
    }
}

/// Combined outcome of replicating to a ring and an outside-ring target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ProactiveCopyResult {
    NotNeeded {
        reason: NotNeededReason,
    },
    Needed {
        ring: PushFileResult,
        outside_ring: PushFileResult,
    },
}

impl ProactiveCopyResult {
    pub fn not_needed(reason: NotNeededReason) -> Self {
        Self::NotNeeded { reason }
    }

    pub fn needed(ring: PushFileResult, outside_ring: PushFileResult) -> Self {
        Self::Needed { ring, outside_ring }
    }

    /// False only when no push was attempted
    pub fn was_proactive_copy_needed(&self) -> bool {
        matches!(self, Self::Needed { .. })
    }

    /// True unless either side failed
    pub fn succeeded(&self) -> bool {
        match self {
            Self::NotNeeded { .. } => true,
            Self::Needed { ring, outside_ring } => ring.succeeded() && outside_ring.succeeded(),
        }
    }

    /// Message naming both sides' outcomes if either failed
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Needed { ring, outside_ring } if !self.succeeded() => Some(format!(
                "Proactive copy degraded. Ring: {}. Outside ring: {}.",
                ring, outside_ring
            )),
            _ => None,
        }
    }
}

impl fmt::Display for ProactiveCopyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotNeeded { reason } => write!(f, "not needed ({})", reason),
            Self::Needed { ring, outside_ring } => {
                write!(f, "ring {}, outside ring {}", ring, outside_ring)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(name: &str) -> MachineId {
        MachineId::new(name)
    }

    #[test]
    fn not_needed_carries_no_error() {
        let result = ProactiveCopyResult::not_needed(NotNeededReason::NoEligiblePeers);

        assert!(!result.was_proactive_copy_needed());
        assert!(result.succeeded());
        assert!(result.error_message().is_none());
    }

    #[test]
    fn one_failed_side_names_both() {
        let result = ProactiveCopyResult::needed(
            PushFileResult::succeeded_to(machine("ring-1")),
            PushFileResult::failed(machine("far-2"), "connection reset"),
        );

        let message = result.error_message().unwrap();
        assert!(result.was_proactive_copy_needed());
        assert!(message.contains("Ring: succeeded to ring-1"));
        assert!(message.contains("Outside ring: failed on far-2: connection reset"));
    }

    #[test]
    fn both_succeeding_is_plain_success() {
        let result = ProactiveCopyResult::needed(
            PushFileResult::already_present(machine("ring-1")),
            PushFileResult::skipped(SkipReason::DisabledByMode),
        );

        assert!(result.succeeded());
        assert!(result.error_message().is_none());
    }

    #[test]
    fn rejection_reasons_classify() {
        let available =
            PushFileResult::rejected(machine("a"), PushRejection::ContentAvailableLocally);
        let busy = PushFileResult::rejected(machine("b"), PushRejection::CopyLimitReached);

        assert!(available.succeeded());
        assert!(available.error_message().is_none());
        assert!(!busy.succeeded());
        assert_eq!(busy.to_string(), "rejected by b (copy limit reached)");
    }

    #[test]
    fn push_result_from_put() {
        let hash = ContentHash::of(b"x");
        let put = PutResult::failed(hash, &StockpileError::aborted(hash, "cancelled"));

        let push = PushFileResult::from_put(machine("peer"), &put);

        assert_eq!(push.status(), PushStatus::Failed);
        assert!(push.error_message().unwrap().contains("cancelled"));
    }

    #[test]
    fn delete_absent_is_success() {
        let result = DeleteResult::absent(ContentHash::of(b"gone"));
        assert!(result.succeeded());
        assert_eq!(result.freed_bytes(), 0);
    }

    #[test]
    fn results_serialize_with_status() {
        let result = PutResult::rejected(ContentHash::of(b"x"), PushRejection::OngoingCopy);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "ongoing_copy");
    }
}
