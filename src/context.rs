//! Operation context
//!
//! An opaque correlation object threaded through every quota and
//! replication operation. The core forwards it and prints it in logs;
//! it never branches on its contents.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation context for one logical operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Correlation id, shared by every log line of the operation
    id: Uuid,

    /// Optional caller-supplied label (e.g. the build step name)
    label: Option<String>,
}

impl OperationContext {
    /// Create a context with a fresh correlation id
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            label: None,
        }
    }

    /// Attach a human-readable label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Correlation id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Caller-supplied label, if any
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}:{}", label, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
