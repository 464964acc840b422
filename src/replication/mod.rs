//! Replication between machines
//!
//! Inbound, peers call the handler traits to push content here, ask this
//! machine to pull content, or delete it. Outbound, a proactive copy session
//! pushes freshly produced content to one ring partner and one machine
//! outside the ring.
//!
//! | Request | Handler | Outcome |
//! |---------|---------|---------|
//! | push | `PushFileHandler` | `PutResult` |
//! | pull | `CopyRequestHandler` | `CopyFileResult` |
//! | delete | `DeleteFileHandler` | `DeleteResult` |
//! | proactive copy | `ProactiveCopySession` | `ProactiveCopyResult` |

pub mod handlers;
pub mod local;
pub mod peers;
pub mod results;
pub mod session;
pub mod transport;

pub use handlers::{CopyRequestHandler, DeleteFileHandler, DeleteOptions, PushFileHandler, PushSource};
pub use local::{LocalContentStore, ReplicationSettings};
pub use peers::{LocationRegistry, MachineId, PeerLocator, ReplicaCandidates, StaticRing};
pub use results::{
    CopyFileResult, CopyStatus, DeleteResult, DeleteStatus, NotNeededReason, ProactiveCopyResult,
    PushFileResult, PushRejection, PushStatus, PutResult, PutStatus, SkipReason,
};
pub use session::{ProactiveCopyMode, ProactiveCopySession, ProactiveCopySettings};
pub use transport::{LoopbackTransport, PeerEndpoint, PeerTransport, RemoteContent};
