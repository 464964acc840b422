//! Space accounting for the local store
//!
//! Every change to how much space the store consumes goes through the
//! [`QuotaKeeper`]: reservations for incoming content, purges down to the
//! soft limit, and threshold calibration.
//!
//! | Operation | Deficit | Fails when |
//! |-----------|---------|------------|
//! | `reserve(n)` | used + n − hard | still short after eviction |
//! | `purge()` | used − soft | never for lack of candidates |
//! | `calibrate(l)` | - | hard = 0 or soft > hard |

pub mod keeper;
pub mod limits;
pub mod policy;
pub mod request;

pub use keeper::{CommitOutcome, PendingReservation, PinGuard, QuotaKeeper, RemoveOutcome, Reservation};
pub use limits::{format_bytes, mb_to_bytes, CalibrationInput, QuotaLimits, QuotaUsage, SizeStatus};
pub use policy::{CompositeScore, EvictionPolicy, LargestFirst, LeastRecentlyUsed, PolicyKind};
pub use request::{Delivery, QuotaTicket, RequestId, ReserveGrant};
