//! syncgrid-queue — the lease-based work queue and its companions.
//!
//! - [`JobQueue`]: enqueue with a unique-active constraint per
//!   (repository, kind), claim by priority, and lease-conditional
//!   renew/ack/retry/dead/requeue transitions.
//! - [`DistributedLock`]: non-blocking, lease-based mutual exclusion per
//!   (repository, kind). Fails safe toward "not acquired".
//! - [`Reaper`]: returns lapsed leases to the queue, removes expired locks
//!   and finalizes orphaned runs.

pub mod error;
pub mod lock;
pub mod queue;
pub mod reaper;

pub use error::{QueueError, QueueResult};
pub use lock::DistributedLock;
pub use queue::JobQueue;
pub use reaper::{ReapReport, Reaper};
