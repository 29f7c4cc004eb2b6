//! syncgrid-scheduler — decides which (repository, kind) pairs to sync.
//!
//! Each tick the [`Scheduler`] refreshes the circuit breakers, loads a
//! [`SchedulerSnapshot`] from the store and runs two pure steps over it:
//!
//! ```text
//! SchedulerSnapshot
//!   ├── select_jobs_to_enqueue  (queued / paused / bucket / backoff filters,
//!   │                            ranking, tick + active + hourly budgets)
//!   └── build_jobs_to_insert    (tenant + instance breakers, probe budgets,
//!                                physical kind, mode, payload)
//! ```
//!
//! The resulting jobs go through the `JobQueue`; failures on one job are
//! recorded in the [`TickReport`] and do not abort the tick.

pub mod build;
pub mod error;
pub mod scheduler;
pub mod select;
pub mod snapshot;

pub use build::{BuildResult, PlannedJob, build_jobs_to_insert};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{EnqueueFailure, PlannedSummary, Scheduler, TickReport};
pub use select::{EnqueueCandidate, Selection, SkipReason, SkippedJob, select_jobs_to_enqueue};
pub use snapshot::{ActiveCounts, KindSyncState, RepoSyncState, SchedulerSnapshot};
