//! syncgrid-worker — executes queued sync jobs.
//!
//! A [`Worker`] claims one job at a time, takes the (repository, kind)
//! lock, records a run, and invokes a [`SyncExecutor`] while a
//! [`HeartbeatManager`] keeps the lease alive. The run is finalized exactly
//! once and the job is acked, retried, requeued or dead-lettered according
//! to the configured [`ClassificationPolicy`](syncgrid_core::ClassificationPolicy).
//!
//! [`WindowedExecutor`] is the stock executor for newest-first history
//! feeds; [`RoutingExecutor`] dispatches by physical kind.

pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod routing;
pub mod windowed;
pub mod worker;

pub use error::{WorkerError, WorkerResult};
pub use executor::{ExecutionJob, SyncExecutor, SyncOutcome, cursor_override};
pub use heartbeat::{AbortReason, HeartbeatManager, HeartbeatStats};
pub use routing::RoutingExecutor;
pub use windowed::{FetchError, FetchPage, RecordSink, RecordSource, WindowedExecutor};
pub use worker::{JobOutcome, Worker};
