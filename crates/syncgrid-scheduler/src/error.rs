//! Scheduler error types.

use thiserror::Error;

/// Errors that abort a scheduler tick.
///
/// Failures enqueueing a single job are not errors at this level; they are
/// collected in the tick report.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] syncgrid_state::StateError),

    #[error("queue error: {0}")]
    Queue(#[from] syncgrid_queue::QueueError),

    #[error("breaker refresh failed: {0}")]
    Breaker(#[from] syncgrid_breaker::BreakerError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
