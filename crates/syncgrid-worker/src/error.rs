//! Worker error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] syncgrid_queue::QueueError),

    #[error("state store error: {0}")]
    State(#[from] syncgrid_state::StateError),

    /// The executor raised instead of returning an outcome. Surfaced only
    /// after the run record and the queue action were written.
    #[error("executor failed on job {job_id}: {message}")]
    Executor { job_id: String, message: String },
}

pub type WorkerResult<T> = Result<T, WorkerError>;
