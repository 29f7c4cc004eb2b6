use syncgrid_state::StateError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("state store error: {0}")]
    State(#[from] StateError),
}
