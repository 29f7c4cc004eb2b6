use syncgrid_state::StateError;
use thiserror::Error;

pub type BreakerResult<T> = Result<T, BreakerError>;

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("invalid breaker key: {0:?}")]
    InvalidKey(String),
}
