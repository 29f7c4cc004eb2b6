//! syncgrid-breaker — health-driven circuit breakers.
//!
//! Breakers exist per key: `global`, `tenant:<id>` and `instance:<id>`.
//! Each tick the [`BreakerRefresher`] loads every row, folds recent run
//! outcomes into a [`HealthWindow`], applies the
//! closed → open → half-open → closed/open transitions, saves the rows and
//! hands the scheduler a [`BreakerSnapshot`] of decisions.

pub mod error;
pub mod policy;
pub mod refresh;

pub use error::{BreakerError, BreakerResult};
pub use policy::{BreakerDecision, BreakerKey, BreakerPolicy, HealthWindow};
pub use refresh::{BreakerRefresher, BreakerSnapshot};
