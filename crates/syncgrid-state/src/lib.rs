//! syncgrid-state — embedded state store for SyncGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for repositories, sync cursors, the job queue, distributed locks,
//! circuit breakers, sync runs, rate-limit buckets, pauses and budget
//! counters.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Per-pair rows use `{repo_id}:{job_kind}` keys. Conditional updates
//! (claim, lease renewal, lock acquire, cursor advance, run finish) check and
//! write inside one write transaction, which redb serializes, so they are
//! atomic across every task sharing the store.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod jobs;
pub mod locks;
pub mod runs;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
