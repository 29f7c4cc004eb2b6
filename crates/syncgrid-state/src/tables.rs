//! redb table definitions for the SyncGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Per-pair tables are keyed by `{repo_id}:{job_kind}`.

use redb::TableDefinition;

/// Repositories keyed by `{repo_id}`.
pub const REPOSITORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("repositories");

/// Sync cursors keyed by `{repo_id}:{job_kind}`.
pub const CURSORS: TableDefinition<&str, &[u8]> = TableDefinition::new("cursors");

/// Queue rows keyed by `{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Unique-active index: `{repo_id}:{job_kind}` -> job id of the pending/running job.
pub const ACTIVE_JOBS: TableDefinition<&str, &str> = TableDefinition::new("active_jobs");

/// Distributed locks keyed by `{repo_id}:{job_kind}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Circuit breaker rows keyed by `global`, `tenant:{id}` or `instance:{id}`.
pub const BREAKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("breakers");

/// Sync runs keyed by `{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Last observed rate-limit bucket keyed by `{hosting_instance}`.
pub const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");

/// Operator pauses keyed by scope (`tenant:{id}`, `instance:{id}`, `repo:{id}`).
pub const PAUSES: TableDefinition<&str, &[u8]> = TableDefinition::new("pauses");

/// Hourly enqueue counters keyed by `{scope}@{hour}`.
pub const BUDGET: TableDefinition<&str, &[u8]> = TableDefinition::new("budget");
