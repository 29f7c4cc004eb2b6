//! StateStore: redb-backed state persistence for SyncGrid.
//!
//! Provides typed operations over repositories, cursors, circuit breakers,
//! rate-limit buckets, pauses and budget counters. Queue, lock and run
//! operations live in their own modules as further `impl StateStore` blocks.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use syncgrid_core::{JobKind, Watermark};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Every JSON-valued table.
pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Read one JSON row inside an open transaction.
pub(crate) fn read_row<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Decode every row of a table inside an open transaction.
pub(crate) fn read_all<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

pub(crate) fn write_row<T: Serialize>(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    ///
    /// The file is locked for as long as the store is open: one process
    /// owns it and every role sharing the store runs inside that process.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => StateError::AlreadyOpen(path.to_path_buf()),
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [
            REPOSITORIES,
            CURSORS,
            JOBS,
            LOCKS,
            BREAKERS,
            RUNS,
            BUCKETS,
            PAUSES,
            BUDGET,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic row access ─────────────────────────────────────────

    pub(crate) fn get_json<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_row(&table, key)
    }

    pub(crate) fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_all(&table)
    }

    pub(crate) fn put_json<T: Serialize>(
        &self,
        def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            write_row(&mut table, key, value)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub(crate) fn delete_json(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Repositories ───────────────────────────────────────────────

    /// Insert or update a repository.
    pub fn put_repository(&self, repo: &Repository) -> StateResult<()> {
        self.put_json(REPOSITORIES, &repo.repo_id, repo)?;
        debug!(repo_id = %repo.repo_id, "repository stored");
        Ok(())
    }

    pub fn get_repository(&self, repo_id: &str) -> StateResult<Option<Repository>> {
        self.get_json(REPOSITORIES, repo_id)
    }

    pub fn list_repositories(&self) -> StateResult<Vec<Repository>> {
        self.list_json(REPOSITORIES)
    }

    /// Upsert configured repositories in one transaction, keeping the
    /// original `created_at` of rows that already exist. Returns how many
    /// rows were new.
    pub fn sync_repositories(&self, repos: &[Repository]) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut inserted = 0;
        {
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            for repo in repos {
                let existing: Option<Repository> = read_row(&table, &repo.repo_id)?;
                let mut row = repo.clone();
                match existing {
                    Some(prev) => row.created_at = prev.created_at,
                    None => inserted += 1,
                }
                write_row(&mut table, &row.repo_id, &row)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(total = repos.len(), inserted, "repositories synchronised");
        Ok(inserted)
    }

    // ── Cursors ────────────────────────────────────────────────────

    pub fn get_cursor(&self, repo_id: &str, job_kind: JobKind) -> StateResult<Option<SyncCursor>> {
        self.get_json(CURSORS, &pair_key(repo_id, job_kind))
    }

    pub fn list_cursors(&self) -> StateResult<Vec<SyncCursor>> {
        self.list_json(CURSORS)
    }

    /// Move a cursor forward. Returns `false` (and writes nothing) when the
    /// stored watermark is already at or past `watermark`.
    pub fn advance_cursor(
        &self,
        repo_id: &str,
        job_kind: JobKind,
        watermark: &Watermark,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        let key = pair_key(repo_id, job_kind);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let advanced;
        {
            let mut table = txn.open_table(CURSORS).map_err(map_err!(Table))?;
            let current: Option<SyncCursor> = read_row(&table, &key)?;
            advanced = current.as_ref().is_none_or(|c| *watermark > c.watermark);
            if advanced {
                let cursor = SyncCursor {
                    repo_id: repo_id.to_string(),
                    job_kind,
                    watermark: watermark.clone(),
                    updated_at: now,
                };
                write_row(&mut table, &key, &cursor)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, advanced, "cursor advance");
        Ok(advanced)
    }

    // ── Circuit breakers ───────────────────────────────────────────

    pub fn get_breaker(&self, key: &str) -> StateResult<Option<CircuitBreakerRecord>> {
        self.get_json(BREAKERS, key)
    }

    pub fn put_breaker(&self, record: &CircuitBreakerRecord) -> StateResult<()> {
        self.put_json(BREAKERS, &record.key, record)
    }

    /// Save several breaker rows atomically.
    pub fn put_breakers(&self, records: &[CircuitBreakerRecord]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BREAKERS).map_err(map_err!(Table))?;
            for record in records {
                write_row(&mut table, &record.key, record)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn list_breakers(&self) -> StateResult<Vec<CircuitBreakerRecord>> {
        self.list_json(BREAKERS)
    }

    /// Add `issued` to the probe counter of a half-open breaker.
    pub fn record_probes_issued(&self, key: &str, issued: u32) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(BREAKERS).map_err(map_err!(Table))?;
            let current: Option<CircuitBreakerRecord> = read_row(&table, key)?;
            updated = match current {
                Some(mut record) if record.state == BreakerState::HalfOpen => {
                    record.probes_issued = record.probes_issued.saturating_add(issued);
                    write_row(&mut table, key, &record)?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Buckets ────────────────────────────────────────────────────

    pub fn put_bucket(&self, bucket: &BucketStatus) -> StateResult<()> {
        self.put_json(BUCKETS, &bucket.hosting_instance, bucket)
    }

    pub fn get_bucket(&self, hosting_instance: &str) -> StateResult<Option<BucketStatus>> {
        self.get_json(BUCKETS, hosting_instance)
    }

    pub fn list_buckets(&self) -> StateResult<Vec<BucketStatus>> {
        self.list_json(BUCKETS)
    }

    // ── Pauses ─────────────────────────────────────────────────────

    pub fn put_pause(&self, pause: &PauseRecord) -> StateResult<()> {
        self.put_json(PAUSES, &pause.scope, pause)?;
        debug!(scope = %pause.scope, until = %pause.paused_until, "pause stored");
        Ok(())
    }

    pub fn remove_pause(&self, scope: &str) -> StateResult<bool> {
        self.delete_json(PAUSES, scope)
    }

    pub fn list_pauses(&self) -> StateResult<Vec<PauseRecord>> {
        self.list_json(PAUSES)
    }

    // ── Budget counters ────────────────────────────────────────────

    pub fn get_budget(&self, scope: &str, hour: &str) -> StateResult<u64> {
        let counter: Option<BudgetCounter> = self.get_json(BUDGET, &budget_key(scope, hour))?;
        Ok(counter.map(|c| c.enqueued).unwrap_or(0))
    }

    /// All counters for one hour bucket.
    pub fn list_budget_for_hour(&self, hour: &str) -> StateResult<Vec<BudgetCounter>> {
        let all: Vec<BudgetCounter> = self.list_json(BUDGET)?;
        Ok(all.into_iter().filter(|c| c.hour == hour).collect())
    }

    /// Add `by` to a counter and return the new value.
    pub fn increment_budget(&self, scope: &str, hour: &str, by: u64) -> StateResult<u64> {
        let key = budget_key(scope, hour);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let total;
        {
            let mut table = txn.open_table(BUDGET).map_err(map_err!(Table))?;
            let mut counter: BudgetCounter = read_row(&table, &key)?.unwrap_or(BudgetCounter {
                scope: scope.to_string(),
                hour: hour.to_string(),
                enqueued: 0,
            });
            counter.enqueued = counter.enqueued.saturating_add(by);
            total = counter.enqueued;
            write_row(&mut table, &key, &counter)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(total)
    }

    /// Drop counters for hours other than `keep_hour`. Returns rows removed.
    pub fn prune_budget(&self, keep_hour: &str) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stale: Vec<String>;
        {
            let mut table = txn.open_table(BUDGET).map_err(map_err!(Table))?;
            let counters: Vec<BudgetCounter> = read_all(&table)?;
            stale = counters
                .into_iter()
                .filter(|c| c.hour != keep_hour)
                .map(|c| c.table_key())
                .collect();
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stale.len())
    }
}
