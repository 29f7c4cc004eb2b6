//! Lock rows for per-(repository, kind) mutual exclusion.

use chrono::{DateTime, TimeDelta, Utc};

use syncgrid_core::JobKind;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, read_all, read_row, write_row};
use crate::tables::*;
use crate::types::*;

impl StateStore {
    /// Take the lock if nobody holds a live lease on it.
    ///
    /// Re-acquiring a lock already held by `worker_id` extends it.
    pub fn acquire_lock(
        &self,
        repo_id: &str,
        job_kind: JobKind,
        worker_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        let key = pair_key(repo_id, job_kind);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<Lock> = read_row(&table, &key)?;
            acquired = match current {
                Some(lock) if lock.is_live(now) && lock.holder_worker_id != worker_id => false,
                Some(lock) if lock.is_live(now) => {
                    let extended = Lock {
                        lease_expires_at: now + TimeDelta::seconds(lease_seconds),
                        ..lock
                    };
                    write_row(&mut table, &key, &extended)?;
                    true
                }
                _ => {
                    let lock = Lock {
                        repo_id: repo_id.to_string(),
                        job_kind,
                        holder_worker_id: worker_id.to_string(),
                        lease_expires_at: now + TimeDelta::seconds(lease_seconds),
                        acquired_at: now,
                    };
                    write_row(&mut table, &key, &lock)?;
                    true
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acquired)
    }

    /// Push out the expiry of a lock held by `worker_id`.
    pub fn extend_lock(
        &self,
        repo_id: &str,
        job_kind: JobKind,
        worker_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        let key = pair_key(repo_id, job_kind);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let extended;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<Lock> = read_row(&table, &key)?;
            extended = match current {
                Some(mut lock) if lock.holder_worker_id == worker_id => {
                    lock.lease_expires_at = now + TimeDelta::seconds(lease_seconds);
                    write_row(&mut table, &key, &lock)?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(extended)
    }

    /// Remove the lock only if `worker_id` still holds it.
    pub fn release_lock(
        &self,
        repo_id: &str,
        job_kind: JobKind,
        worker_id: &str,
    ) -> StateResult<bool> {
        let key = pair_key(repo_id, job_kind);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<Lock> = read_row(&table, &key)?;
            released = match current {
                Some(lock) if lock.holder_worker_id == worker_id => {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    pub fn get_lock(&self, repo_id: &str, job_kind: JobKind) -> StateResult<Option<Lock>> {
        self.get_json(LOCKS, &pair_key(repo_id, job_kind))
    }

    pub fn list_locks(&self) -> StateResult<Vec<Lock>> {
        self.list_json(LOCKS)
    }

    /// Delete lock rows whose lease lapsed. With `dry_run` nothing is removed.
    pub fn remove_expired_locks(&self, now: DateTime<Utc>, dry_run: bool) -> StateResult<Vec<Lock>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let expired: Vec<Lock>;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            expired = read_all::<Lock, _>(&table)?
                .into_iter()
                .filter(|lock| !lock.is_live(now))
                .collect();
            if !dry_run {
                for lock in &expired {
                    table
                        .remove(lock.table_key().as_str())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        if dry_run {
            txn.abort().map_err(map_err!(Transaction))?;
        } else {
            txn.commit().map_err(map_err!(Transaction))?;
        }
        Ok(expired)
    }
}
