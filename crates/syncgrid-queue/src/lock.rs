//! Lease-based lock per (repository, kind).
//!
//! Acquisition never blocks. Storage errors during acquire count as "not
//! acquired" so duplicate work is never started on a flaky store; errors
//! during release are logged and swallowed so they cannot mask the job's
//! own outcome.

use tracing::{debug, warn};

use syncgrid_core::{JobKind, SharedClock};
use syncgrid_state::{Lock, StateStore};

use crate::error::QueueResult;

#[derive(Clone, Debug)]
pub struct DistributedLock {
    store: StateStore,
    clock: SharedClock,
}

impl DistributedLock {
    pub fn new(store: StateStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn acquire(
        &self,
        repo_id: &str,
        job_kind: JobKind,
        worker_id: &str,
        lease_seconds: i64,
    ) -> bool {
        match self
            .store
            .acquire_lock(repo_id, job_kind, worker_id, lease_seconds, self.clock.now())
        {
            Ok(acquired) => {
                debug!(%repo_id, %job_kind, %worker_id, acquired, "lock acquire");
                acquired
            }
            Err(e) => {
                warn!(%repo_id, %job_kind, %worker_id, error = %e, "lock acquire failed, treating as held");
                false
            }
        }
    }

    /// Push the lock's expiry out. `false` if the lock is no longer ours.
    pub fn extend(
        &self,
        repo_id: &str,
        job_kind: JobKind,
        worker_id: &str,
        lease_seconds: i64,
    ) -> bool {
        match self
            .store
            .extend_lock(repo_id, job_kind, worker_id, lease_seconds, self.clock.now())
        {
            Ok(extended) => extended,
            Err(e) => {
                warn!(%repo_id, %job_kind, %worker_id, error = %e, "lock extend failed");
                false
            }
        }
    }

    /// Release if still held by `worker_id`; otherwise a no-op.
    pub fn release(&self, repo_id: &str, job_kind: JobKind, worker_id: &str) -> bool {
        match self.store.release_lock(repo_id, job_kind, worker_id) {
            Ok(released) => {
                if !released {
                    debug!(%repo_id, %job_kind, %worker_id, "lock already gone or reassigned");
                }
                released
            }
            Err(e) => {
                warn!(%repo_id, %job_kind, %worker_id, error = %e, "lock release failed");
                false
            }
        }
    }

    pub fn holder(&self, repo_id: &str, job_kind: JobKind) -> QueueResult<Option<Lock>> {
        Ok(self
            .store
            .get_lock(repo_id, job_kind)?
            .filter(|lock| lock.is_live(self.clock.now())))
    }

    /// Remove lock rows whose lease lapsed.
    pub fn reap_expired(&self, dry_run: bool) -> QueueResult<Vec<Lock>> {
        Ok(self.store.remove_expired_locks(self.clock.now(), dry_run)?)
    }
}
