//! JobQueue: typed queue API over the state store.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, warn};

use syncgrid_core::{JobKind, JobState, SharedClock, redact_credentials};
use syncgrid_state::{EnqueueOutcome, NewJob, StateStore, SyncJob};

use crate::error::QueueResult;

/// Lease-based work queue.
///
/// Mutations after `claim` are conditional on the caller still owning the
/// lease and report whether they applied.
#[derive(Clone, Debug)]
pub struct JobQueue {
    store: StateStore,
    clock: SharedClock,
}

impl JobQueue {
    pub fn new(store: StateStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn enqueue(&self, job: NewJob) -> QueueResult<EnqueueOutcome> {
        let repo_id = job.repo_id.clone();
        let job_kind = job.job_kind;
        let outcome = self.store.enqueue_job(job, self.clock.now())?;
        if let EnqueueOutcome::AlreadyActive { job_id } = &outcome {
            debug!(%repo_id, %job_kind, %job_id, "pair already has an active job");
        }
        Ok(outcome)
    }

    pub fn claim(
        &self,
        worker_id: &str,
        job_kinds: &[JobKind],
        lease_seconds: i64,
    ) -> QueueResult<Option<SyncJob>> {
        Ok(self
            .store
            .claim_job(worker_id, job_kinds, lease_seconds, self.clock.now())?)
    }

    pub fn renew_lease(&self, job_id: &str, worker_id: &str, lease_seconds: i64) -> QueueResult<bool> {
        let renewed = self
            .store
            .renew_lease(job_id, worker_id, lease_seconds, self.clock.now())?;
        if !renewed {
            warn!(%job_id, %worker_id, "lease renewal rejected, job no longer owned");
        }
        Ok(renewed)
    }

    pub fn ack(&self, job_id: &str, worker_id: &str, run_id: &str) -> QueueResult<bool> {
        let acked = self
            .store
            .ack_job(job_id, worker_id, run_id, self.clock.now())?;
        if acked {
            info!(%job_id, %run_id, "job completed");
        } else {
            warn!(%job_id, %worker_id, "ack rejected, job no longer owned");
        }
        Ok(acked)
    }

    pub fn fail_retry(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        backoff_seconds: u64,
    ) -> QueueResult<bool> {
        let error = redact_credentials(error);
        let retried = self.store.fail_retry_job(
            job_id,
            worker_id,
            &error,
            backoff_seconds,
            self.clock.now(),
        )?;
        if retried {
            info!(%job_id, backoff_seconds, %error, "job scheduled for retry");
        } else {
            warn!(%job_id, %worker_id, "retry rejected, job no longer owned");
        }
        Ok(retried)
    }

    pub fn mark_dead(&self, job_id: &str, worker_id: &str, error: &str) -> QueueResult<bool> {
        let error = redact_credentials(error);
        let dead = self
            .store
            .mark_job_dead(job_id, worker_id, &error, self.clock.now())?;
        if dead {
            warn!(%job_id, %error, "job dead-lettered");
        } else {
            warn!(%job_id, %worker_id, "dead-letter rejected, job no longer owned");
        }
        Ok(dead)
    }

    pub fn requeue_without_penalty(
        &self,
        job_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> QueueResult<bool> {
        let requeued = self
            .store
            .requeue_job(job_id, worker_id, reason, self.clock.now())?;
        if requeued {
            debug!(%job_id, %reason, "job requeued without penalty");
        }
        Ok(requeued)
    }

    pub fn get(&self, job_id: &str) -> QueueResult<Option<SyncJob>> {
        Ok(self.store.get_job(job_id)?)
    }

    /// `(repo_id, job_kind)` pairs with a pending or running job.
    pub fn active_pairs(&self) -> QueueResult<HashSet<(String, JobKind)>> {
        Ok(self
            .store
            .list_active_jobs()?
            .into_iter()
            .map(|job| (job.repo_id, job.job_kind))
            .collect())
    }

    pub fn count_by_state(&self) -> QueueResult<BTreeMap<JobState, usize>> {
        Ok(self.store.count_jobs_by_state()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::Map;
    use syncgrid_core::{ManualClock, PhysicalKind, SyncMode};

    fn setup() -> (JobQueue, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap());
        let store = StateStore::open_in_memory().unwrap();
        (JobQueue::new(store, Arc::new(clock.clone())), clock)
    }

    fn new_job(repo: &str, kind: JobKind) -> NewJob {
        NewJob {
            repo_id: repo.to_string(),
            job_kind: kind,
            physical_kind: PhysicalKind::GitlabCommits,
            tenant_id: "acme".into(),
            hosting_instance: "gitlab.example".into(),
            priority: kind.base_priority(),
            mode: SyncMode::Incremental,
            payload: Map::new(),
            max_attempts: 5,
        }
    }

    #[test]
    fn active_pairs_track_lifecycle() {
        let (queue, _clock) = setup();
        queue.enqueue(new_job("r1", JobKind::Commits)).unwrap();
        queue.enqueue(new_job("r2", JobKind::Reviews)).unwrap();
        let pairs = queue.active_pairs().unwrap();
        assert!(pairs.contains(&("r1".to_string(), JobKind::Commits)));
        assert_eq!(pairs.len(), 2);

        let job = queue.claim("w1", &[JobKind::Commits], 60).unwrap().unwrap();
        assert!(queue.ack(&job.job_id, "w1", "run-1").unwrap());
        assert_eq!(queue.active_pairs().unwrap().len(), 1);
        assert_eq!(queue.count_by_state().unwrap().get(&JobState::Completed), Some(&1));
    }

    #[test]
    fn lease_is_exclusive_until_expiry() {
        let (queue, clock) = setup();
        queue.enqueue(new_job("r1", JobKind::Commits)).unwrap();
        let job = queue.claim("a", &[], 60).unwrap().unwrap();

        assert!(!queue.renew_lease(&job.job_id, "b", 60).unwrap());
        assert!(!queue.ack(&job.job_id, "b", "run").unwrap());
        assert!(queue.claim("b", &[], 60).unwrap().is_none());

        clock.advance_secs(30);
        assert!(queue.renew_lease(&job.job_id, "a", 60).unwrap());
        clock.advance_secs(61);
        let stolen = queue.claim("b", &[], 60).unwrap().unwrap();
        assert_eq!(stolen.job_id, job.job_id);
        assert!(!queue.ack(&job.job_id, "a", "run").unwrap());
        assert!(queue.ack(&job.job_id, "b", "run").unwrap());
    }

    #[test]
    fn retry_error_is_redacted() {
        let (queue, clock) = setup();
        queue.enqueue(new_job("r1", JobKind::Commits)).unwrap();
        let job = queue.claim("w1", &[], 60).unwrap().unwrap();
        assert!(
            queue
                .fail_retry(&job.job_id, "w1", "403 for glpat-abcdefghijkl", 30)
                .unwrap()
        );
        let stored = queue.get(&job.job_id).unwrap().unwrap();
        let error = stored.last_error.unwrap();
        assert!(!error.contains("glpat-abcdefghijkl"));
        assert_eq!(stored.attempt_count, 1);

        assert!(queue.claim("w1", &[], 60).unwrap().is_none());
        clock.advance_secs(30);
        assert!(queue.claim("w1", &[], 60).unwrap().is_some());
    }

    #[test]
    fn requeue_and_dead() {
        let (queue, _clock) = setup();
        queue.enqueue(new_job("r1", JobKind::Commits)).unwrap();
        let job = queue.claim("w1", &[], 60).unwrap().unwrap();
        assert!(queue.requeue_without_penalty(&job.job_id, "w1", "lock_held").unwrap());
        let job = queue.claim("w1", &[], 60).unwrap().unwrap();
        assert_eq!(job.attempt_count, 0);
        assert!(queue.mark_dead(&job.job_id, "w1", "404 repository gone").unwrap());
        assert!(queue.claim("w1", &[], 60).unwrap().is_none());
        assert!(queue.active_pairs().unwrap().is_empty());
    }
}
