//! Job queue rows: enqueue, claim and the lease-conditional transitions.
//!
//! Every mutation runs in a single write transaction, so the check and the
//! update are atomic with respect to other workers sharing the database.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use redb::{ReadableDatabase, ReadableTable};
use tracing::{debug, info};
use uuid::Uuid;

use syncgrid_core::{JobKind, JobState};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, read_all, read_row, write_row};
use crate::tables::*;
use crate::types::*;

/// Longest delay a retry can be pushed out by.
const MAX_BACKOFF_SECONDS: u64 = 30 * 24 * 3600;

/// Pending and running jobs, reached through the unique-active index so the
/// cost tracks live pairs rather than job history.
fn read_active<A, J>(active: &A, jobs: &J) -> StateResult<Vec<SyncJob>>
where
    A: ReadableTable<&'static str, &'static str>,
    J: ReadableTable<&'static str, &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in active.iter().map_err(map_err!(Read))? {
        let (_, job_id) = entry.map_err(map_err!(Read))?;
        let job: Option<SyncJob> = read_row(jobs, job_id.value())?;
        out.extend(job.filter(|j| j.state.is_active()));
    }
    Ok(out)
}

impl StateStore {
    /// Insert a pending job unless its pair already has an active one.
    pub fn enqueue_job(&self, new_job: NewJob, now: DateTime<Utc>) -> StateResult<EnqueueOutcome> {
        let pair = pair_key(&new_job.repo_id, new_job.job_kind);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;

            let holder = active
                .get(pair.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());

            let live_holder = match holder {
                Some(job_id) => {
                    let job: Option<SyncJob> = read_row(&jobs, &job_id)?;
                    job.filter(|j| j.state.is_active()).map(|j| j.job_id)
                }
                None => None,
            };

            outcome = match live_holder {
                Some(job_id) => EnqueueOutcome::AlreadyActive { job_id },
                None => {
                    let job = new_job.into_job(Uuid::new_v4().to_string(), now);
                    write_row(&mut jobs, &job.job_id, &job)?;
                    active
                        .insert(pair.as_str(), job.job_id.as_str())
                        .map_err(map_err!(Write))?;
                    EnqueueOutcome::Inserted(job)
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if let EnqueueOutcome::Inserted(job) = &outcome {
            debug!(job_id = %job.job_id, %pair, mode = %job.mode, "job enqueued");
        }
        Ok(outcome)
    }

    pub fn get_job(&self, job_id: &str) -> StateResult<Option<SyncJob>> {
        self.get_json(JOBS, job_id)
    }

    pub fn list_jobs(&self) -> StateResult<Vec<SyncJob>> {
        self.list_json(JOBS)
    }

    /// Pending and running jobs.
    pub fn list_active_jobs(&self) -> StateResult<Vec<SyncJob>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;
        let jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
        read_active(&active, &jobs)
    }

    pub fn count_jobs_by_state(&self) -> StateResult<BTreeMap<JobState, usize>> {
        let mut counts = BTreeMap::new();
        for job in self.list_jobs()? {
            *counts.entry(job.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Claim the best eligible job for `worker_id`.
    ///
    /// Eligible means pending and due, or running with a lapsed lease. The
    /// order is highest priority, then earliest `available_at`, then job id.
    /// Reclaiming a lapsed lease counts as a failed attempt; a job whose
    /// attempts are exhausted that way is dead-lettered instead of claimed.
    /// An empty `job_kinds` slice accepts every kind.
    pub fn claim_job(
        &self,
        worker_id: &str,
        job_kinds: &[JobKind],
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StateResult<Option<SyncJob>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed;
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;

            let mut candidates: Vec<SyncJob> = read_active(&active, &jobs)?
                .into_iter()
                .filter(|j| job_kinds.is_empty() || job_kinds.contains(&j.job_kind))
                .filter(|j| j.is_claimable(now))
                .collect();
            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.available_at.cmp(&b.available_at))
                    .then_with(|| a.job_id.cmp(&b.job_id))
            });

            let mut picked = None;
            for mut job in candidates {
                if job.state == JobState::Running {
                    job.attempt_count = job.attempt_count.saturating_add(1);
                    job.last_error = Some(format!(
                        "lease held by {} expired",
                        job.lease_owner.as_deref().unwrap_or("unknown")
                    ));
                    if job.attempt_count >= job.max_attempts {
                        job.state = JobState::Dead;
                        job.clear_lease();
                        job.updated_at = now;
                        write_row(&mut jobs, &job.job_id, &job)?;
                        active
                            .remove(job.pair_key().as_str())
                            .map_err(map_err!(Write))?;
                        info!(job_id = %job.job_id, "lapsed job exhausted its attempts, dead-lettered");
                        continue;
                    }
                }
                job.state = JobState::Running;
                job.lease_owner = Some(worker_id.to_string());
                job.lease_expires_at = Some(now + TimeDelta::seconds(lease_seconds));
                job.updated_at = now;
                write_row(&mut jobs, &job.job_id, &job)?;
                picked = Some(job);
                break;
            }
            claimed = picked;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if let Some(job) = &claimed {
            debug!(job_id = %job.job_id, %worker_id, attempt = job.attempt_count, "job claimed");
        }
        Ok(claimed)
    }

    /// Apply `update` to a job only if `worker_id` holds its lease.
    fn update_owned_job<F>(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        update: F,
    ) -> StateResult<bool>
    where
        F: FnOnce(&mut SyncJob),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let applied;
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;
            let job: Option<SyncJob> = read_row(&jobs, job_id)?;
            applied = match job {
                Some(mut job) if job.is_owned_by(worker_id) => {
                    update(&mut job);
                    job.updated_at = now;
                    write_row(&mut jobs, job_id, &job)?;
                    if !job.state.is_active() {
                        let pair = job.pair_key();
                        let holds_slot = active
                            .get(pair.as_str())
                            .map_err(map_err!(Read))?
                            .is_some_and(|g| g.value() == job_id);
                        if holds_slot {
                            active.remove(pair.as_str()).map_err(map_err!(Write))?;
                        }
                    }
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(applied)
    }

    /// Extend the lease. Fails if another worker now owns the job.
    pub fn renew_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        self.update_owned_job(job_id, worker_id, now, |job| {
            job.lease_expires_at = Some(now + TimeDelta::seconds(lease_seconds));
        })
    }

    /// Mark a job completed and record the run that finished it.
    pub fn ack_job(
        &self,
        job_id: &str,
        worker_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        self.update_owned_job(job_id, worker_id, now, |job| {
            job.state = JobState::Completed;
            job.last_run_id = Some(run_id.to_string());
            job.last_error = None;
            job.clear_lease();
        })
    }

    /// Return a job to pending after `backoff_seconds`, counting an attempt.
    pub fn fail_retry_job(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        backoff_seconds: u64,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        let backoff = TimeDelta::seconds(backoff_seconds.min(MAX_BACKOFF_SECONDS) as i64);
        self.update_owned_job(job_id, worker_id, now, |job| {
            job.state = JobState::Pending;
            job.attempt_count = job.attempt_count.saturating_add(1);
            job.available_at = now + backoff;
            job.last_error = Some(error.to_string());
            job.clear_lease();
        })
    }

    /// Dead-letter a job.
    pub fn mark_job_dead(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        self.update_owned_job(job_id, worker_id, now, |job| {
            job.state = JobState::Dead;
            job.attempt_count = job.attempt_count.saturating_add(1);
            job.last_error = Some(error.to_string());
            job.clear_lease();
        })
    }

    /// Return a job to pending immediately without counting an attempt.
    pub fn requeue_job(
        &self,
        job_id: &str,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        self.update_owned_job(job_id, worker_id, now, |job| {
            job.state = JobState::Pending;
            job.available_at = now;
            job.last_error = Some(reason.to_string());
            job.clear_lease();
        })
    }

    /// Return running jobs whose lease lapsed to pending, counting an
    /// attempt, or dead-letter them when attempts are exhausted.
    ///
    /// With `dry_run` nothing is written; the report lists what would happen.
    pub fn reclaim_expired_jobs(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> StateResult<Vec<ReclaimedJob>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut reclaimed = Vec::new();
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;
            let expired: Vec<SyncJob> = read_active(&active, &jobs)?
                .into_iter()
                .filter(|j| j.state == JobState::Running && j.lease_expired(now))
                .collect();

            for mut job in expired {
                let previous_owner = job.lease_owner.clone();
                job.attempt_count = job.attempt_count.saturating_add(1);
                job.last_error = Some(format!(
                    "lease held by {} expired",
                    previous_owner.as_deref().unwrap_or("unknown")
                ));
                job.clear_lease();
                job.updated_at = now;
                let action = if job.attempt_count >= job.max_attempts {
                    job.state = JobState::Dead;
                    ReclaimAction::Dead
                } else {
                    job.state = JobState::Pending;
                    job.available_at = now;
                    ReclaimAction::Requeued
                };

                if !dry_run {
                    write_row(&mut jobs, &job.job_id, &job)?;
                    if action == ReclaimAction::Dead {
                        active
                            .remove(job.pair_key().as_str())
                            .map_err(map_err!(Write))?;
                    }
                }
                reclaimed.push(ReclaimedJob {
                    job_id: job.job_id,
                    repo_id: job.repo_id,
                    job_kind: job.job_kind,
                    previous_owner,
                    action,
                });
            }
        }
        if dry_run {
            txn.abort().map_err(map_err!(Transaction))?;
        } else {
            txn.commit().map_err(map_err!(Transaction))?;
        }
        Ok(reclaimed)
    }

    /// Delete completed and dead jobs last touched before `before`.
    pub fn prune_finished_jobs(&self, before: DateTime<Utc>, dry_run: bool) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stale: Vec<String>;
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            stale = read_all::<SyncJob, _>(&jobs)?
                .into_iter()
                .filter(|j| !j.state.is_active() && j.updated_at < before)
                .map(|j| j.job_id)
                .collect();
            if !dry_run {
                for job_id in &stale {
                    jobs.remove(job_id.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        if dry_run {
            txn.abort().map_err(map_err!(Transaction))?;
        } else {
            txn.commit().map_err(map_err!(Transaction))?;
        }
        Ok(stale.len())
    }

    /// Consistency check used by tests and `status`: every index entry
    /// points at an active job of the same pair.
    pub fn verify_active_index(&self) -> StateResult<()> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let active = txn.open_table(ACTIVE_JOBS).map_err(map_err!(Table))?;
        let jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
        for entry in active.iter().map_err(map_err!(Read))? {
            let (pair, job_id) = entry.map_err(map_err!(Read))?;
            let job: Option<SyncJob> = read_row(&jobs, job_id.value())?;
            match job {
                Some(job) if job.state.is_active() && job.pair_key() == pair.value() => {}
                _ => {
                    return Err(StateError::Invalid(format!(
                        "active index {} points at {}",
                        pair.value(),
                        job_id.value()
                    )));
                }
            }
        }
        Ok(())
    }
}
