//! Lease reaper: reclaims work abandoned by crashed or partitioned workers.

use std::time::Duration;

use chrono::TimeDelta;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use syncgrid_core::SharedClock;
use syncgrid_state::{Lock, ReclaimAction, ReclaimedJob, StateStore};

use crate::error::QueueResult;

/// What one reaper pass did (or, in dry-run mode, would do).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    pub dry_run: bool,
    pub reclaimed_jobs: Vec<ReclaimedJob>,
    pub expired_locks: Vec<Lock>,
    pub orphaned_runs: Vec<String>,
    /// Finished jobs and runs deleted by the retention sweep.
    pub pruned_jobs: usize,
    pub pruned_runs: usize,
}

impl ReapReport {
    pub fn requeued(&self) -> usize {
        self.reclaimed_jobs
            .iter()
            .filter(|j| j.action == ReclaimAction::Requeued)
            .count()
    }

    pub fn dead(&self) -> usize {
        self.reclaimed_jobs
            .iter()
            .filter(|j| j.action == ReclaimAction::Dead)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.reclaimed_jobs.is_empty()
            && self.expired_locks.is_empty()
            && self.orphaned_runs.is_empty()
            && self.pruned_jobs == 0
            && self.pruned_runs == 0
    }
}

#[derive(Clone, Debug)]
pub struct Reaper {
    store: StateStore,
    clock: SharedClock,
    retention: Option<TimeDelta>,
}

impl Reaper {
    pub fn new(store: StateStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            retention: None,
        }
    }

    /// Also delete completed/dead jobs and finished runs older than
    /// `retention` on every pass. `None` keeps history forever.
    pub fn with_retention(mut self, retention: Option<TimeDelta>) -> Self {
        self.retention = retention;
        self
    }

    /// One pass: lapsed job leases, then expired locks, then runs left
    /// `running` by workers that no longer hold their job.
    pub fn run_once(&self, dry_run: bool) -> QueueResult<ReapReport> {
        let now = self.clock.now();
        let reclaimed_jobs = self.store.reclaim_expired_jobs(now, dry_run)?;
        let expired_locks = self.store.remove_expired_locks(now, dry_run)?;
        let orphaned_runs = self
            .store
            .finalize_orphaned_runs(now, dry_run)?
            .into_iter()
            .map(|r| r.run_id)
            .collect();

        let (pruned_jobs, pruned_runs) = match self.retention {
            Some(retention) => {
                let before = now - retention;
                (
                    self.store.prune_finished_jobs(before, dry_run)?,
                    self.store.prune_finished_runs(before, dry_run)?,
                )
            }
            None => (0, 0),
        };

        let report = ReapReport {
            dry_run,
            reclaimed_jobs,
            expired_locks,
            orphaned_runs,
            pruned_jobs,
            pruned_runs,
        };
        if report.is_empty() {
            debug!(dry_run, "reaper pass found nothing");
        } else {
            info!(
                dry_run,
                requeued = report.requeued(),
                dead = report.dead(),
                locks = report.expired_locks.len(),
                runs = report.orphaned_runs.len(),
                pruned_jobs,
                pruned_runs,
                "reaper pass complete"
            );
        }
        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, dry_run: bool, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), dry_run, "reaper loop starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(dry_run) {
                        error!(error = %e, "reaper pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("reaper loop shutting down");
                    break;
                }
            }
        }
    }
}
