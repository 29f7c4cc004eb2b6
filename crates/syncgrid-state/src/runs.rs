//! Sync run records.
//!
//! A run is inserted as `running` and finalized exactly once; the finish is
//! conditional on the stored status still being `running`.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use syncgrid_core::RunStatus;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, read_all, read_row, write_row};
use crate::tables::*;
use crate::types::*;

impl StateStore {
    /// Insert a new run. Fails if the id is already taken.
    pub fn insert_run(&self, run: &SyncRun) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let existing: Option<SyncRun> = read_row(&table, &run.run_id)?;
            if existing.is_some() {
                return Err(StateError::Invalid(format!("run {} already exists", run.run_id)));
            }
            write_row(&mut table, &run.run_id, run)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(run_id = %run.run_id, job_id = %run.job_id, "run started");
        Ok(())
    }

    /// Finalize a run. Returns `false` if it was already finalized.
    pub fn finish_run(
        &self,
        run_id: &str,
        finish: &RunFinish,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        finish.validate().map_err(StateError::Invalid)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let finished;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let current: Option<SyncRun> = read_row(&table, run_id)?;
            finished = match current {
                None => return Err(StateError::NotFound(format!("run {run_id}"))),
                Some(run) if run.status != RunStatus::Running => false,
                Some(mut run) => {
                    run.status = finish.status;
                    run.cursor_after = finish.cursor_after.clone();
                    run.counts = finish.counts;
                    run.error_summary = finish.error_summary.clone();
                    run.error_category = finish.error_category;
                    run.degradation_info = finish.degradation_info.clone();
                    run.finished_at = Some(now);
                    write_row(&mut table, run_id, &run)?;
                    true
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if finished {
            debug!(%run_id, status = %finish.status, "run finished");
        } else {
            warn!(%run_id, "run already finalized, finish ignored");
        }
        Ok(finished)
    }

    pub fn get_run(&self, run_id: &str) -> StateResult<Option<SyncRun>> {
        self.get_json(RUNS, run_id)
    }

    /// Runs started at or after `since`, newest first.
    pub fn list_runs_since(&self, since: DateTime<Utc>) -> StateResult<Vec<SyncRun>> {
        let mut runs: Vec<SyncRun> = self
            .list_json::<SyncRun>(RUNS)?
            .into_iter()
            .filter(|r| r.started_at >= since)
            .collect();
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs)
    }

    pub fn list_running_runs(&self) -> StateResult<Vec<SyncRun>> {
        Ok(self
            .list_json::<SyncRun>(RUNS)?
            .into_iter()
            .filter(|r| r.status == RunStatus::Running)
            .collect())
    }

    /// Delete finalized runs that finished before `before`.
    pub fn prune_finished_runs(&self, before: DateTime<Utc>, dry_run: bool) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stale: Vec<String>;
        {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            stale = read_all::<SyncRun, _>(&runs)?
                .into_iter()
                .filter(|r| r.status != RunStatus::Running)
                .filter(|r| r.finished_at.is_some_and(|at| at < before))
                .map(|r| r.run_id)
                .collect();
            if !dry_run {
                for run_id in &stale {
                    runs.remove(run_id.as_str()).map_err(map_err!(Write))?;
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

    /// Finalize `running` runs whose job is no longer leased by the run's
    /// worker. With `dry_run` nothing is written.
    pub fn finalize_orphaned_runs(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> StateResult<Vec<SyncRun>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut orphaned = Vec::new();
        {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let running: Vec<SyncRun> = read_all::<SyncRun, _>(&runs)?
                .into_iter()
                .filter(|r| r.status == RunStatus::Running)
                .collect();

            for mut run in running {
                let job: Option<SyncJob> = read_row(&jobs, &run.job_id)?;
                let still_owned =
                    job.is_some_and(|j| j.is_owned_by(&run.worker_id) && !j.lease_expired(now));
                if still_owned {
                    continue;
                }
                run.status = RunStatus::Failed;
                run.error_summary = Some("lease expired before the run was finalized".into());
                run.error_category = Some(syncgrid_core::ErrorCategory::LeaseLost);
                run.finished_at = Some(now);
                if !dry_run {
                    write_row(&mut runs, &run.run_id, &run)?;
                }
                orphaned.push(run);
            }
        }
        if dry_run {
            txn.abort().map_err(map_err!(Transaction))?;
        } else {
            txn.commit().map_err(map_err!(Transaction))?;
        }
        Ok(orphaned)
    }
}
