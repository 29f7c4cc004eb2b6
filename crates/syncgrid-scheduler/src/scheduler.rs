//! Scheduler tick: gather a snapshot from the store, select, build, enqueue.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use syncgrid_breaker::{BreakerRefresher, BreakerSnapshot};
use syncgrid_core::config::{RepositoryConfig, SchedulerConfig};
use syncgrid_core::{JobKind, SharedClock, SyncGridConfig, SyncMode};
use syncgrid_queue::JobQueue;
use syncgrid_state::{EnqueueOutcome, PauseRecord, Repository, StateStore, hour_bucket};

use crate::build::build_jobs_to_insert;
use crate::error::SchedulerResult;
use crate::select::{SkippedJob, select_jobs_to_enqueue};
use crate::snapshot::{RepoSyncState, SchedulerSnapshot};

/// One job the tick enqueued (or would enqueue in a dry run).
#[derive(Debug, Clone, Serialize)]
pub struct PlannedSummary {
    pub repo_id: String,
    pub job_kind: JobKind,
    pub mode: SyncMode,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueFailure {
    pub repo_id: String,
    pub job_kind: JobKind,
    pub error: String,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub dry_run: bool,
    pub repositories: usize,
    pub planned: Vec<PlannedSummary>,
    pub enqueued: usize,
    /// Jobs that lost the race against a concurrent enqueue of the same pair.
    pub already_active: usize,
    pub skipped: Vec<SkippedJob>,
    pub tenant_paused_count: usize,
    pub instance_paused_count: usize,
    pub breaker_transitions: usize,
    pub errors: Vec<EnqueueFailure>,
}

impl TickReport {
    /// Skip counts by reason name.
    pub fn skip_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for skipped in &self.skipped {
            let name = serde_json::to_value(&skipped.reason)
                .ok()
                .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            *counts.entry(name).or_default() += 1;
        }
        counts
    }
}

pub struct Scheduler {
    store: StateStore,
    queue: JobQueue,
    refresher: BreakerRefresher,
    config: SchedulerConfig,
    repositories: Vec<RepositoryConfig>,
    clock: SharedClock,
}

impl Scheduler {
    pub fn new(store: StateStore, clock: SharedClock, config: &SyncGridConfig) -> Self {
        Self {
            queue: JobQueue::new(store.clone(), clock.clone()),
            refresher: BreakerRefresher::new(store.clone(), config.breaker.clone()),
            store,
            config: config.scheduler.clone(),
            repositories: config.repositories.clone(),
            clock,
        }
    }

    /// Upsert configured repositories and return the enabled ones. In a dry
    /// run the configured rows are overlaid in memory instead of written.
    fn load_repositories(&self, now: DateTime<Utc>, dry_run: bool) -> SchedulerResult<Vec<Repository>> {
        let configured: Vec<Repository> = self
            .repositories
            .iter()
            .map(|r| Repository::from_config(r, now))
            .collect();
        if !dry_run && !configured.is_empty() {
            let inserted = self.store.sync_repositories(&configured)?;
            if inserted > 0 {
                info!(inserted, "registered new repositories");
            }
        }

        let mut by_id: BTreeMap<String, Repository> = self
            .store
            .list_repositories()?
            .into_iter()
            .map(|r| (r.repo_id.clone(), r))
            .collect();
        if dry_run {
            for repo in configured {
                let created_at = by_id
                    .get(&repo.repo_id)
                    .map_or(repo.created_at, |r| r.created_at);
                by_id.insert(repo.repo_id.clone(), Repository { created_at, ..repo });
            }
        }
        Ok(by_id.into_values().filter(|r| r.enabled).collect())
    }

    /// Read everything a tick decides on.
    pub fn load_snapshot(
        &self,
        now: DateTime<Utc>,
        repositories: &[Repository],
        breakers: BreakerSnapshot,
    ) -> SchedulerResult<SchedulerSnapshot> {
        let mut snapshot = SchedulerSnapshot::new(now, self.config.clone());
        snapshot.breakers = breakers;

        let mut states: BTreeMap<String, RepoSyncState> = repositories
            .iter()
            .map(|r| (r.repo_id.clone(), RepoSyncState::new(r)))
            .collect();

        for cursor in self.store.list_cursors()? {
            if let Some(state) = states.get_mut(&cursor.repo_id) {
                state.kinds.entry(cursor.job_kind).or_default().cursor_updated_at =
                    Some(cursor.updated_at);
            }
        }

        let since = now - TimeDelta::minutes(self.config.health_window_minutes);
        let mut runs_by_repo: HashMap<String, Vec<_>> = HashMap::new();
        for run in self.store.list_runs_since(since)? {
            runs_by_repo.entry(run.repo_id.clone()).or_default().push(run);
        }
        for (repo_id, runs) in &runs_by_repo {
            if let Some(state) = states.get_mut(repo_id) {
                state.absorb_runs(runs);
            }
        }

        for job in self.store.list_active_jobs()? {
            snapshot.active.add(&job.tenant_id, &job.hosting_instance);
            if let Some(state) = states.get_mut(&job.repo_id) {
                state.queued_kinds.insert(job.job_kind);
            }
        }

        snapshot.pauses = self
            .store
            .list_pauses()?
            .into_iter()
            .filter(|p| p.is_active(now))
            .collect();
        snapshot.buckets = self
            .store
            .list_buckets()?
            .into_iter()
            .map(|b| (b.hosting_instance.clone(), b))
            .collect();

        let prefix = PauseRecord::instance_scope("");
        for counter in self.store.list_budget_for_hour(&hour_bucket(now))? {
            if let Some(instance) = counter.scope.strip_prefix(&prefix) {
                snapshot
                    .enqueued_this_hour
                    .insert(instance.to_string(), counter.enqueued);
            }
        }

        snapshot.repos = states.into_values().collect();
        Ok(snapshot)
    }

    /// Run one tick. With `dry_run` the planned jobs are reported but
    /// nothing is written.
    pub fn tick(&self, dry_run: bool) -> SchedulerResult<TickReport> {
        let now = self.clock.now();
        let repositories = self.load_repositories(now, dry_run)?;
        let breakers = self.refresher.refresh(now, dry_run)?;
        let breaker_transitions = breakers.transitions;
        let snapshot = self.load_snapshot(now, &repositories, breakers)?;

        let selection = select_jobs_to_enqueue(&snapshot);
        let built = build_jobs_to_insert(&snapshot, &selection.candidates);

        let mut report = TickReport {
            dry_run,
            repositories: repositories.len(),
            tenant_paused_count: built.tenant_paused_count,
            instance_paused_count: built.instance_paused_count,
            breaker_transitions,
            ..TickReport::default()
        };
        report.skipped = selection.skipped;
        report.skipped.extend(built.skipped_jobs);

        let hour = hour_bucket(now);
        let mut probes: BTreeMap<String, u32> = BTreeMap::new();
        for planned in built.jobs {
            let job = planned.job;
            report.planned.push(PlannedSummary {
                repo_id: job.repo_id.clone(),
                job_kind: job.job_kind,
                mode: job.mode,
                priority: job.priority,
            });
            if dry_run {
                continue;
            }

            let repo_id = job.repo_id.clone();
            let job_kind = job.job_kind;
            let budget_scope = PauseRecord::instance_scope(&job.hosting_instance);
            match self.queue.enqueue(job) {
                Ok(EnqueueOutcome::Inserted(job)) => {
                    report.enqueued += 1;
                    debug!(job_id = %job.job_id, %repo_id, %job_kind, mode = %job.mode, "job enqueued");
                    if let Err(e) = self.store.increment_budget(&budget_scope, &hour, 1) {
                        warn!(%repo_id, error = %e, "failed to bump enqueue budget");
                    }
                    for key in planned.probe_keys {
                        *probes.entry(key).or_default() += 1;
                    }
                }
                Ok(EnqueueOutcome::AlreadyActive { .. }) => report.already_active += 1,
                Err(e) => {
                    error!(%repo_id, %job_kind, error = %e, "enqueue failed");
                    report.errors.push(EnqueueFailure {
                        repo_id,
                        job_kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !dry_run {
            for (key, issued) in probes {
                if let Err(e) = self.store.record_probes_issued(&key, issued) {
                    warn!(%key, error = %e, "failed to record probes issued");
                }
            }
            self.store.prune_budget(&hour)?;
        }

        info!(
            dry_run,
            repositories = report.repositories,
            planned = report.planned.len(),
            enqueued = report.enqueued,
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "scheduler tick complete"
        );
        Ok(report)
    }

    /// Tick every `interval` until `shutdown` flips. Ticks never overlap: a
    /// tick that overruns delays the next one.
    pub async fn run(&self, interval: Duration, dry_run: bool, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), dry_run, "scheduler loop starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(dry_run) {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("scheduler loop shutting down");
                    break;
                }
            }
        }
    }
}
