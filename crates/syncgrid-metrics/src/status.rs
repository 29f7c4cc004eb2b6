//! Point-in-time status of the queue and its surroundings.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;

use syncgrid_core::{JobKind, JobState, RunStatus};
use syncgrid_state::{BreakerState, PauseRecord, StateResult, StateStore};

const JOB_STATES: [JobState; 4] = [
    JobState::Pending,
    JobState::Running,
    JobState::Completed,
    JobState::Dead,
];

/// Runs finished (or started) inside the report window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Failed runs by error category.
    pub failures_by_category: BTreeMap<String, usize>,
    pub records_fetched: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    /// Mean wall time of finished runs.
    pub mean_duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub rate_limited_count: u32,
    pub probes_issued: u32,
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockView {
    pub repo_id: String,
    pub job_kind: JobKind,
    pub holder_worker_id: String,
    /// Negative once the lease lapsed and the reaper has not run yet.
    pub expires_in_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketView {
    pub hosting_instance: String,
    pub limit: u64,
    pub remaining: u64,
    pub reset_in_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorLag {
    pub repo_id: String,
    pub job_kind: JobKind,
    /// Seconds between now and the watermark timestamp.
    pub lag_seconds: i64,
    pub updated_at: DateTime<Utc>,
}

/// Everything `syncd status` shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub window_minutes: i64,
    pub repositories: usize,
    pub enabled_repositories: usize,
    /// Job counts by state; every state is present.
    pub jobs: BTreeMap<String, usize>,
    pub runs: RunSummary,
    /// Runs still marked running.
    pub running_runs: usize,
    pub breakers: Vec<BreakerStatus>,
    pub locks: Vec<LockView>,
    pub buckets: Vec<BucketView>,
    pub active_pauses: Vec<PauseRecord>,
    pub cursors: Vec<CursorLag>,
}

impl StatusReport {
    /// Read the store. Runs are summarised over the last `window_minutes`.
    pub fn collect(store: &StateStore, now: DateTime<Utc>, window_minutes: i64) -> StateResult<Self> {
        let counts = store.count_jobs_by_state()?;
        let jobs = JOB_STATES
            .iter()
            .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
            .collect();

        let repositories = store.list_repositories()?;
        let since = now - TimeDelta::minutes(window_minutes.max(0));
        let runs = store.list_runs_since(since)?;

        let mut summary = RunSummary::default();
        let mut duration_total = 0.0;
        let mut finished = 0usize;
        for run in &runs {
            summary.total += 1;
            *summary
                .by_status
                .entry(run.status.as_str().to_string())
                .or_default() += 1;
            if run.status == RunStatus::Failed {
                let category = run
                    .error_category
                    .map_or("unknown", |c| c.as_str())
                    .to_string();
                *summary.failures_by_category.entry(category).or_default() += 1;
            }
            summary.records_fetched += run.counts.fetched;
            summary.records_inserted += run.counts.inserted;
            summary.records_updated += run.counts.updated;
            if let Some(duration) = run.duration() {
                duration_total += duration.num_milliseconds() as f64 / 1000.0;
                finished += 1;
            }
        }
        if finished > 0 {
            summary.mean_duration_seconds = Some(duration_total / finished as f64);
        }

        let breakers = store
            .list_breakers()?
            .into_iter()
            .map(|b| BreakerStatus {
                key: b.key,
                state: b.state,
                failure_count: b.failure_count,
                success_count: b.success_count,
                rate_limited_count: b.rate_limited_count,
                probes_issued: b.probes_issued,
                last_transition_at: b.last_transition_at,
            })
            .collect();

        let locks = store
            .list_locks()?
            .into_iter()
            .map(|l| LockView {
                expires_in_seconds: (l.lease_expires_at - now).num_seconds(),
                repo_id: l.repo_id,
                job_kind: l.job_kind,
                holder_worker_id: l.holder_worker_id,
            })
            .collect();

        let buckets = store
            .list_buckets()?
            .into_iter()
            .map(|b| BucketView {
                reset_in_seconds: b.seconds_until_reset(now),
                hosting_instance: b.hosting_instance,
                limit: b.limit,
                remaining: b.remaining,
            })
            .collect();

        let active_pauses = store
            .list_pauses()?
            .into_iter()
            .filter(|p| p.is_active(now))
            .collect();

        let mut cursors: Vec<CursorLag> = store
            .list_cursors()?
            .into_iter()
            .map(|c| CursorLag {
                lag_seconds: (now - c.watermark.timestamp).num_seconds().max(0),
                repo_id: c.repo_id,
                job_kind: c.job_kind,
                updated_at: c.updated_at,
            })
            .collect();
        cursors.sort_by(|a, b| b.lag_seconds.cmp(&a.lag_seconds).then(a.repo_id.cmp(&b.repo_id)));

        let report = Self {
            generated_at: now,
            window_minutes,
            enabled_repositories: repositories.iter().filter(|r| r.enabled).count(),
            repositories: repositories.len(),
            jobs,
            runs: summary,
            running_runs: store.list_running_runs()?.len(),
            breakers,
            locks,
            buckets,
            active_pauses,
            cursors,
        };
        debug!(
            runs = report.runs.total,
            breakers = report.breakers.len(),
            locks = report.locks.len(),
            "status collected"
        );
        Ok(report)
    }

    pub fn job_count(&self, state: JobState) -> usize {
        self.jobs.get(state.as_str()).copied().unwrap_or(0)
    }

    /// Breakers not closed.
    pub fn tripped_breakers(&self) -> impl Iterator<Item = &BreakerStatus> {
        self.breakers.iter().filter(|b| b.state != BreakerState::Closed)
    }
}
