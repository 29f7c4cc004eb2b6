//! Point-in-time view of everything the scheduler decides on.
//!
//! A snapshot is built from the store once per tick and then handed to the
//! pure selection and build functions, so those can be tested by
//! constructing snapshots directly.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use syncgrid_breaker::BreakerSnapshot;
use syncgrid_core::config::SchedulerConfig;
use syncgrid_core::{ErrorClass, JobKind, RepoType, RunStatus};
use syncgrid_state::{BucketStatus, PauseRecord, Repository, SyncRun};

/// Per-kind sync history of one repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindSyncState {
    /// When the cursor last moved; `None` if the pair was never synced.
    pub cursor_updated_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Failed runs since the last success, newest first.
    pub consecutive_failures: u32,
}

/// Scheduling view of one repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoSyncState {
    pub repo_id: String,
    pub repo_type: RepoType,
    pub hosting_instance: String,
    pub tenant_id: String,
    pub kinds: BTreeMap<JobKind, KindSyncState>,
    /// Finished runs within the health window.
    pub recent_runs: u32,
    pub recent_failures: u32,
    pub recent_rate_limited: u32,
    /// Kinds with a pending or running job.
    pub queued_kinds: BTreeSet<JobKind>,
}

impl RepoSyncState {
    pub fn new(repo: &Repository) -> Self {
        Self {
            repo_id: repo.repo_id.clone(),
            repo_type: repo.repo_type,
            hosting_instance: repo.hosting_instance.clone(),
            tenant_id: repo.tenant_id.clone(),
            kinds: BTreeMap::new(),
            recent_runs: 0,
            recent_failures: 0,
            recent_rate_limited: 0,
            queued_kinds: BTreeSet::new(),
        }
    }

    pub fn queued(&self) -> bool {
        !self.queued_kinds.is_empty()
    }

    pub fn kind(&self, kind: JobKind) -> KindSyncState {
        self.kinds.get(&kind).cloned().unwrap_or_default()
    }

    pub fn failure_rate(&self) -> f64 {
        rate(self.recent_failures, self.recent_runs)
    }

    pub fn rate_limit_rate(&self) -> f64 {
        rate(self.recent_rate_limited, self.recent_runs)
    }

    /// Fold this repository's runs (newest first) into its counters.
    pub fn absorb_runs<'a>(&mut self, runs: impl IntoIterator<Item = &'a SyncRun>) {
        let mut streak_closed: BTreeSet<JobKind> = BTreeSet::new();
        for run in runs {
            let entry = self.kinds.entry(run.job_kind).or_default();
            if entry.last_run_at.is_none_or(|at| run.started_at > at) {
                entry.last_run_at = Some(run.started_at);
            }
            if run.status == RunStatus::Running {
                continue;
            }
            self.recent_runs += 1;

            let class = run.error_category.map(|c| c.class());
            let failed = match (run.status, class) {
                (RunStatus::Failed, Some(ErrorClass::Ignorable)) => false,
                (RunStatus::Failed, Some(ErrorClass::RateLimited)) => {
                    self.recent_rate_limited += 1;
                    true
                }
                (RunStatus::Failed, _) => {
                    self.recent_failures += 1;
                    true
                }
                _ => false,
            };

            if streak_closed.contains(&run.job_kind) {
                continue;
            }
            if failed {
                entry.consecutive_failures += 1;
            } else if run.status != RunStatus::Failed {
                streak_closed.insert(run.job_kind);
            }
        }
    }
}

fn rate(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Pending and running jobs per scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActiveCounts {
    pub global: usize,
    pub per_tenant: HashMap<String, usize>,
    pub per_instance: HashMap<String, usize>,
}

impl ActiveCounts {
    pub fn add(&mut self, tenant_id: &str, hosting_instance: &str) {
        self.global += 1;
        *self.per_tenant.entry(tenant_id.to_string()).or_default() += 1;
        *self.per_instance.entry(hosting_instance.to_string()).or_default() += 1;
    }

    pub fn tenant(&self, tenant_id: &str) -> usize {
        self.per_tenant.get(tenant_id).copied().unwrap_or(0)
    }

    pub fn instance(&self, hosting_instance: &str) -> usize {
        self.per_instance.get(hosting_instance).copied().unwrap_or(0)
    }
}

/// Everything one tick decides on.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub now: DateTime<Utc>,
    pub config: SchedulerConfig,
    /// Enabled repositories, ordered by id.
    pub repos: Vec<RepoSyncState>,
    pub breakers: BreakerSnapshot,
    pub pauses: Vec<PauseRecord>,
    /// Last observed bucket per hosting instance.
    pub buckets: HashMap<String, BucketStatus>,
    pub active: ActiveCounts,
    /// Jobs already enqueued this hour, per hosting instance.
    pub enqueued_this_hour: HashMap<String, u64>,
}

impl SchedulerSnapshot {
    pub fn new(now: DateTime<Utc>, config: SchedulerConfig) -> Self {
        Self {
            now,
            config,
            repos: Vec::new(),
            breakers: BreakerSnapshot::default(),
            pauses: Vec::new(),
            buckets: HashMap::new(),
            active: ActiveCounts::default(),
            enqueued_this_hour: HashMap::new(),
        }
    }

    pub fn repo(&self, repo_id: &str) -> Option<&RepoSyncState> {
        self.repos.iter().find(|r| r.repo_id == repo_id)
    }

    /// Active pause covering the repository, its tenant or its instance.
    pub fn pause_for(&self, repo: &RepoSyncState) -> Option<&PauseRecord> {
        let scopes = [
            PauseRecord::repo_scope(&repo.repo_id),
            PauseRecord::tenant_scope(&repo.tenant_id),
            PauseRecord::instance_scope(&repo.hosting_instance),
        ];
        self.pauses
            .iter()
            .filter(|p| p.is_active(self.now))
            .find(|p| scopes.contains(&p.scope))
    }

    /// Bucket for `hosting_instance` if it is inside the reserve.
    pub fn exhausted_bucket(&self, hosting_instance: &str) -> Option<&BucketStatus> {
        self.buckets
            .get(hosting_instance)
            .filter(|b| b.is_exhausted(self.config.bucket_reserve, self.now))
    }

    pub fn enqueued_this_hour(&self, hosting_instance: &str) -> u64 {
        self.enqueued_this_hour
            .get(hosting_instance)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use syncgrid_core::{ErrorCategory, PhysicalKind, SyncCounts, SyncMode};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn repo() -> RepoSyncState {
        RepoSyncState::new(&Repository {
            repo_id: "acme/api".into(),
            repo_type: RepoType::Github,
            hosting_instance: "github.com".into(),
            tenant_id: "acme".into(),
            enabled: true,
            created_at: now(),
        })
    }

    fn run(kind: JobKind, status: RunStatus, category: Option<ErrorCategory>, ago: i64) -> SyncRun {
        let at = now() - TimeDelta::seconds(ago);
        SyncRun {
            run_id: format!("run-{ago}"),
            job_id: "job".into(),
            repo_id: "acme/api".into(),
            job_kind: kind,
            physical_kind: PhysicalKind::GithubCommits,
            tenant_id: "acme".into(),
            hosting_instance: "github.com".into(),
            worker_id: "w1".into(),
            mode: SyncMode::Incremental,
            status,
            cursor_before: None,
            cursor_after: None,
            counts: SyncCounts::default(),
            error_summary: None,
            error_category: category,
            degradation_info: None,
            started_at: at,
            finished_at: Some(at),
        }
    }

    #[test]
    fn consecutive_failures_stop_at_last_success() {
        let mut state = repo();
        let runs = vec![
            run(JobKind::Commits, RunStatus::Failed, Some(ErrorCategory::Server), 10),
            run(JobKind::Commits, RunStatus::Failed, Some(ErrorCategory::LockHeld), 20),
            run(JobKind::Commits, RunStatus::Failed, Some(ErrorCategory::RateLimited), 30),
            run(JobKind::Commits, RunStatus::Completed, None, 40),
            run(JobKind::Commits, RunStatus::Failed, Some(ErrorCategory::Network), 50),
            run(JobKind::Reviews, RunStatus::NoData, None, 60),
        ];
        state.absorb_runs(&runs);

        let commits = state.kind(JobKind::Commits);
        assert_eq!(commits.consecutive_failures, 2);
        assert_eq!(commits.last_run_at, Some(now() - TimeDelta::seconds(10)));
        assert_eq!(state.kind(JobKind::Reviews).consecutive_failures, 0);
        assert_eq!(state.kind(JobKind::MergeRequests), KindSyncState::default());

        assert_eq!(state.recent_runs, 6);
        assert_eq!(state.recent_failures, 2);
        assert_eq!(state.recent_rate_limited, 1);
        assert!((state.failure_rate() - 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn pauses_match_any_scope_until_expiry() {
        let mut snapshot = SchedulerSnapshot::new(now(), SchedulerConfig::default());
        let state = repo();
        snapshot.pauses.push(PauseRecord {
            scope: PauseRecord::instance_scope("github.com"),
            paused_until: now() + TimeDelta::minutes(5),
            reason: "maintenance".into(),
        });
        assert!(snapshot.pause_for(&state).is_some());

        snapshot.now = now() + TimeDelta::minutes(6);
        assert!(snapshot.pause_for(&state).is_none());
    }

    #[test]
    fn bucket_inside_reserve_is_exhausted() {
        let mut snapshot = SchedulerSnapshot::new(now(), SchedulerConfig::default());
        snapshot.buckets.insert(
            "github.com".into(),
            BucketStatus {
                hosting_instance: "github.com".into(),
                limit: 5000,
                remaining: 10,
                reset_at: now() + TimeDelta::minutes(10),
                updated_at: now(),
            },
        );
        assert!(snapshot.exhausted_bucket("github.com").is_some());
        assert!(snapshot.exhausted_bucket("gitlab.example").is_none());
    }
}
