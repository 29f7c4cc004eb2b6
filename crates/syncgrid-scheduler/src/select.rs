//! Candidate selection: which (repository, kind) pairs are due this tick.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use syncgrid_core::JobKind;

use crate::snapshot::{RepoSyncState, SchedulerSnapshot};

/// Why a pair was not enqueued.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyQueued,
    Paused { scope: String, until: DateTime<Utc> },
    BucketExhausted { hosting_instance: String, reset_in_seconds: i64 },
    NotDue { due_in_seconds: i64 },
    GlobalBreaker { wait_seconds: i64 },
    TickBudget,
    ProbeBudget { key: String },
    GlobalActiveBudget,
    TenantActiveBudget,
    InstanceActiveBudget,
    HourlyInstanceBudget,
    MissingRepoState,
    TenantBreaker { wait_seconds: i64 },
    InstanceBreaker { wait_seconds: i64 },
    UnsupportedKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedJob {
    pub repo_id: String,
    pub job_kind: JobKind,
    #[serde(flatten)]
    pub reason: SkipReason,
}

impl SkippedJob {
    pub fn new(repo_id: impl Into<String>, job_kind: JobKind, reason: SkipReason) -> Self {
        Self {
            repo_id: repo_id.into(),
            job_kind,
            reason,
        }
    }
}

/// A pair selected for enqueueing, with the ranking inputs that chose it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueueCandidate {
    pub repo_id: String,
    pub job_kind: JobKind,
    pub priority: i32,
    pub never_synced: bool,
    /// Seconds since the cursor last moved, if it ever did.
    pub cursor_age_seconds: Option<i64>,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Selection {
    pub candidates: Vec<EnqueueCandidate>,
    pub skipped: Vec<SkippedJob>,
}

/// Seconds of cursor age a fully failing repository gives up in ranking.
const FAILURE_PENALTY_SECONDS: f64 = 3_600.0;
/// Rate limiting is penalised harder than plain failures.
const RATE_LIMIT_PENALTY_SECONDS: f64 = 7_200.0;

/// Earliest time the pair may run again: `base * 2^failures` after the last
/// run, the exponent capped at `max_backoff_exponent`.
fn next_due(repo: &RepoSyncState, kind: JobKind, snapshot: &SchedulerSnapshot) -> Option<DateTime<Utc>> {
    let state = repo.kind(kind);
    let last = match (state.last_run_at, state.cursor_updated_at) {
        (Some(run), Some(cursor)) => run.max(cursor),
        (run, cursor) => run.or(cursor)?,
    };
    let exponent = state
        .consecutive_failures
        .min(snapshot.config.max_backoff_exponent);
    let interval = snapshot
        .config
        .base_interval_seconds
        .saturating_mul(2i64.saturating_pow(exponent));
    let delay = TimeDelta::try_seconds(interval).unwrap_or(TimeDelta::MAX);
    Some(last.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

fn candidate(repo: &RepoSyncState, kind: JobKind, now: DateTime<Utc>) -> EnqueueCandidate {
    let state = repo.kind(kind);
    let cursor_age_seconds = state
        .cursor_updated_at
        .map(|at| (now - at).num_seconds().max(0));
    let never_synced = cursor_age_seconds.is_none();
    let age = cursor_age_seconds.unwrap_or(0) as f64;
    let score = age
        - FAILURE_PENALTY_SECONDS * repo.failure_rate()
        - RATE_LIMIT_PENALTY_SECONDS * repo.rate_limit_rate();
    EnqueueCandidate {
        repo_id: repo.repo_id.clone(),
        job_kind: kind,
        priority: kind.base_priority(),
        never_synced,
        cursor_age_seconds,
        score,
    }
}

/// Filter and rank every enabled pair, then take candidates in rank order
/// while the tick, active and hourly budgets allow.
pub fn select_jobs_to_enqueue(snapshot: &SchedulerSnapshot) -> Selection {
    let mut selection = Selection::default();
    let now = snapshot.now;
    let global = snapshot.breakers.global();

    let mut eligible: Vec<(EnqueueCandidate, &RepoSyncState)> = Vec::new();
    for repo in &snapshot.repos {
        for kind in repo.repo_type.supported_kinds() {
            let skip = |reason| SkippedJob::new(repo.repo_id.clone(), kind, reason);
            if !global.allow_sync {
                selection.skipped.push(skip(SkipReason::GlobalBreaker {
                    wait_seconds: global.wait_seconds,
                }));
                continue;
            }
            if repo.queued_kinds.contains(&kind) {
                selection.skipped.push(skip(SkipReason::AlreadyQueued));
                continue;
            }
            if let Some(pause) = snapshot.pause_for(repo) {
                selection.skipped.push(skip(SkipReason::Paused {
                    scope: pause.scope.clone(),
                    until: pause.paused_until,
                }));
                continue;
            }
            if let Some(bucket) = snapshot.exhausted_bucket(&repo.hosting_instance) {
                selection.skipped.push(skip(SkipReason::BucketExhausted {
                    hosting_instance: bucket.hosting_instance.clone(),
                    reset_in_seconds: bucket.seconds_until_reset(now),
                }));
                continue;
            }
            if let Some(due) = next_due(repo, kind, snapshot) {
                if due > now {
                    selection.skipped.push(skip(SkipReason::NotDue {
                        due_in_seconds: (due - now).num_seconds(),
                    }));
                    continue;
                }
            }
            eligible.push((candidate(repo, kind, now), repo));
        }
    }

    eligible.sort_by(|(a, _), (b, _)| {
        b.never_synced
            .cmp(&a.never_synced)
            .then_with(|| b.score.total_cmp(&a.score))
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.repo_id.cmp(&b.repo_id))
            .then_with(|| a.job_kind.cmp(&b.job_kind))
    });

    let config = &snapshot.config;
    let probe_cap = global.is_probe_mode.then_some(global.probe_budget as usize);
    let mut active = snapshot.active.clone();
    let mut hourly: HashMap<&str, u64> = HashMap::new();

    for (candidate, repo) in eligible {
        let used_hourly = hourly.get(repo.hosting_instance.as_str()).copied().unwrap_or(0);
        let taken = selection.candidates.len();
        let reason = if taken >= config.max_enqueue_per_tick {
            Some(SkipReason::TickBudget)
        } else if probe_cap.is_some_and(|cap| taken >= cap) {
            Some(SkipReason::ProbeBudget {
                key: global.key.clone(),
            })
        } else if active.global >= config.max_active_global {
            Some(SkipReason::GlobalActiveBudget)
        } else if active.tenant(&repo.tenant_id) >= config.max_active_per_tenant {
            Some(SkipReason::TenantActiveBudget)
        } else if active.instance(&repo.hosting_instance) >= config.max_active_per_instance {
            Some(SkipReason::InstanceActiveBudget)
        } else if snapshot.enqueued_this_hour(&repo.hosting_instance) + used_hourly
            >= config.max_enqueue_per_hour_per_instance
        {
            Some(SkipReason::HourlyInstanceBudget)
        } else {
            None
        };

        match reason {
            Some(reason) => selection.skipped.push(SkippedJob::new(
                candidate.repo_id,
                candidate.job_kind,
                reason,
            )),
            None => {
                active.add(&repo.tenant_id, &repo.hosting_instance);
                *hourly.entry(repo.hosting_instance.as_str()).or_default() += 1;
                selection.candidates.push(candidate);
            }
        }
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use syncgrid_breaker::BreakerDecision;
    use syncgrid_core::config::SchedulerConfig;
    use syncgrid_core::RepoType;
    use syncgrid_state::{BreakerState, BucketStatus, PauseRecord, Repository};

    use crate::snapshot::KindSyncState;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn repo(id: &str, repo_type: RepoType, tenant: &str, instance: &str) -> RepoSyncState {
        RepoSyncState::new(&Repository {
            repo_id: id.into(),
            repo_type,
            hosting_instance: instance.into(),
            tenant_id: tenant.into(),
            enabled: true,
            created_at: now(),
        })
    }

    fn synced(mut state: RepoSyncState, kind: JobKind, ago: i64, failures: u32) -> RepoSyncState {
        let at = now() - TimeDelta::seconds(ago);
        state.kinds.insert(
            kind,
            KindSyncState {
                cursor_updated_at: Some(at),
                last_run_at: Some(at),
                consecutive_failures: failures,
            },
        );
        state
    }

    fn snapshot(repos: Vec<RepoSyncState>) -> SchedulerSnapshot {
        let mut snapshot = SchedulerSnapshot::new(now(), SchedulerConfig::default());
        snapshot.repos = repos;
        snapshot
    }

    fn selected(selection: &Selection) -> Vec<(String, JobKind)> {
        selection
            .candidates
            .iter()
            .map(|c| (c.repo_id.clone(), c.job_kind))
            .collect()
    }

    fn reasons(selection: &Selection) -> Vec<&SkipReason> {
        selection.skipped.iter().map(|s| &s.reason).collect()
    }

    #[test]
    fn git_repos_only_get_commits() {
        let selection = select_jobs_to_enqueue(&snapshot(vec![repo(
            "mirror",
            RepoType::Git,
            "acme",
            "git.example",
        )]));
        assert_eq!(selected(&selection), vec![("mirror".to_string(), JobKind::Commits)]);
        assert!(selection.skipped.is_empty());
    }

    #[test]
    fn never_synced_first_then_oldest_cursor() {
        let fresh = repo("b-new", RepoType::Git, "acme", "git.example");
        let old = synced(repo("a-old", RepoType::Git, "acme", "git.example"), JobKind::Commits, 10_000, 0);
        let older = synced(repo("c-older", RepoType::Git, "acme", "git.example"), JobKind::Commits, 20_000, 0);
        let selection = select_jobs_to_enqueue(&snapshot(vec![old, fresh, older]));
        let ids: Vec<_> = selection.candidates.iter().map(|c| c.repo_id.as_str()).collect();
        assert_eq!(ids, vec!["b-new", "c-older", "a-old"]);
        assert!(selection.candidates[0].never_synced);
        assert_eq!(selection.candidates[1].cursor_age_seconds, Some(20_000));
    }

    #[test]
    fn failures_back_off_exponentially() {
        // base 900s, two failures => due 3600s after the last run.
        let state = synced(repo("r", RepoType::Git, "acme", "git.example"), JobKind::Commits, 2_000, 2);
        let selection = select_jobs_to_enqueue(&snapshot(vec![state]));
        assert!(selection.candidates.is_empty());
        assert_eq!(reasons(&selection), vec![&SkipReason::NotDue { due_in_seconds: 1_600 }]);

        let state = synced(repo("r", RepoType::Git, "acme", "git.example"), JobKind::Commits, 4_000, 2);
        assert_eq!(select_jobs_to_enqueue(&snapshot(vec![state])).candidates.len(), 1);
    }

    #[test]
    fn queued_paused_and_bucket_skips() {
        let mut queued = repo("queued", RepoType::Git, "acme", "git.example");
        queued.queued_kinds.insert(JobKind::Commits);
        let paused = repo("paused", RepoType::Git, "beta", "git.example");
        let limited = repo("limited", RepoType::Git, "acme", "ghe.example");

        let mut snap = snapshot(vec![queued, paused, limited]);
        snap.pauses.push(PauseRecord {
            scope: PauseRecord::tenant_scope("beta"),
            paused_until: now() + TimeDelta::minutes(10),
            reason: "operator".into(),
        });
        snap.buckets.insert(
            "ghe.example".into(),
            BucketStatus {
                hosting_instance: "ghe.example".into(),
                limit: 5000,
                remaining: 0,
                reset_at: now() + TimeDelta::seconds(90),
                updated_at: now(),
            },
        );

        let selection = select_jobs_to_enqueue(&snap);
        assert!(selection.candidates.is_empty());
        assert_eq!(
            reasons(&selection),
            vec![
                &SkipReason::AlreadyQueued,
                &SkipReason::Paused {
                    scope: "tenant:beta".into(),
                    until: now() + TimeDelta::minutes(10),
                },
                &SkipReason::BucketExhausted {
                    hosting_instance: "ghe.example".into(),
                    reset_in_seconds: 90,
                },
            ]
        );
    }

    #[test]
    fn open_global_breaker_selects_nothing() {
        let mut snap = snapshot(vec![repo("r", RepoType::Github, "acme", "github.com")]);
        let mut global = BreakerDecision::allow_all("global");
        global.state = BreakerState::Open;
        global.allow_sync = false;
        global.wait_seconds = 120;
        snap.breakers.decisions.insert("global".into(), global);

        let selection = select_jobs_to_enqueue(&snap);
        assert!(selection.candidates.is_empty());
        assert_eq!(selection.skipped.len(), 3);
        assert!(
            reasons(&selection)
                .iter()
                .all(|r| **r == SkipReason::GlobalBreaker { wait_seconds: 120 })
        );
    }

    #[test]
    fn budgets_cap_selection() {
        let repos: Vec<_> = (0..6)
            .map(|i| repo(&format!("r{i}"), RepoType::Git, if i < 3 { "acme" } else { "beta" }, "git.example"))
            .collect();

        let mut snap = snapshot(repos.clone());
        snap.config.max_enqueue_per_tick = 5;
        snap.config.max_active_per_tenant = 2;
        let selection = select_jobs_to_enqueue(&snap);
        assert_eq!(selection.candidates.len(), 4);
        assert_eq!(
            reasons(&selection),
            vec![&SkipReason::TenantActiveBudget, &SkipReason::TenantActiveBudget]
        );

        let mut snap = snapshot(repos.clone());
        snap.enqueued_this_hour.insert("git.example".into(), 598);
        let selection = select_jobs_to_enqueue(&snap);
        assert_eq!(selection.candidates.len(), 2);
        assert!(reasons(&selection).iter().all(|r| **r == SkipReason::HourlyInstanceBudget));

        let mut snap = snapshot(repos);
        snap.active.global = snap.config.max_active_global - 1;
        assert_eq!(select_jobs_to_enqueue(&snap).candidates.len(), 1);
    }

    #[test]
    fn global_probe_mode_caps_at_probe_budget() {
        let repos: Vec<_> = (0..5)
            .map(|i| repo(&format!("r{i}"), RepoType::Git, "acme", "git.example"))
            .collect();
        let mut snap = snapshot(repos);
        let mut global = BreakerDecision::allow_all("global");
        global.state = BreakerState::HalfOpen;
        global.is_probe_mode = true;
        global.probe_budget = 2;
        snap.breakers.decisions.insert("global".into(), global);

        let selection = select_jobs_to_enqueue(&snap);
        assert_eq!(selection.candidates.len(), 2);
        assert_eq!(selection.skipped.len(), 3);
        assert!(matches!(selection.skipped[0].reason, SkipReason::ProbeBudget { .. }));
    }
}
