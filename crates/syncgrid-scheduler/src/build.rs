//! Turn selected candidates into queue rows.
//!
//! Applies the tenant and instance breakers, resolves the physical kind,
//! picks the sync mode and assembles the job payload. No I/O.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Value, json};

use syncgrid_breaker::BreakerDecision;
use syncgrid_core::{SyncMode, resolve_physical_kind};
use syncgrid_state::{NewJob, Payload};

use crate::select::{EnqueueCandidate, SkipReason, SkippedJob};
use crate::snapshot::{RepoSyncState, SchedulerSnapshot};

/// A job ready to enqueue plus the half-open breakers it spends a probe of.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub job: NewJob,
    pub probe_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildResult {
    pub jobs: Vec<PlannedJob>,
    pub skipped_jobs: Vec<SkippedJob>,
    /// Candidates held back by a tenant breaker.
    pub tenant_paused_count: usize,
    /// Candidates held back by an instance breaker.
    pub instance_paused_count: usize,
}

/// Remaining probe budget per half-open breaker key.
struct ProbeLedger {
    remaining: HashMap<String, u32>,
}

impl ProbeLedger {
    fn new() -> Self {
        Self {
            remaining: HashMap::new(),
        }
    }

    fn remaining(&mut self, decision: &BreakerDecision) -> u32 {
        *self
            .remaining
            .entry(decision.key.clone())
            .or_insert(decision.probe_budget)
    }

    fn spend(&mut self, decision: &BreakerDecision) {
        let left = self
            .remaining
            .entry(decision.key.clone())
            .or_insert(decision.probe_budget);
        *left = left.saturating_sub(1);
    }
}

fn resolve_mode(decisions: &[&BreakerDecision; 3]) -> SyncMode {
    let [global, tenant, instance] = decisions;
    if decisions.iter().any(|d| d.is_probe_mode) {
        SyncMode::Probe
    } else if global.is_backfill_only || tenant.is_backfill_only || instance.is_backfill_only {
        SyncMode::Backfill
    } else {
        SyncMode::Incremental
    }
}

fn build_payload(
    snapshot: &SchedulerSnapshot,
    candidate: &EnqueueCandidate,
    repo: &RepoSyncState,
    mode: SyncMode,
    decisions: &[&BreakerDecision; 3],
) -> Payload {
    let kind = repo.kind(candidate.job_kind);
    let mut payload = Payload::new();
    payload.insert(
        "scheduling".into(),
        json!({
            "scheduled_at": snapshot.now.to_rfc3339(),
            "score": candidate.score,
            "never_synced": candidate.never_synced,
            "consecutive_failures": kind.consecutive_failures,
        }),
    );
    payload.insert(
        "health".into(),
        json!({
            "cursor_age_seconds": candidate.cursor_age_seconds,
            "failure_rate": repo.failure_rate(),
            "rate_limit_rate": repo.rate_limit_rate(),
            "recent_runs": repo.recent_runs,
        }),
    );
    if let Some(bucket) = snapshot.buckets.get(&repo.hosting_instance) {
        payload.insert(
            "bucket".into(),
            json!({
                "limit": bucket.limit,
                "remaining": bucket.remaining,
                "reset_at": bucket.reset_at.to_rfc3339(),
                "reserve": snapshot.config.bucket_reserve,
            }),
        );
    }
    payload.insert(
        "breakers".into(),
        Value::Object(
            decisions
                .iter()
                .map(|d| (d.key.clone(), json!(d.state.as_str())))
                .collect(),
        ),
    );
    if mode == SyncMode::Probe {
        let degraded = decisions
            .iter()
            .filter(|d| d.is_probe_mode)
            .find_map(|d| d.degraded_params());
        if let Some(params) = degraded {
            payload.insert("degraded".into(), Value::Object(params));
        }
    }
    payload
}

/// Build queue rows for `candidates`, recording why any were dropped.
pub fn build_jobs_to_insert(
    snapshot: &SchedulerSnapshot,
    candidates: &[EnqueueCandidate],
) -> BuildResult {
    let mut result = BuildResult::default();
    let mut probes = ProbeLedger::new();
    let global = snapshot.breakers.global();

    for candidate in candidates {
        let skip = |reason| SkippedJob::new(candidate.repo_id.clone(), candidate.job_kind, reason);

        let Some(repo) = snapshot.repo(&candidate.repo_id) else {
            result.skipped_jobs.push(skip(SkipReason::MissingRepoState));
            continue;
        };

        let tenant = snapshot.breakers.tenant(&repo.tenant_id);
        if !tenant.allow_sync {
            result.tenant_paused_count += 1;
            result.skipped_jobs.push(skip(SkipReason::TenantBreaker {
                wait_seconds: tenant.wait_seconds,
            }));
            continue;
        }
        let instance = snapshot.breakers.instance(&repo.hosting_instance);
        if !instance.allow_sync {
            result.instance_paused_count += 1;
            result.skipped_jobs.push(skip(SkipReason::InstanceBreaker {
                wait_seconds: instance.wait_seconds,
            }));
            continue;
        }

        let decisions = [&global, &tenant, &instance];
        if let Some(exhausted) = decisions
            .iter()
            .find(|d| d.is_probe_mode && probes.remaining(d) == 0)
        {
            result.skipped_jobs.push(skip(SkipReason::ProbeBudget {
                key: exhausted.key.clone(),
            }));
            continue;
        }

        let Some(physical_kind) = resolve_physical_kind(repo.repo_type, candidate.job_kind) else {
            result.skipped_jobs.push(skip(SkipReason::UnsupportedKind));
            continue;
        };

        let mode = resolve_mode(&decisions);
        let probe_keys: Vec<String> = decisions
            .iter()
            .filter(|d| d.is_probe_mode)
            .map(|d| {
                probes.spend(d);
                d.key.clone()
            })
            .collect();

        let payload = build_payload(snapshot, candidate, repo, mode, &decisions);
        result.jobs.push(PlannedJob {
            job: NewJob {
                repo_id: repo.repo_id.clone(),
                job_kind: candidate.job_kind,
                physical_kind,
                tenant_id: repo.tenant_id.clone(),
                hosting_instance: repo.hosting_instance.clone(),
                priority: candidate.priority,
                mode,
                payload,
                max_attempts: snapshot.config.max_attempts,
            },
            probe_keys,
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use syncgrid_core::config::SchedulerConfig;
    use syncgrid_core::{JobKind, PhysicalKind, RepoType};
    use syncgrid_state::{BreakerState, Repository};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn snapshot() -> SchedulerSnapshot {
        let mut snapshot = SchedulerSnapshot::new(now(), SchedulerConfig::default());
        for (id, repo_type, tenant, instance) in [
            ("acme/api", RepoType::Github, "acme", "github.com"),
            ("beta/web", RepoType::Gitlab, "beta", "gitlab.example"),
            ("beta/mirror", RepoType::Git, "beta", "git.example"),
        ] {
            snapshot.repos.push(RepoSyncState::new(&Repository {
                repo_id: id.into(),
                repo_type,
                hosting_instance: instance.into(),
                tenant_id: tenant.into(),
                enabled: true,
                created_at: now(),
            }));
        }
        snapshot
    }

    fn candidate(repo_id: &str, kind: JobKind) -> EnqueueCandidate {
        EnqueueCandidate {
            repo_id: repo_id.into(),
            job_kind: kind,
            priority: kind.base_priority(),
            never_synced: true,
            cursor_age_seconds: None,
            score: 0.0,
        }
    }

    fn half_open(key: &str, budget: u32) -> BreakerDecision {
        let mut d = BreakerDecision::allow_all(key);
        d.state = BreakerState::HalfOpen;
        d.is_probe_mode = true;
        d.probe_budget = budget;
        d.suggested_batch_size = Some(20);
        d.suggested_forward_window_seconds = Some(3600);
        d.suggested_diff_mode = Some("stat".into());
        d
    }

    #[test]
    fn healthy_candidates_become_incremental_jobs() {
        let snap = snapshot();
        let result = build_jobs_to_insert(
            &snap,
            &[candidate("acme/api", JobKind::Reviews), candidate("beta/web", JobKind::MergeRequests)],
        );
        assert!(result.skipped_jobs.is_empty());
        let kinds: Vec<_> = result.jobs.iter().map(|p| p.job.physical_kind).collect();
        assert_eq!(kinds, vec![PhysicalKind::GithubReviews, PhysicalKind::GitlabMergeRequests]);

        let job = &result.jobs[0].job;
        assert_eq!(job.mode, SyncMode::Incremental);
        assert_eq!(job.priority, 10);
        assert_eq!(job.max_attempts, 5);
        assert!(job.payload.contains_key("scheduling"));
        assert_eq!(job.payload["health"]["failure_rate"], json!(0.0));
        assert!(!job.payload.contains_key("degraded"));
        assert!(result.jobs[0].probe_keys.is_empty());
    }

    #[test]
    fn tenant_and_instance_breakers_skip_and_count() {
        let mut snap = snapshot();
        let mut tenant = BreakerDecision::allow_all("tenant:acme");
        tenant.allow_sync = false;
        tenant.wait_seconds = 60;
        snap.breakers.decisions.insert(tenant.key.clone(), tenant);
        let mut instance = BreakerDecision::allow_all("instance:gitlab.example");
        instance.allow_sync = false;
        instance.wait_seconds = 30;
        snap.breakers.decisions.insert(instance.key.clone(), instance);

        let result = build_jobs_to_insert(
            &snap,
            &[
                candidate("acme/api", JobKind::Commits),
                candidate("beta/web", JobKind::Commits),
                candidate("beta/mirror", JobKind::Commits),
            ],
        );
        assert_eq!(result.tenant_paused_count, 1);
        assert_eq!(result.instance_paused_count, 1);
        assert_eq!(result.jobs.len(), 1);
        assert_eq!(
            result.skipped_jobs.iter().map(|s| s.reason.clone()).collect::<Vec<_>>(),
            vec![
                SkipReason::TenantBreaker { wait_seconds: 60 },
                SkipReason::InstanceBreaker { wait_seconds: 30 },
            ]
        );
    }

    #[test]
    fn missing_repo_and_unsupported_kind_are_skipped() {
        let result = build_jobs_to_insert(
            &snapshot(),
            &[candidate("gone/repo", JobKind::Commits), candidate("beta/mirror", JobKind::Reviews)],
        );
        assert!(result.jobs.is_empty());
        assert_eq!(result.skipped_jobs[0].reason, SkipReason::MissingRepoState);
        assert_eq!(result.skipped_jobs[1].reason, SkipReason::UnsupportedKind);
    }

    #[test]
    fn half_open_instance_forces_probe_within_budget() {
        let mut snap = snapshot();
        snap.breakers
            .decisions
            .insert("instance:github.com".into(), half_open("instance:github.com", 2));

        let result = build_jobs_to_insert(
            &snap,
            &[
                candidate("acme/api", JobKind::Commits),
                candidate("acme/api", JobKind::MergeRequests),
                candidate("acme/api", JobKind::Reviews),
                candidate("beta/web", JobKind::Commits),
            ],
        );
        let modes: Vec<_> = result.jobs.iter().map(|p| (p.job.repo_id.as_str(), p.job.mode)).collect();
        assert_eq!(
            modes,
            vec![
                ("acme/api", SyncMode::Probe),
                ("acme/api", SyncMode::Probe),
                ("beta/web", SyncMode::Incremental),
            ]
        );
        assert_eq!(
            result.skipped_jobs[0].reason,
            SkipReason::ProbeBudget {
                key: "instance:github.com".into()
            }
        );
        assert_eq!(result.jobs[0].probe_keys, vec!["instance:github.com".to_string()]);
        assert_eq!(result.jobs[0].job.payload["degraded"]["batch_size"], json!(20));
        assert_eq!(result.jobs[0].job.payload["degraded"]["diff_mode"], json!("stat"));
    }

    #[test]
    fn global_backfill_only_sets_backfill_mode() {
        let mut snap = snapshot();
        let mut global = BreakerDecision::allow_all("global");
        global.is_backfill_only = true;
        snap.breakers.decisions.insert("global".into(), global);
        let result = build_jobs_to_insert(&snap, &[candidate("acme/api", JobKind::Commits)]);
        assert_eq!(result.jobs[0].job.mode, SyncMode::Backfill);
        assert!(!result.jobs[0].job.payload.contains_key("degraded"));
    }
}
