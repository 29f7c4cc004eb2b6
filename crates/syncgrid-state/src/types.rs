//! Domain types for the SyncGrid state store.
//!
//! These types represent the persisted state of repositories, cursors, the
//! job queue, locks, circuit breakers, sync runs, rate-limit buckets, pauses
//! and budget counters. All types are serializable to/from JSON for storage
//! in redb tables.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use syncgrid_core::config::RepositoryConfig;
use syncgrid_core::{
    ErrorCategory, JobKind, JobState, PhysicalKind, RepoType, RunStatus, SyncCounts, SyncMode,
    Watermark,
};

/// Opaque job payload.
pub type Payload = Map<String, Value>;

/// Key of every per-pair table.
pub fn pair_key(repo_id: &str, job_kind: JobKind) -> String {
    format!("{repo_id}:{job_kind}")
}

/// Hour bucket used by the enqueue budget counters, e.g. `2024011512`.
pub fn hour_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H").to_string()
}

// ── Repository ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub repo_id: String,
    pub repo_type: RepoType,
    pub hosting_instance: String,
    pub tenant_id: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn from_config(config: &RepositoryConfig, now: DateTime<Utc>) -> Self {
        Self {
            repo_id: config.repo_id.clone(),
            repo_type: config.repo_type,
            hosting_instance: config.hosting_instance.clone(),
            tenant_id: config.tenant_id.clone(),
            enabled: config.enabled,
            created_at: now,
        }
    }
}

// ── Cursor ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncCursor {
    pub repo_id: String,
    pub job_kind: JobKind,
    pub watermark: Watermark,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn table_key(&self) -> String {
        pair_key(&self.repo_id, self.job_kind)
    }
}

// ── Jobs ───────────────────────────────────────────────────────────

/// A queue row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncJob {
    pub job_id: String,
    pub repo_id: String,
    pub job_kind: JobKind,
    pub physical_kind: PhysicalKind,
    pub tenant_id: String,
    pub hosting_instance: String,
    /// Higher values are claimed first.
    pub priority: i32,
    pub mode: SyncMode,
    pub state: JobState,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Failed (or lease-lost) attempts so far.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Not claimable before this instant.
    pub available_at: DateTime<Utc>,
    pub payload: Payload,
    pub last_run_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn pair_key(&self) -> String {
        pair_key(&self.repo_id, self.job_kind)
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Running && self.lease_owner.as_deref() == Some(worker_id)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_none_or(|at| at < now)
    }

    /// Pending and due, or running with a lapsed lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => self.available_at <= now,
            JobState::Running => self.lease_expired(now),
            JobState::Completed | JobState::Dead => false,
        }
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// Everything the scheduler decides about a job before it is inserted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJob {
    pub repo_id: String,
    pub job_kind: JobKind,
    pub physical_kind: PhysicalKind,
    pub tenant_id: String,
    pub hosting_instance: String,
    pub priority: i32,
    pub mode: SyncMode,
    pub payload: Payload,
    pub max_attempts: u32,
}

impl NewJob {
    pub(crate) fn into_job(self, job_id: String, now: DateTime<Utc>) -> SyncJob {
        SyncJob {
            job_id,
            repo_id: self.repo_id,
            job_kind: self.job_kind,
            physical_kind: self.physical_kind,
            tenant_id: self.tenant_id,
            hosting_instance: self.hosting_instance,
            priority: self.priority,
            mode: self.mode,
            state: JobState::Pending,
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts: self.max_attempts.max(1),
            available_at: now,
            payload: self.payload,
            last_run_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Inserted(SyncJob),
    /// The pair already has a pending or running job.
    AlreadyActive { job_id: String },
}

/// What the lease reaper did (or would do) to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimAction {
    Requeued,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclaimedJob {
    pub job_id: String,
    pub repo_id: String,
    pub job_kind: JobKind,
    pub previous_owner: Option<String>,
    pub action: ReclaimAction,
}

// ── Locks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lock {
    pub repo_id: String,
    pub job_kind: JobKind,
    pub holder_worker_id: String,
    pub lease_expires_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
}

impl Lock {
    pub fn table_key(&self) -> String {
        pair_key(&self.repo_id, self.job_kind)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at > now
    }
}

// ── Circuit breakers ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted breaker row for one key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerRecord {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(default)]
    pub rate_limited_count: u32,
    pub last_transition_at: DateTime<Utc>,
    /// Probe jobs handed out since entering half-open.
    #[serde(default)]
    pub probes_issued: u32,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreakerRecord {
    pub fn closed(key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            rate_limited_count: 0,
            last_transition_at: now,
            probes_issued: 0,
            updated_at: now,
        }
    }
}

// ── Runs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRun {
    pub run_id: String,
    pub job_id: String,
    pub repo_id: String,
    pub job_kind: JobKind,
    pub physical_kind: PhysicalKind,
    pub tenant_id: String,
    pub hosting_instance: String,
    pub worker_id: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub cursor_before: Option<Watermark>,
    pub cursor_after: Option<Watermark>,
    pub counts: SyncCounts,
    pub error_summary: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub degradation_info: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncRun {
    /// A fresh `running` record for a claimed job.
    pub fn start(
        run_id: impl Into<String>,
        job: &SyncJob,
        worker_id: &str,
        cursor_before: Option<Watermark>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            job_id: job.job_id.clone(),
            repo_id: job.repo_id.clone(),
            job_kind: job.job_kind,
            physical_kind: job.physical_kind,
            tenant_id: job.tenant_id.clone(),
            hosting_instance: job.hosting_instance.clone(),
            worker_id: worker_id.to_string(),
            mode: job.mode,
            status: RunStatus::Running,
            cursor_before,
            cursor_after: None,
            counts: SyncCounts::default(),
            error_summary: None,
            error_category: None,
            degradation_info: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        self.finished_at.map(|end| end - self.started_at)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.error_category == Some(ErrorCategory::RateLimited)
    }
}

/// Final fields written to a run exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunFinish {
    pub status: RunStatus,
    pub cursor_after: Option<Watermark>,
    pub counts: SyncCounts,
    pub error_summary: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub degradation_info: Option<Value>,
}

impl RunFinish {
    /// A finish record must be terminal, and a failed one must explain itself.
    pub fn validate(&self) -> Result<(), String> {
        match self.status {
            RunStatus::Running => Err("finish status cannot be running".into()),
            RunStatus::Failed => {
                let has_summary = self
                    .error_summary
                    .as_deref()
                    .is_some_and(|s| !s.trim().is_empty());
                if !has_summary {
                    return Err("failed run requires an error summary".into());
                }
                if self.error_category.is_none() {
                    return Err("failed run requires an error category".into());
                }
                Ok(())
            }
            RunStatus::Completed | RunStatus::NoData => Ok(()),
        }
    }
}

// ── Buckets, pauses and budget ─────────────────────────────────────

/// Last observed rate-limit bucket for a hosting instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketStatus {
    pub hosting_instance: String,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BucketStatus {
    /// Remaining quota is inside the reserve and the bucket has not reset yet.
    pub fn is_exhausted(&self, reserve: u64, now: DateTime<Utc>) -> bool {
        self.remaining <= reserve && self.reset_at > now
    }

    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> i64 {
        (self.reset_at - now).num_seconds().max(0)
    }
}

/// Operator pause for a tenant, instance or single repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PauseRecord {
    /// `tenant:{id}`, `instance:{id}` or `repo:{id}`.
    pub scope: String,
    pub paused_until: DateTime<Utc>,
    pub reason: String,
}

impl PauseRecord {
    pub fn tenant_scope(tenant_id: &str) -> String {
        format!("tenant:{tenant_id}")
    }

    pub fn instance_scope(hosting_instance: &str) -> String {
        format!("instance:{hosting_instance}")
    }

    pub fn repo_scope(repo_id: &str) -> String {
        format!("repo:{repo_id}")
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.paused_until > now
    }
}

/// Jobs enqueued for a scope within one hour bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetCounter {
    pub scope: String,
    pub hour: String,
    pub enqueued: u64,
}

impl BudgetCounter {
    pub fn table_key(&self) -> String {
        budget_key(&self.scope, &self.hour)
    }
}

pub fn budget_key(scope: &str, hour: &str) -> String {
    format!("{scope}@{hour}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 0).unwrap()
    }

    #[test]
    fn hour_bucket_format() {
        assert_eq!(hour_bucket(now()), "2024011512");
    }

    #[test]
    fn failed_finish_requires_summary() {
        let mut finish = RunFinish {
            status: RunStatus::Failed,
            cursor_after: None,
            counts: SyncCounts::default(),
            error_summary: Some("  ".into()),
            error_category: Some(ErrorCategory::Network),
            degradation_info: None,
        };
        assert!(finish.validate().is_err());
        finish.error_summary = Some("connection reset".into());
        assert!(finish.validate().is_ok());
        finish.status = RunStatus::Running;
        assert!(finish.validate().is_err());
    }

    #[test]
    fn bucket_exhaustion_respects_reset() {
        let bucket = BucketStatus {
            hosting_instance: "github.com".into(),
            limit: 5000,
            remaining: 10,
            reset_at: now() + TimeDelta::minutes(5),
            updated_at: now(),
        };
        assert!(bucket.is_exhausted(50, now()));
        assert!(!bucket.is_exhausted(5, now()));
        assert!(!bucket.is_exhausted(50, now() + TimeDelta::minutes(6)));
        assert_eq!(bucket.seconds_until_reset(now()), 300);
    }
}
