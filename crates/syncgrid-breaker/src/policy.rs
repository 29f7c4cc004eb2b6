//! Breaker state machine and the decisions it produces.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use syncgrid_core::config::BreakerConfig;
use syncgrid_core::{ErrorClass, RunStatus};
use syncgrid_state::{BreakerState, CircuitBreakerRecord, SyncRun};

use crate::error::BreakerError;

/// Scope a breaker guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BreakerKey {
    Global,
    Tenant(String),
    Instance(String),
}

impl BreakerKey {
    /// Whether a run counts towards this breaker's health.
    pub fn covers(&self, run: &SyncRun) -> bool {
        match self {
            BreakerKey::Global => true,
            BreakerKey::Tenant(id) => run.tenant_id == *id,
            BreakerKey::Instance(id) => run.hosting_instance == *id,
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerKey::Global => f.write_str("global"),
            BreakerKey::Tenant(id) => write!(f, "tenant:{id}"),
            BreakerKey::Instance(id) => write!(f, "instance:{id}"),
        }
    }
}

impl FromStr for BreakerKey {
    type Err = BreakerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(BreakerKey::Global);
        }
        match s.split_once(':') {
            Some(("tenant", id)) if !id.is_empty() => Ok(BreakerKey::Tenant(id.to_string())),
            Some(("instance", id)) if !id.is_empty() => Ok(BreakerKey::Instance(id.to_string())),
            _ => Err(BreakerError::InvalidKey(s.to_string())),
        }
    }
}

/// Outcome counts over a breaker's recent runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthWindow {
    pub successes: u32,
    pub failures: u32,
    pub rate_limited: u32,
}

impl HealthWindow {
    /// Fold finished runs into counts. Running runs and ignorable failures
    /// (lock contention, nothing new) say nothing about host health.
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a SyncRun>) -> Self {
        let mut window = HealthWindow::default();
        for run in runs {
            match run.status {
                RunStatus::Running => {}
                RunStatus::Completed | RunStatus::NoData => window.successes += 1,
                RunStatus::Failed => match run.error_category.map(|c| c.class()) {
                    Some(ErrorClass::Ignorable) => {}
                    Some(ErrorClass::RateLimited) => window.rate_limited += 1,
                    _ => window.failures += 1,
                },
            }
        }
        window
    }

    /// Runs covered by `key` that finished after `since`, most recent
    /// `max_runs` only. `runs` must be ordered newest first.
    pub fn collect(
        key: &BreakerKey,
        runs: &[SyncRun],
        since: DateTime<Utc>,
        max_runs: usize,
    ) -> Self {
        Self::from_runs(
            runs.iter()
                .filter(|r| r.status != RunStatus::Running)
                .filter(|r| r.finished_at.unwrap_or(r.started_at) >= since)
                .filter(|r| key.covers(r))
                .take(max_runs),
        )
    }

    pub fn total(&self) -> u32 {
        self.successes + self.failures + self.rate_limited
    }

    pub fn failure_ratio(&self) -> f64 {
        ratio(self.failures, self.total())
    }

    pub fn rate_limit_ratio(&self) -> f64 {
        ratio(self.rate_limited, self.total())
    }

    pub fn success_ratio(&self) -> f64 {
        ratio(self.successes, self.total())
    }
}

fn ratio(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// What the scheduler may do under one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerDecision {
    pub key: String,
    pub state: BreakerState,
    pub allow_sync: bool,
    /// Seconds until syncing may resume; zero when allowed.
    pub wait_seconds: i64,
    pub is_probe_mode: bool,
    /// Probe jobs still available in half-open.
    pub probe_budget: u32,
    /// Closed but seeing enough rate limiting to defer to backfill.
    pub is_backfill_only: bool,
    pub suggested_batch_size: Option<u32>,
    pub suggested_forward_window_seconds: Option<i64>,
    pub suggested_diff_mode: Option<String>,
}

impl BreakerDecision {
    /// Decision for a key with no breaker row: closed and unrestricted.
    pub fn allow_all(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: BreakerState::Closed,
            allow_sync: true,
            wait_seconds: 0,
            is_probe_mode: false,
            probe_budget: 0,
            is_backfill_only: false,
            suggested_batch_size: None,
            suggested_forward_window_seconds: None,
            suggested_diff_mode: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.is_probe_mode || self.is_backfill_only
    }

    /// Suggested parameters to inject into a job payload, if any.
    pub fn degraded_params(&self) -> Option<Map<String, Value>> {
        if !self.is_degraded() {
            return None;
        }
        let mut params = Map::new();
        if let Some(batch) = self.suggested_batch_size {
            params.insert("batch_size".into(), json!(batch));
        }
        if let Some(window) = self.suggested_forward_window_seconds {
            params.insert("forward_window_seconds".into(), json!(window));
        }
        if let Some(mode) = &self.suggested_diff_mode {
            params.insert("diff_mode".into(), json!(mode));
        }
        Some(params)
    }
}

/// Pure transition and decision logic for breaker rows.
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    config: BreakerConfig,
}

impl BreakerPolicy {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Start of the health window for a row: the configured lookback, but
    /// never before the last transition so a fresh state is not judged on
    /// outcomes from the previous one.
    pub fn window_start(&self, record: &CircuitBreakerRecord, now: DateTime<Utc>) -> DateTime<Utc> {
        let lookback = now - TimeDelta::minutes(self.config.window_minutes);
        lookback.max(record.last_transition_at)
    }

    /// Successes needed in half-open before closing.
    pub fn probe_successes_required(&self) -> u32 {
        let needed = (self.config.probe_budget as f64 * self.config.probe_success_threshold).ceil();
        (needed as u32).max(1)
    }

    /// Half-open with the whole budget handed out, no verdict, and a full
    /// cooldown since the budget was granted. Trial jobs that never report
    /// back (dead-lettered, reclaimed, ignorable failures) would otherwise
    /// hold the breaker half-open forever.
    fn probes_stalled(&self, record: &CircuitBreakerRecord, now: DateTime<Utc>) -> bool {
        record.state == BreakerState::HalfOpen
            && record.probes_issued >= self.config.probe_budget
            && (now - record.last_transition_at).num_seconds() >= self.config.cooldown_seconds
    }

    fn trips(&self, window: &HealthWindow) -> bool {
        window.total() >= self.config.min_samples
            && (window.failure_ratio() >= self.config.failure_ratio_threshold
                || window.rate_limit_ratio() >= self.config.rate_limit_ratio_threshold)
    }

    /// Apply at most one transition and refresh the counters.
    pub fn evaluate(
        &self,
        record: &CircuitBreakerRecord,
        window: &HealthWindow,
        now: DateTime<Utc>,
    ) -> CircuitBreakerRecord {
        let mut next = record.clone();
        next.failure_count = window.failures;
        next.success_count = window.successes;
        next.rate_limited_count = window.rate_limited;
        next.updated_at = now;

        let target = match record.state {
            BreakerState::Closed if self.trips(window) => Some(BreakerState::Open),
            BreakerState::Open => {
                let elapsed = (now - record.last_transition_at).num_seconds();
                (elapsed >= self.config.cooldown_seconds).then_some(BreakerState::HalfOpen)
            }
            BreakerState::HalfOpen if window.failures + window.rate_limited > 0 => {
                Some(BreakerState::Open)
            }
            BreakerState::HalfOpen if window.successes >= self.probe_successes_required() => {
                Some(BreakerState::Closed)
            }
            BreakerState::HalfOpen if self.probes_stalled(record, now) => Some(BreakerState::HalfOpen),
            _ => None,
        };

        if let Some(state) = target {
            match state {
                BreakerState::Open => warn!(
                    key = %record.key,
                    from = %record.state,
                    failures = window.failures,
                    rate_limited = window.rate_limited,
                    samples = window.total(),
                    "circuit breaker opened"
                ),
                BreakerState::HalfOpen if record.state == BreakerState::HalfOpen => info!(
                    key = %record.key,
                    probes_issued = record.probes_issued,
                    successes = window.successes,
                    "half-open budget re-armed"
                ),
                _ => info!(key = %record.key, from = %record.state, to = %state, "circuit breaker transition"),
            }
            next.state = state;
            next.last_transition_at = now;
            next.probes_issued = 0;
            // Counters restart with the new state.
            next.failure_count = 0;
            next.success_count = 0;
            next.rate_limited_count = 0;
        }
        next
    }

    /// Decision for the scheduler given a freshly evaluated row.
    pub fn decide(
        &self,
        record: &CircuitBreakerRecord,
        window: &HealthWindow,
        now: DateTime<Utc>,
    ) -> BreakerDecision {
        let mut decision = BreakerDecision::allow_all(record.key.clone());
        decision.state = record.state;

        match record.state {
            BreakerState::Closed => {
                decision.is_backfill_only = window.total() >= self.config.min_samples
                    && window.rate_limit_ratio() >= self.config.backfill_rate_limit_ratio;
            }
            BreakerState::Open => {
                let elapsed = (now - record.last_transition_at).num_seconds();
                decision.allow_sync = false;
                decision.wait_seconds = (self.config.cooldown_seconds - elapsed).max(0);
            }
            BreakerState::HalfOpen => {
                let remaining = self.config.probe_budget.saturating_sub(record.probes_issued);
                decision.is_probe_mode = true;
                decision.probe_budget = remaining;
                if remaining == 0 {
                    let elapsed = (now - record.last_transition_at).num_seconds();
                    decision.allow_sync = false;
                    decision.wait_seconds = (self.config.cooldown_seconds - elapsed).max(0);
                }
            }
        }

        if decision.is_degraded() {
            decision.suggested_batch_size = Some(self.config.degraded_batch_size);
            decision.suggested_forward_window_seconds =
                Some(self.config.degraded_forward_window_seconds);
            decision.suggested_diff_mode = Some(self.config.degraded_diff_mode.clone());
        }
        decision
    }
}
