use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use syncgrid_core::config::BreakerConfig;
use syncgrid_state::{CircuitBreakerRecord, StateStore};

use crate::error::BreakerResult;
use crate::policy::{BreakerDecision, BreakerKey, BreakerPolicy, HealthWindow};

/// Decisions for every known breaker key after one refresh.
#[derive(Debug, Clone, Default)]
pub struct BreakerSnapshot {
    pub decisions: HashMap<String, BreakerDecision>,
    pub records: Vec<CircuitBreakerRecord>,
    /// Rows whose state changed during the refresh.
    pub transitions: usize,
    /// Half-open rows whose spent budget was granted again.
    pub rearmed: usize,
}

impl BreakerSnapshot {
    /// Decision for `key`, or an unrestricted one if no row exists.
    pub fn get(&self, key: &BreakerKey) -> BreakerDecision {
        let key = key.to_string();
        self.decisions
            .get(&key)
            .cloned()
            .unwrap_or_else(|| BreakerDecision::allow_all(key))
    }

    pub fn global(&self) -> BreakerDecision {
        self.get(&BreakerKey::Global)
    }

    pub fn tenant(&self, tenant_id: &str) -> BreakerDecision {
        self.get(&BreakerKey::Tenant(tenant_id.to_string()))
    }

    pub fn instance(&self, hosting_instance: &str) -> BreakerDecision {
        self.get(&BreakerKey::Instance(hosting_instance.to_string()))
    }
}

/// Loads breaker rows and recent runs, applies the policy and saves.
#[derive(Debug, Clone)]
pub struct BreakerRefresher {
    store: StateStore,
    policy: BreakerPolicy,
}

impl BreakerRefresher {
    pub fn new(store: StateStore, config: BreakerConfig) -> Self {
        Self {
            store,
            policy: BreakerPolicy::new(config),
        }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Keys worth tracking: global, every tenant and instance of an enabled
    /// repository, and any key that already has a row.
    fn tracked_keys(&self, existing: &[CircuitBreakerRecord]) -> BreakerResult<BTreeSet<BreakerKey>> {
        let mut keys = BTreeSet::from([BreakerKey::Global]);
        for repo in self.store.list_repositories()? {
            if !repo.enabled {
                continue;
            }
            keys.insert(BreakerKey::Tenant(repo.tenant_id));
            keys.insert(BreakerKey::Instance(repo.hosting_instance));
        }
        for record in existing {
            match record.key.parse::<BreakerKey>() {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(e) => debug!(key = %record.key, error = %e, "skipping unrecognised breaker row"),
            }
        }
        Ok(keys)
    }

    /// Re-evaluate every breaker. With `dry_run` the updated rows are
    /// computed but not saved.
    pub fn refresh(&self, now: DateTime<Utc>, dry_run: bool) -> BreakerResult<BreakerSnapshot> {
        let existing = self.store.list_breakers()?;
        let keys = self.tracked_keys(&existing)?;
        let existing: HashMap<String, CircuitBreakerRecord> = existing
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        let config = self.policy.config();
        let runs = self
            .store
            .list_runs_since(now - TimeDelta::minutes(config.window_minutes))?;

        let mut snapshot = BreakerSnapshot::default();
        for key in keys {
            let name = key.to_string();
            let current = existing.get(&name).cloned().unwrap_or_else(|| {
                // A new row has no transition inside the health window.
                let mut fresh = CircuitBreakerRecord::closed(name.clone(), now);
                fresh.last_transition_at = now - TimeDelta::minutes(config.window_minutes);
                fresh
            });

            let since = self.policy.window_start(&current, now);
            let window = HealthWindow::collect(&key, &runs, since, config.window_max_runs);
            let next = self.policy.evaluate(&current, &window, now);
            // Outcomes from the previous state (or probe round) must not
            // judge the new one.
            let window = if next.last_transition_at != current.last_transition_at {
                if next.state != current.state {
                    snapshot.transitions += 1;
                } else {
                    snapshot.rearmed += 1;
                }
                HealthWindow::default()
            } else {
                window
            };
            let decision = self.policy.decide(&next, &window, now);
            snapshot.decisions.insert(name, decision);
            snapshot.records.push(next);
        }

        if !dry_run {
            self.store.put_breakers(&snapshot.records)?;
        }
        if snapshot.transitions + snapshot.rearmed > 0 {
            info!(
                transitions = snapshot.transitions,
                rearmed = snapshot.rearmed,
                dry_run,
                "breakers refreshed"
            );
        } else {
            debug!(keys = snapshot.records.len(), dry_run, "breakers refreshed");
        }
        Ok(snapshot)
    }
}
