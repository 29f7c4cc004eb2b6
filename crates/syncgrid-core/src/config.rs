//! syncgrid.toml configuration parser.
//!
//! Every section is optional; missing sections and fields fall back to the
//! defaults below. CLI flags override the file where they overlap.

use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::{BackoffPolicy, ClassificationPolicy, DEFAULT_CREDENTIAL_PATTERNS};
use crate::types::RepoType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting `{setting}` ({hint})")]
    MissingSetting { setting: &'static str, hint: String },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncGridConfig {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub breaker: BreakerConfig,
    pub window: WindowConfig,
    pub classification: ClassificationConfig,
    pub reaper: ReaperConfig,
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the redb database file.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_seconds: u64,
    /// Minimum spacing between syncs of one (repo, kind) pair.
    pub base_interval_seconds: i64,
    /// Failure backoff is `base_interval * 2^min(failures, max_backoff_exponent)`.
    pub max_backoff_exponent: u32,
    pub max_enqueue_per_tick: usize,
    pub max_active_global: usize,
    pub max_active_per_tenant: usize,
    pub max_active_per_instance: usize,
    pub max_enqueue_per_hour_per_instance: u64,
    /// Rate-limit bucket headroom kept free for interactive use.
    pub bucket_reserve: u64,
    pub max_attempts: u32,
    pub health_window_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 60,
            base_interval_seconds: 900,
            max_backoff_exponent: 6,
            max_enqueue_per_tick: 100,
            max_active_global: 500,
            max_active_per_tenant: 100,
            max_active_per_instance: 50,
            max_enqueue_per_hour_per_instance: 600,
            bucket_reserve: 50,
            max_attempts: 5,
            health_window_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_seconds: u64,
    /// Finished jobs and runs older than this are deleted. `0` keeps
    /// history forever.
    pub retention_hours: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            retention_hours: 168,
        }
    }
}

impl ReaperConfig {
    pub fn retention(&self) -> Option<TimeDelta> {
        (self.retention_hours > 0).then(|| TimeDelta::hours(self.retention_hours))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub lease_seconds: i64,
    pub renew_interval_seconds: u64,
    pub heartbeat_max_failures: u32,
    pub heartbeat_join_timeout_seconds: u64,
    pub execution_timeout_seconds: u64,
    pub idle_sleep_seconds: u64,
    pub contention_pause_millis: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 300,
            renew_interval_seconds: 60,
            heartbeat_max_failures: 3,
            heartbeat_join_timeout_seconds: 5,
            execution_timeout_seconds: 3600,
            idle_sleep_seconds: 5,
            contention_pause_millis: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_ratio_threshold: f64,
    pub rate_limit_ratio_threshold: f64,
    /// Softer rate-limit ratio that switches a closed breaker to backfill-only.
    pub backfill_rate_limit_ratio: f64,
    pub min_samples: u32,
    pub window_minutes: i64,
    pub window_max_runs: usize,
    pub cooldown_seconds: i64,
    pub probe_budget: u32,
    pub probe_success_threshold: f64,
    pub degraded_batch_size: u32,
    pub degraded_forward_window_seconds: i64,
    pub degraded_diff_mode: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio_threshold: 0.5,
            rate_limit_ratio_threshold: 0.3,
            backfill_rate_limit_ratio: 0.15,
            min_samples: 5,
            window_minutes: 30,
            window_max_runs: 200,
            cooldown_seconds: 300,
            probe_budget: 3,
            probe_success_threshold: 0.67,
            degraded_batch_size: 20,
            degraded_forward_window_seconds: 3600,
            degraded_diff_mode: "stat".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub overlap_seconds: i64,
    pub initial_window_seconds: i64,
    pub min_window_seconds: i64,
    pub max_window_seconds: i64,
    pub shrink_factor: f64,
    pub grow_factor: f64,
    pub commit_threshold: u64,
    pub batch_size: usize,
    pub max_rounds: u32,
    /// Page cap per window before the window is shrunk and refetched.
    pub max_pages: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            overlap_seconds: 300,
            initial_window_seconds: 86_400,
            min_window_seconds: 900,
            max_window_seconds: 604_800,
            shrink_factor: 0.5,
            grow_factor: 2.0,
            commit_threshold: 500,
            batch_size: 100,
            max_rounds: 50,
            max_pages: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub downgrade_auth_with_credentials: bool,
    pub credential_patterns: Vec<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            downgrade_auth_with_credentials: true,
            credential_patterns: DEFAULT_CREDENTIAL_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClassificationConfig {
    pub fn policy(&self) -> ConfigResult<ClassificationPolicy> {
        ClassificationPolicy::new(
            self.downgrade_auth_with_credentials,
            &self.credential_patterns,
            self.backoff.clone(),
        )
        .map_err(|e| ConfigError::Invalid {
            field: "classification.credential_patterns",
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryConfig {
    pub repo_id: String,
    pub repo_type: RepoType,
    pub hosting_instance: String,
    pub tenant_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SyncGridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: SyncGridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let window = &self.window;
        if window.min_window_seconds <= window.overlap_seconds {
            return Err(ConfigError::Invalid {
                field: "window.min_window_seconds",
                reason: format!(
                    "must exceed window.overlap_seconds ({} <= {})",
                    window.min_window_seconds, window.overlap_seconds
                ),
            });
        }
        if window.max_window_seconds < window.min_window_seconds {
            return Err(ConfigError::Invalid {
                field: "window.max_window_seconds",
                reason: "must be >= window.min_window_seconds".into(),
            });
        }
        if !(window.shrink_factor > 0.0 && window.shrink_factor < 1.0) {
            return Err(ConfigError::Invalid {
                field: "window.shrink_factor",
                reason: "must be in (0, 1)".into(),
            });
        }
        if window.grow_factor <= 1.0 {
            return Err(ConfigError::Invalid {
                field: "window.grow_factor",
                reason: "must be > 1".into(),
            });
        }
        if window.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "window.batch_size",
                reason: "must be > 0".into(),
            });
        }

        let breaker = &self.breaker;
        for (field, value) in [
            ("breaker.failure_ratio_threshold", breaker.failure_ratio_threshold),
            ("breaker.rate_limit_ratio_threshold", breaker.rate_limit_ratio_threshold),
            ("breaker.backfill_rate_limit_ratio", breaker.backfill_rate_limit_ratio),
            ("breaker.probe_success_threshold", breaker.probe_success_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is not a ratio in [0, 1]"),
                });
            }
        }

        let worker = &self.worker;
        if worker.renew_interval_seconds as i64 >= worker.lease_seconds {
            return Err(ConfigError::Invalid {
                field: "worker.renew_interval_seconds",
                reason: format!(
                    "must be shorter than worker.lease_seconds ({})",
                    worker.lease_seconds
                ),
            });
        }
        if worker.renew_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.renew_interval_seconds",
                reason: "must be > 0".into(),
            });
        }

        if self.scheduler.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.max_attempts",
                reason: "must be > 0".into(),
            });
        }

        let reaper = &self.reaper;
        let needed_minutes = self
            .breaker
            .window_minutes
            .max(self.scheduler.health_window_minutes);
        if reaper.retention_hours < 0
            || (reaper.retention_hours > 0 && reaper.retention_hours * 60 < needed_minutes)
        {
            return Err(ConfigError::Invalid {
                field: "reaper.retention_hours",
                reason: format!(
                    "must be 0 or cover the {needed_minutes} minute health window"
                ),
            });
        }

        self.classification.policy()?;
        Ok(())
    }

    /// Database path from the CLI override or `[storage] path`.
    pub fn require_storage_path(&self, cli_override: Option<&Path>) -> ConfigResult<PathBuf> {
        cli_override
            .map(Path::to_path_buf)
            .or_else(|| self.storage.path.clone())
            .ok_or_else(|| ConfigError::MissingSetting {
                setting: "storage.path",
                hint: "set [storage] path in the config file, pass --db, or export SYNCGRID_DB"
                    .to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = SyncGridConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.base_interval_seconds, 900);
        assert_eq!(config.worker.lease_seconds, 300);
        assert_eq!(config.breaker.probe_budget, 3);
        assert_eq!(config.window.overlap_seconds, 300);
        assert!(config.repositories.is_empty());
        assert!(config.storage.path.is_none());
        assert_eq!(config.reaper.retention(), Some(TimeDelta::days(7)));
    }

    #[test]
    fn retention_must_cover_the_health_window() {
        let err = SyncGridConfig::from_toml_str("[reaper]\nretention_hours = 1\n[breaker]\nwindow_minutes = 120\n")
            .unwrap_err();
        assert!(err.to_string().contains("reaper.retention_hours"), "{err}");

        let keep_all = SyncGridConfig::from_toml_str("[reaper]\nretention_hours = 0\n").unwrap();
        assert_eq!(keep_all.reaper.retention(), None);
    }

    #[test]
    fn parses_repositories_and_overrides() {
        let toml_str = r#"
[storage]
path = "/var/lib/syncgrid/state.redb"

[scheduler]
max_enqueue_per_tick = 10

[breaker]
cooldown_seconds = 60

[[repositories]]
repo_id = "acme/api"
repo_type = "github"
hosting_instance = "github.com"
tenant_id = "acme"

[[repositories]]
repo_id = "infra/mirror"
repo_type = "git"
hosting_instance = "git.internal"
tenant_id = "infra"
enabled = false
"#;
        let config = SyncGridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.scheduler.max_enqueue_per_tick, 10);
        assert_eq!(config.scheduler.max_active_global, 500);
        assert_eq!(config.breaker.cooldown_seconds, 60);
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.repositories[0].repo_type, RepoType::Github);
        assert!(config.repositories[0].enabled);
        assert!(!config.repositories[1].enabled);
    }

    #[test]
    fn rejects_window_not_exceeding_overlap() {
        let err = SyncGridConfig::from_toml_str(
            "[window]\noverlap_seconds = 600\nmin_window_seconds = 600\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "window.min_window_seconds",
                ..
            }
        ));
    }

    #[test]
    fn rejects_renew_interval_longer_than_lease() {
        let err = SyncGridConfig::from_toml_str(
            "[worker]\nlease_seconds = 30\nrenew_interval_seconds = 60\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("worker.renew_interval_seconds"));
    }

    #[test]
    fn rejects_bad_credential_pattern() {
        let err = SyncGridConfig::from_toml_str(
            "[classification]\ncredential_patterns = [\"(unclosed\"]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("classification.credential_patterns"));
    }

    #[test]
    fn missing_storage_path_names_the_setting() {
        let config = SyncGridConfig::default();
        let err = config.require_storage_path(None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("storage.path"));
        assert!(msg.contains("--db"));
        assert!(msg.contains("SYNCGRID_DB"));

        let path = config
            .require_storage_path(Some(Path::new("/tmp/x.redb")))
            .unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.redb"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncgrid.toml");
        std::fs::write(&path, "[worker]\nlease_seconds = 120\nrenew_interval_seconds = 30\n").unwrap();
        let config = SyncGridConfig::from_file(&path).unwrap();
        assert_eq!(config.worker.lease_seconds, 120);

        let missing = SyncGridConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
