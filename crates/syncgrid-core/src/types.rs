//! Domain enums shared by every SyncGrid crate.
//!
//! All enums serialize as `snake_case` strings so that persisted rows and
//! job payloads stay readable when inspected with `syncd status --json`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when parsing one of the string-backed enums fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value:?}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum.
macro_rules! string_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        what: $what,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ── Job kinds ─────────────────────────────────────────────────────

/// Logical sync kind, independent of the hosting product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "commits")]
    Commits,
    #[serde(rename = "mrs")]
    MergeRequests,
    #[serde(rename = "reviews")]
    Reviews,
}

string_enum!(JobKind, "job kind", {
    Commits => "commits",
    MergeRequests => "mrs",
    Reviews => "reviews",
});

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Commits, JobKind::MergeRequests, JobKind::Reviews];

    /// Base queue priority. Higher values are claimed first.
    pub fn base_priority(&self) -> i32 {
        match self {
            JobKind::Commits => 30,
            JobKind::MergeRequests => 20,
            JobKind::Reviews => 10,
        }
    }
}

/// Hosting product behind a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Github,
    Gitlab,
    /// Plain git remote: history only, no review objects.
    Git,
}

string_enum!(RepoType, "repo type", {
    Github => "github",
    Gitlab => "gitlab",
    Git => "git",
});

/// Host-specific sync kind the executor actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalKind {
    GithubCommits,
    GithubPulls,
    GithubReviews,
    GitlabCommits,
    GitlabMergeRequests,
    GitlabNotes,
    GitCommits,
}

string_enum!(PhysicalKind, "physical kind", {
    GithubCommits => "github_commits",
    GithubPulls => "github_pulls",
    GithubReviews => "github_reviews",
    GitlabCommits => "gitlab_commits",
    GitlabMergeRequests => "gitlab_merge_requests",
    GitlabNotes => "gitlab_notes",
    GitCommits => "git_commits",
});

/// Resolve a logical job kind to the physical kind for a repository type.
///
/// Returns `None` for combinations the host cannot serve (e.g. reviews on a
/// plain git remote); such pairs are never enqueued.
pub fn resolve_physical_kind(repo_type: RepoType, kind: JobKind) -> Option<PhysicalKind> {
    match (repo_type, kind) {
        (RepoType::Github, JobKind::Commits) => Some(PhysicalKind::GithubCommits),
        (RepoType::Github, JobKind::MergeRequests) => Some(PhysicalKind::GithubPulls),
        (RepoType::Github, JobKind::Reviews) => Some(PhysicalKind::GithubReviews),
        (RepoType::Gitlab, JobKind::Commits) => Some(PhysicalKind::GitlabCommits),
        (RepoType::Gitlab, JobKind::MergeRequests) => Some(PhysicalKind::GitlabMergeRequests),
        (RepoType::Gitlab, JobKind::Reviews) => Some(PhysicalKind::GitlabNotes),
        (RepoType::Git, JobKind::Commits) => Some(PhysicalKind::GitCommits),
        (RepoType::Git, _) => None,
    }
}

impl RepoType {
    /// Logical kinds this repository type can be synced for.
    pub fn supported_kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| resolve_physical_kind(*self, *kind).is_some())
            .collect()
    }
}

// ── Job and run lifecycle ─────────────────────────────────────────

/// How a job should fetch: normal incremental sync, a small recovery probe,
/// or a deferred backfill while the host is degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Probe,
    Backfill,
}

string_enum!(SyncMode, "sync mode", {
    Incremental => "incremental",
    Probe => "probe",
    Backfill => "backfill",
});

/// Queue state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Dead,
}

string_enum!(JobState, "job state", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Dead => "dead",
});

impl JobState {
    /// Pending and running jobs occupy the unique-active slot of their pair.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

/// Status of a sync run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    NoData,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    NoData => "no_data",
});

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::NoData)
    }
}

/// Record counters reported by an executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl SyncCounts {
    pub fn merge(&mut self, other: &SyncCounts) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }

    pub fn is_empty(&self) -> bool {
        self.fetched == 0 && self.inserted == 0 && self.updated == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_round_trips_through_strings() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert_eq!(
            serde_json::to_string(&JobKind::MergeRequests).unwrap(),
            "\"mrs\""
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "issues".parse::<JobKind>().unwrap_err();
        assert_eq!(err.what, "job kind");
        assert!(err.to_string().contains("issues"));
    }

    #[test]
    fn plain_git_only_supports_commits() {
        assert_eq!(RepoType::Git.supported_kinds(), vec![JobKind::Commits]);
        assert_eq!(resolve_physical_kind(RepoType::Git, JobKind::Reviews), None);
        assert_eq!(
            resolve_physical_kind(RepoType::Gitlab, JobKind::MergeRequests),
            Some(PhysicalKind::GitlabMergeRequests)
        );
    }

    #[test]
    fn active_states() {
        assert!(JobState::Pending.is_active());
        assert!(JobState::Running.is_active());
        assert!(!JobState::Completed.is_active());
        assert!(!JobState::Dead.is_active());
    }

    #[test]
    fn counts_merge() {
        let mut total = SyncCounts::default();
        assert!(total.is_empty());
        total.merge(&SyncCounts {
            fetched: 10,
            inserted: 7,
            updated: 2,
            skipped: 1,
        });
        total.merge(&SyncCounts {
            fetched: 5,
            ..SyncCounts::default()
        });
        assert_eq!(total.fetched, 15);
        assert_eq!(total.inserted, 7);
        assert!(!total.is_empty());
    }
}
