//! Error taxonomy and terminal-action resolution for failed sync runs.
//!
//! Executors report an [`ErrorCategory`]; the worker turns it into a
//! [`Disposition`] (dead-letter, requeue, or retry with backoff) through a
//! [`ClassificationPolicy`].
//!
//! # Auth downgrade heuristic
//!
//! Hard auth rejections are normally permanent. When the error text still
//! contains something that looks like a live credential (a token prefix, a
//! bearer header) the failure is most likely a rotation race, so it is
//! retried as transient instead. The patterns are configurable and the
//! heuristic can be switched off; it is a policy knob, not an invariant.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default credential-fragment patterns used by the auth downgrade heuristic
/// and by [`redact_credentials`].
pub const DEFAULT_CREDENTIAL_PATTERNS: &[&str] = &[
    r"gh[pousr]_[A-Za-z0-9]{8,}",
    r"github_pat_[A-Za-z0-9_]{8,}",
    r"glpat-[A-Za-z0-9_\-]{8,}",
    r"(?i)bearer\s+[A-Za-z0-9._\-]{8,}",
    r"(?i)(?:token|access_token|private_token)=[A-Za-z0-9._\-]{8,}",
];

const REDACTED: &str = "[REDACTED]";

/// Failure category reported by an executor or assigned by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    InvalidConfig,
    NotFound,
    Network,
    Server,
    Timeout,
    RateLimited,
    LockHeld,
    NoNewData,
    LeaseLost,
    Exception,
    Unknown,
}

/// Coarse class of an error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Permanent,
    Transient,
    RateLimited,
    Ignorable,
    LeaseLost,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::InvalidConfig => "invalid_config",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Network => "network",
            ErrorCategory::Server => "server",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::LockHeld => "lock_held",
            ErrorCategory::NoNewData => "no_new_data",
            ErrorCategory::LeaseLost => "lease_lost",
            ErrorCategory::Exception => "exception",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Static class, before any message-dependent policy is applied.
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCategory::Auth | ErrorCategory::InvalidConfig | ErrorCategory::NotFound => {
                ErrorClass::Permanent
            }
            ErrorCategory::RateLimited => ErrorClass::RateLimited,
            ErrorCategory::LockHeld | ErrorCategory::NoNewData => ErrorClass::Ignorable,
            ErrorCategory::LeaseLost => ErrorClass::LeaseLost,
            ErrorCategory::Network
            | ErrorCategory::Server
            | ErrorCategory::Timeout
            | ErrorCategory::Exception
            | ErrorCategory::Unknown => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal queue action for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Dead-letter; excluded from future claims.
    Dead,
    /// Back to pending immediately without an attempt penalty.
    Requeue,
    /// Back to pending after `backoff_seconds`, attempt count incremented.
    Retry { backoff_seconds: u64 },
}

/// Category-specific default retry delays, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    pub network: u64,
    pub server: u64,
    pub timeout: u64,
    pub rate_limited: u64,
    pub lease_lost: u64,
    pub exception: u64,
    pub unknown: u64,
    /// Upper bound for the attempt-scaled delay. `retry_after` is not capped.
    pub max_backoff_seconds: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            network: 60,
            server: 120,
            timeout: 120,
            rate_limited: 300,
            lease_lost: 30,
            exception: 300,
            unknown: 120,
            max_backoff_seconds: 3600,
        }
    }
}

impl BackoffPolicy {
    fn base_for(&self, category: ErrorCategory) -> u64 {
        match category {
            ErrorCategory::Network => self.network,
            ErrorCategory::Server => self.server,
            ErrorCategory::Timeout => self.timeout,
            ErrorCategory::RateLimited => self.rate_limited,
            ErrorCategory::LeaseLost => self.lease_lost,
            ErrorCategory::Exception => self.exception,
            _ => self.unknown,
        }
    }

    /// Delay before the next attempt.
    ///
    /// A host-supplied `retry_after` wins. Otherwise the category default is
    /// doubled per previous attempt and capped at `max_backoff_seconds`.
    pub fn backoff_for(
        &self,
        category: ErrorCategory,
        attempt: u32,
        retry_after: Option<u64>,
    ) -> u64 {
        if let Some(retry_after) = retry_after {
            return retry_after.max(1);
        }
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_for(category)
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_seconds)
            .max(1)
    }
}

/// Turns error categories plus messages into queue dispositions.
#[derive(Debug, Clone)]
pub struct ClassificationPolicy {
    /// Retry auth failures whose message still carries a live credential.
    pub downgrade_auth_with_credentials: bool,
    credential_patterns: Vec<Regex>,
    pub backoff: BackoffPolicy,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            downgrade_auth_with_credentials: true,
            credential_patterns: default_patterns().to_vec(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClassificationPolicy {
    /// Build a policy from configured regex patterns.
    pub fn new(
        downgrade_auth_with_credentials: bool,
        patterns: &[String],
        backoff: BackoffPolicy,
    ) -> Result<Self, regex::Error> {
        let credential_patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            downgrade_auth_with_credentials,
            credential_patterns,
            backoff,
        })
    }

    /// Whether `message` contains something that looks like a live credential.
    pub fn contains_live_credential(&self, message: &str) -> bool {
        self.credential_patterns.iter().any(|re| re.is_match(message))
    }

    /// Class of a failure after applying the auth downgrade heuristic.
    pub fn effective_class(&self, category: ErrorCategory, message: &str) -> ErrorClass {
        if category == ErrorCategory::Auth
            && self.downgrade_auth_with_credentials
            && self.contains_live_credential(message)
        {
            warn!(
                category = %category,
                "auth failure carries a credential fragment, retrying as transient"
            );
            return ErrorClass::Transient;
        }
        category.class()
    }

    /// Resolve the queue action for a failure.
    ///
    /// `attempt` is the attempt number that just failed (1-based).
    pub fn disposition(
        &self,
        category: ErrorCategory,
        message: &str,
        attempt: u32,
        retry_after: Option<u64>,
    ) -> Disposition {
        match self.effective_class(category, message) {
            ErrorClass::Permanent => Disposition::Dead,
            ErrorClass::Ignorable => Disposition::Requeue,
            ErrorClass::RateLimited | ErrorClass::Transient | ErrorClass::LeaseLost => {
                let backoff_category = if category == ErrorCategory::Auth {
                    ErrorCategory::Unknown
                } else {
                    category
                };
                Disposition::Retry {
                    backoff_seconds: self.backoff.backoff_for(
                        backoff_category,
                        attempt,
                        retry_after,
                    ),
                }
            }
        }
    }

    /// Replace credential fragments in `message` with a placeholder.
    pub fn redact(&self, message: &str) -> String {
        redact_with(&self.credential_patterns, message)
    }
}

fn default_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DEFAULT_CREDENTIAL_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn redact_with(patterns: &[Regex], message: &str) -> String {
    let mut out = message.to_string();
    for re in patterns {
        out = re.replace_all(&out, REDACTED).into_owned();
    }
    out
}

/// Redact credential fragments using the default patterns.
pub fn redact_credentials(message: &str) -> String {
    redact_with(default_patterns(), message)
}
