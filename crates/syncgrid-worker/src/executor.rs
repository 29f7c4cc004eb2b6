//! The executor seam: what a worker hands to host-specific sync code and
//! what it expects back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use syncgrid_core::{
    ErrorCategory, JobKind, PhysicalKind, RunStatus, SyncCounts, SyncMode, Watermark,
    parse_timestamp,
};
use syncgrid_state::{Payload, SyncJob};

/// Job as seen by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub job_id: String,
    pub run_id: String,
    pub repo_id: String,
    pub job_kind: JobKind,
    pub physical_kind: PhysicalKind,
    pub tenant_id: String,
    pub hosting_instance: String,
    pub mode: SyncMode,
    /// Failed attempts before this one.
    pub attempt: u32,
    pub payload: Payload,
    pub cursor_before: Option<Watermark>,
}

impl ExecutionJob {
    pub fn new(job: &SyncJob, run_id: impl Into<String>, cursor_before: Option<Watermark>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            run_id: run_id.into(),
            repo_id: job.repo_id.clone(),
            job_kind: job.job_kind,
            physical_kind: job.physical_kind,
            tenant_id: job.tenant_id.clone(),
            hosting_instance: job.hosting_instance.clone(),
            mode: job.mode,
            attempt: job.attempt_count,
            payload: job.payload.clone(),
            cursor_before,
        }
    }

    fn degraded(&self, key: &str) -> Option<&Value> {
        self.payload.get("degraded").and_then(|d| d.get(key))
    }

    /// Batch size the scheduler asked for while the host recovers.
    pub fn degraded_batch_size(&self) -> Option<usize> {
        self.degraded("batch_size")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    pub fn degraded_forward_window_seconds(&self) -> Option<i64> {
        self.degraded("forward_window_seconds").and_then(Value::as_i64)
    }

    pub fn degraded_diff_mode(&self) -> Option<&str> {
        self.degraded("diff_mode").and_then(Value::as_str)
    }
}

/// Cursor override carried in a job payload.
///
/// Accepts `{"timestamp": "...", "id": "..."}` or a bare timestamp string
/// (which compares below every record at that instant).
pub fn cursor_override(payload: &Payload) -> Option<Watermark> {
    match payload.get("cursor_override")? {
        Value::String(raw) => parse_timestamp(raw).ok().map(|ts| Watermark::new(ts, "")),
        Value::Object(fields) => {
            let ts = fields.get("timestamp")?.as_str()?;
            let id = fields.get("id").and_then(Value::as_str).unwrap_or("");
            parse_timestamp(ts).ok().map(|ts| Watermark::new(ts, id))
        }
        _ => None,
    }
}

/// Structured result of one execution.
///
/// Expected failures (rate limits, auth rejections, host errors) come back
/// as `success = false` with a category rather than as an `Err`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    /// Seconds the host asked us to wait before retrying.
    pub retry_after: Option<u64>,
    pub cursor_after: Option<Watermark>,
    pub counts: SyncCounts,
    pub degradation_info: Option<Value>,
}

impl SyncOutcome {
    pub fn success(cursor_after: Option<Watermark>, counts: SyncCounts) -> Self {
        Self {
            success: true,
            cursor_after,
            counts,
            ..Self::default()
        }
    }

    pub fn no_data() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            error_category: Some(category),
            ..Self::default()
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_progress(mut self, cursor_after: Option<Watermark>, counts: SyncCounts) -> Self {
        self.cursor_after = cursor_after;
        self.counts = counts;
        self
    }

    pub fn with_degradation(mut self, info: Value) -> Self {
        self.degradation_info = Some(info);
        self
    }

    pub fn run_status(&self) -> RunStatus {
        match (self.success, self.counts.is_empty()) {
            (false, _) => RunStatus::Failed,
            (true, true) => RunStatus::NoData,
            (true, false) => RunStatus::Completed,
        }
    }
}

/// Host-specific sync logic.
#[async_trait]
pub trait SyncExecutor: Send + Sync {
    async fn execute(&self, job: &ExecutionJob) -> anyhow::Result<SyncOutcome>;
}
