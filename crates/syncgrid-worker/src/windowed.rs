//! Windowed incremental executor.
//!
//! Walks a host's newest-first history feed forward from the job's cursor
//! one time window at a time. Each round fetches every page of the window,
//! selects the next batch past the cursor, hands it to the sink and
//! persists the cursor before the next round starts, so a crash loses at
//! most the batch in flight and never skips one.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use syncgrid_core::config::WindowConfig;
use syncgrid_core::{
    AdaptiveWindowState, ErrorCategory, FetchWindow, RawRecord, SharedClock, SyncCounts,
    SyncMode, WalkStep, WindowWalker, compute_cursor_target,
};
use syncgrid_state::{BucketStatus, StateStore};

use crate::executor::{ExecutionJob, SyncExecutor, SyncOutcome};

/// One page of a window, newest first.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub records: Vec<RawRecord>,
    pub has_more: bool,
    /// Rate-limit bucket reported alongside the page, if any.
    pub bucket: Option<BucketStatus>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by host")]
    RateLimited {
        retry_after: Option<u64>,
        bucket: Option<BucketStatus>,
    },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

impl FetchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::RateLimited { .. } => ErrorCategory::RateLimited,
            FetchError::Auth(_) => ErrorCategory::Auth,
            FetchError::NotFound(_) => ErrorCategory::NotFound,
            FetchError::Server(_) => ErrorCategory::Server,
            FetchError::Network(_) => ErrorCategory::Network,
            FetchError::Timeout => ErrorCategory::Timeout,
        }
    }
}

/// Remote history feed. Pages are 1-based and newest first.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn get_records(
        &self,
        job: &ExecutionJob,
        window: FetchWindow,
        page: u32,
    ) -> Result<FetchPage, FetchError>;
}

/// Persistence for fetched records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn store_batch(&self, job: &ExecutionJob, records: &[RawRecord]) -> anyhow::Result<SyncCounts>;
}

enum Fetched {
    Records(Vec<RawRecord>),
    /// Page cap hit; the window was shrunk and must be refetched.
    Shrunk,
}

pub struct WindowedExecutor {
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    store: StateStore,
    config: WindowConfig,
    clock: SharedClock,
}

impl WindowedExecutor {
    pub fn new(
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
        store: StateStore,
        config: WindowConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            source,
            sink,
            store,
            config,
            clock,
        }
    }

    fn window_state(&self, job: &ExecutionJob) -> AdaptiveWindowState {
        let c = &self.config;
        let initial = job
            .degraded_forward_window_seconds()
            .unwrap_or(c.initial_window_seconds);
        AdaptiveWindowState::new(
            initial,
            c.min_window_seconds,
            c.max_window_seconds,
            c.shrink_factor,
            c.grow_factor,
            c.commit_threshold,
        )
    }

    fn record_bucket(&self, bucket: &BucketStatus) {
        if let Err(e) = self.store.put_bucket(bucket) {
            warn!(hosting_instance = %bucket.hosting_instance, error = %e, "failed to record bucket");
        }
    }

    async fn fetch_window(
        &self,
        job: &ExecutionJob,
        window: FetchWindow,
        adaptive: &mut AdaptiveWindowState,
    ) -> Result<Fetched, FetchError> {
        let mut records = Vec::new();
        let mut page = 1;
        loop {
            if page > self.config.max_pages && !adaptive.at_min() {
                adaptive.shrink("page_cap");
                return Ok(Fetched::Shrunk);
            }
            let fetched = self.source.get_records(job, window, page).await?;
            if let Some(bucket) = &fetched.bucket {
                self.record_bucket(bucket);
            }
            records.extend(fetched.records);
            if !fetched.has_more {
                return Ok(Fetched::Records(records));
            }
            page += 1;
        }
    }
}

#[async_trait]
impl SyncExecutor for WindowedExecutor {
    async fn execute(&self, job: &ExecutionJob) -> anyhow::Result<SyncOutcome> {
        let now = self.clock.now();
        let batch_size = job
            .degraded_batch_size()
            .unwrap_or(self.config.batch_size)
            .max(1);
        let mut adaptive = self.window_state(job);
        let mut walker = WindowWalker::new(job.cursor_before.clone(), self.config.overlap_seconds);
        let mut counts = SyncCounts::default();
        let mut rounds = 0;

        let degradation = |adaptive: &AdaptiveWindowState, rounds: u32| {
            json!({
                "mode": job.mode.as_str(),
                "window_seconds": adaptive.current_window_seconds(),
                "rate_limit_count": adaptive.rate_limit_count(),
                "batch_size": batch_size,
                "diff_mode": job.degraded_diff_mode(),
                "rounds": rounds,
            })
        };

        while rounds < self.config.max_rounds {
            rounds += 1;
            let window = walker.next_window(adaptive.current_window_seconds(), now);
            let records = match self.fetch_window(job, window, &mut adaptive).await {
                Ok(Fetched::Records(records)) => records,
                Ok(Fetched::Shrunk) => continue,
                Err(FetchError::RateLimited { retry_after, bucket }) => {
                    adaptive.record_rate_limit();
                    if let Some(bucket) = &bucket {
                        self.record_bucket(bucket);
                    }
                    let retry_after = retry_after.or_else(|| {
                        bucket.map(|b| b.seconds_until_reset(self.clock.now()).max(0) as u64)
                    });
                    warn!(job_id = %job.job_id, ?retry_after, "rate limited mid-sync");
                    let mut outcome =
                        SyncOutcome::failure(ErrorCategory::RateLimited, "rate limited by host")
                            .with_progress(walker.cursor().cloned(), counts)
                            .with_degradation(degradation(&adaptive, rounds));
                    outcome.retry_after = retry_after;
                    return Ok(outcome);
                }
                Err(e) => {
                    return Ok(SyncOutcome::failure(e.category(), e.to_string())
                        .with_progress(walker.cursor().cloned(), counts));
                }
            };

            let batch = walker.select(&records, batch_size);
            counts.fetched += batch.len() as u64;
            if !batch.is_empty() {
                let stored = self.sink.store_batch(job, &batch).await?;
                counts.inserted += stored.inserted;
                counts.updated += stored.updated;
                counts.skipped += stored.skipped;
                if let Some(target) = compute_cursor_target(&batch) {
                    self.store
                        .advance_cursor(&job.repo_id, job.job_kind, &target, self.clock.now())?;
                }
            }

            let step = walker.advance(window, &batch, batch_size, now);
            adaptive.observe_round(records.len() as u64);
            debug!(
                job_id = %job.job_id,
                round = rounds,
                since = %window.since,
                until = %window.until,
                fetched = records.len(),
                selected = batch.len(),
                "window round"
            );
            if step == WalkStep::CaughtUp {
                break;
            }
        }

        info!(
            job_id = %job.job_id,
            rounds,
            fetched = counts.fetched,
            inserted = counts.inserted,
            "windowed sync finished"
        );
        let mut outcome = SyncOutcome::success(walker.cursor().cloned(), counts);
        if job.mode != SyncMode::Incremental || adaptive.rate_limit_count() > 0 {
            outcome = outcome.with_degradation(degradation(&adaptive, rounds));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use serde_json::Map;
    use syncgrid_core::{JobKind, JobState, ManualClock, PhysicalKind, Watermark};
    use syncgrid_state::SyncJob;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    /// Serves a fixed history newest first, `page_size` per page.
    struct History {
        records: Vec<RawRecord>,
        page_size: usize,
        rate_limit_on_call: Option<u32>,
        calls: AtomicU32,
    }

    impl History {
        fn new(records: Vec<RawRecord>, page_size: usize) -> Self {
            Self {
                records,
                page_size,
                rate_limit_on_call: None,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordSource for History {
        async fn get_records(
            &self,
            _job: &ExecutionJob,
            window: FetchWindow,
            page: u32,
        ) -> Result<FetchPage, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.rate_limit_on_call == Some(call) {
                return Err(FetchError::RateLimited {
                    retry_after: Some(42),
                    bucket: None,
                });
            }
            let mut matching: Vec<_> = self
                .records
                .iter()
                .filter(|r| window.contains(r.timestamp))
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
            let start = (page as usize - 1) * self.page_size;
            let end = (start + self.page_size).min(matching.len());
            Ok(FetchPage {
                records: matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default(),
                has_more: end < matching.len(),
                bucket: None,
            })
        }
    }

    #[derive(Default)]
    struct Collect {
        ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordSink for Collect {
        async fn store_batch(&self, _job: &ExecutionJob, records: &[RawRecord]) -> anyhow::Result<SyncCounts> {
            let mut ids = self.ids.lock().unwrap();
            ids.extend(records.iter().map(|r| r.id.clone()));
            Ok(SyncCounts {
                fetched: records.len() as u64,
                inserted: records.len() as u64,
                ..SyncCounts::default()
            })
        }
    }

    fn history(n: i64, spacing: i64) -> Vec<RawRecord> {
        (0..n)
            .map(|i| RawRecord::new(format!("r{i:03}"), now() - TimeDelta::seconds((n - i) * spacing)))
            .collect()
    }

    fn execution_job(cursor: Option<Watermark>) -> ExecutionJob {
        let job = SyncJob {
            job_id: "job-1".into(),
            repo_id: "acme/api".into(),
            job_kind: JobKind::Commits,
            physical_kind: PhysicalKind::GithubCommits,
            tenant_id: "acme".into(),
            hosting_instance: "github.com".into(),
            priority: 30,
            mode: SyncMode::Incremental,
            state: JobState::Running,
            lease_owner: Some("w1".into()),
            lease_expires_at: Some(now()),
            attempt_count: 0,
            max_attempts: 3,
            available_at: now(),
            payload: Map::new(),
            last_run_id: None,
            last_error: None,
            created_at: now(),
            updated_at: now(),
        };
        ExecutionJob::new(&job, "run-1", cursor)
    }

    fn config() -> WindowConfig {
        WindowConfig {
            overlap_seconds: 60,
            initial_window_seconds: 3_600,
            min_window_seconds: 600,
            max_window_seconds: 86_400,
            batch_size: 7,
            max_rounds: 200,
            max_pages: 3,
            ..WindowConfig::default()
        }
    }

    fn executor(source: Arc<dyn RecordSource>, sink: Arc<Collect>, store: &StateStore) -> WindowedExecutor {
        WindowedExecutor::new(
            source,
            sink,
            store.clone(),
            config(),
            Arc::new(ManualClock::new(now())),
        )
    }

    #[tokio::test]
    async fn every_record_stored_exactly_once() {
        let store = StateStore::open_in_memory().unwrap();
        let records = history(40, 300);
        let start = Watermark::new(now() - TimeDelta::days(1), "");
        let sink = Arc::new(Collect::default());
        let exec = executor(Arc::new(History::new(records.clone(), 5)), sink.clone(), &store);

        let outcome = exec.execute(&execution_job(Some(start))).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.counts.inserted, 40);

        let ids = sink.ids.lock().unwrap().clone();
        let unique: BTreeSet<_> = ids.iter().cloned().collect();
        assert_eq!(ids.len(), 40);
        assert_eq!(unique.len(), 40);

        let last = records.last().unwrap();
        assert_eq!(outcome.cursor_after, Some(Watermark::new(last.timestamp, last.id.clone())));
        let cursor = store.get_cursor("acme/api", JobKind::Commits).unwrap().unwrap();
        assert_eq!(cursor.watermark.id, "r039");
    }

    #[tokio::test]
    async fn nothing_new_is_no_data() {
        let store = StateStore::open_in_memory().unwrap();
        let records = history(3, 10);
        let last = records.last().unwrap().clone();
        let sink = Arc::new(Collect::default());
        let exec = executor(Arc::new(History::new(records, 5)), sink.clone(), &store);
        let outcome = exec
            .execute(&execution_job(Some(Watermark::new(last.timestamp, last.id))))
            .await
            .unwrap();
        assert_eq!(outcome.run_status(), syncgrid_core::RunStatus::NoData);
        assert!(sink.ids.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_keeps_progress_and_reports_retry_after() {
        let store = StateStore::open_in_memory().unwrap();
        let mut source = History::new(history(40, 300), 50);
        source.rate_limit_on_call = Some(3);
        let sink = Arc::new(Collect::default());
        // Round one stores 4 records, round two a full batch of 7, round three is throttled.
        let start = Watermark::new(now() - TimeDelta::hours(4), "");
        let exec = executor(Arc::new(source), sink.clone(), &store);

        let outcome = exec.execute(&execution_job(Some(start))).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(ErrorCategory::RateLimited));
        assert_eq!(outcome.retry_after, Some(42));
        assert!(outcome.degradation_info.is_some());

        assert_eq!(sink.ids.lock().unwrap().len(), 11);
        assert_eq!(outcome.counts.inserted, 11);
        let cursor = store.get_cursor("acme/api", JobKind::Commits).unwrap().unwrap();
        assert_eq!(Some(cursor.watermark), outcome.cursor_after);
    }

    #[tokio::test]
    async fn page_cap_shrinks_and_refetches() {
        let store = StateStore::open_in_memory().unwrap();
        // 30 records inside the first hour, one page of 2 each: over the cap.
        let records = history(30, 60);
        let source = Arc::new(History::new(records, 2));
        let sink = Arc::new(Collect::default());
        let start = Watermark::new(now() - TimeDelta::hours(1), "");
        let exec = executor(source, sink.clone(), &store);

        let outcome = exec.execute(&execution_job(Some(start))).await.unwrap();
        assert!(outcome.success);
        assert_eq!(sink.ids.lock().unwrap().len(), 30);
    }

    #[tokio::test]
    async fn host_errors_become_categorised_failures() {
        struct Down;

        #[async_trait]
        impl RecordSource for Down {
            async fn get_records(
                &self,
                _job: &ExecutionJob,
                _window: FetchWindow,
                _page: u32,
            ) -> Result<FetchPage, FetchError> {
                Err(FetchError::Auth("401 bad credentials".into()))
            }
        }

        let store = StateStore::open_in_memory().unwrap();
        let exec = executor(Arc::new(Down), Arc::new(Collect::default()), &store);
        let outcome = exec.execute(&execution_job(None)).await.unwrap();
        assert_eq!(outcome.error_category, Some(ErrorCategory::Auth));
        assert!(outcome.error.unwrap().contains("401"));
    }
}
