//! Scheduler → queue → worker, end to end against an on-disk store.
//!
//! Covers the whole loop: a tick enqueues every supported pair, workers
//! drain the queue through the windowed executor, cursors advance, runs are
//! finalized, and the reaper hands a crashed worker's job to someone else.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tempfile::TempDir;

use syncgrid_core::config::WindowConfig;
use syncgrid_core::{
    ClassificationPolicy, Clock, FetchWindow, JobKind, JobState, ManualClock, PhysicalKind, RawRecord,
    RunStatus, SharedClock, SyncCounts, SyncGridConfig,
};
use syncgrid_queue::{DistributedLock, JobQueue, Reaper};
use syncgrid_scheduler::Scheduler;
use syncgrid_state::StateStore;
use syncgrid_worker::*;

const CONFIG: &str = r#"
[scheduler]
base_interval_seconds = 600

[[repositories]]
repo_id = "acme/api"
repo_type = "github"
hosting_instance = "github.com"
tenant_id = "acme"
"#;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
}

/// Newest-first feed over a shared, growable history.
#[derive(Default)]
struct FakeHost {
    records: Mutex<Vec<RawRecord>>,
}

impl FakeHost {
    fn push(&self, id: &str, at: DateTime<Utc>) {
        self.records.lock().unwrap().push(RawRecord::new(id, at));
    }
}

#[async_trait]
impl RecordSource for FakeHost {
    async fn get_records(
        &self,
        _job: &ExecutionJob,
        window: FetchWindow,
        page: u32,
    ) -> Result<FetchPage, FetchError> {
        let mut matching: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        let per_page = 10;
        let start = (page as usize - 1) * per_page;
        let end = (start + per_page).min(matching.len());
        Ok(FetchPage {
            records: matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default(),
            has_more: end < matching.len(),
            bucket: None,
        })
    }
}

#[derive(Default)]
struct LocalStore {
    ids: Mutex<Vec<String>>,
}

#[async_trait]
impl RecordSink for LocalStore {
    async fn store_batch(&self, _job: &ExecutionJob, records: &[RawRecord]) -> anyhow::Result<SyncCounts> {
        let mut ids = self.ids.lock().unwrap();
        let mut counts = SyncCounts::default();
        for record in records {
            counts.fetched += 1;
            if ids.contains(&record.id) {
                counts.skipped += 1;
            } else {
                ids.push(record.id.clone());
                counts.inserted += 1;
            }
        }
        Ok(counts)
    }
}

struct NothingNew;

#[async_trait]
impl SyncExecutor for NothingNew {
    async fn execute(&self, _job: &ExecutionJob) -> anyhow::Result<SyncOutcome> {
        Ok(SyncOutcome::no_data())
    }
}

struct Env {
    _dir: TempDir,
    store: StateStore,
    clock: ManualClock,
    scheduler: Scheduler,
    host: Arc<FakeHost>,
    sink: Arc<LocalStore>,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&dir.path().join("syncgrid.redb")).unwrap();
        let clock = ManualClock::new(start());
        let config = SyncGridConfig::from_toml_str(CONFIG).unwrap();
        let scheduler = Scheduler::new(store.clone(), self_clock(&clock), &config);
        Self {
            _dir: dir,
            store,
            clock,
            scheduler,
            host: Arc::default(),
            sink: Arc::default(),
        }
    }

    fn worker(&self, id: &str) -> Worker {
        let shared = self_clock(&self.clock);
        let windowed = WindowedExecutor::new(
            self.host.clone(),
            self.sink.clone(),
            self.store.clone(),
            WindowConfig {
                max_window_seconds: 4_000_000_000,
                max_rounds: 100,
                ..WindowConfig::default()
            },
            shared.clone(),
        );
        let router = RoutingExecutor::new()
            .register(PhysicalKind::GithubCommits, Arc::new(windowed))
            .register(PhysicalKind::GithubPulls, Arc::new(NothingNew))
            .register(PhysicalKind::GithubReviews, Arc::new(NothingNew));
        Worker::new(
            id,
            vec![],
            JobQueue::new(self.store.clone(), shared.clone()),
            DistributedLock::new(self.store.clone(), shared),
            Arc::new(router),
            ClassificationPolicy::default(),
            Default::default(),
        )
    }

    async fn drain(&self, worker: &Worker) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = worker.process_next().await.unwrap() {
            outcomes.push(outcome);
        }
        outcomes
    }

    fn jobs_in(&self, state: JobState) -> usize {
        self.store
            .list_jobs()
            .unwrap()
            .iter()
            .filter(|j| j.state == state)
            .count()
    }
}

fn self_clock(clock: &ManualClock) -> SharedClock {
    Arc::new(clock.clone())
}

#[tokio::test]
async fn tick_then_worker_syncs_every_pair() {
    let env = Env::new();
    for i in 0..25 {
        env.host
            .push(&format!("c{i:02}"), start() - TimeDelta::hours(48) + TimeDelta::minutes(i * 7));
    }

    let report = env.scheduler.tick(false).unwrap();
    assert_eq!(report.enqueued, 3);

    let worker = env.worker("w1");
    let outcomes = env.drain(&worker).await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| matches!(o, JobOutcome::Completed { .. })));
    assert_eq!(env.jobs_in(JobState::Completed), 3);

    let runs = env.store.list_runs_since(start() - TimeDelta::days(1)).unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.finished_at.is_some()));
    let statuses: Vec<_> = runs.iter().map(|r| (r.job_kind, r.status)).collect();
    assert!(statuses.contains(&(JobKind::Commits, RunStatus::Completed)));
    assert!(statuses.contains(&(JobKind::Reviews, RunStatus::NoData)));

    assert_eq!(env.sink.ids.lock().unwrap().len(), 25);
    let cursor = env.store.get_cursor("acme/api", JobKind::Commits).unwrap().unwrap();
    assert_eq!(cursor.watermark.id, "c24");
    assert!(env.store.list_locks().unwrap().is_empty());
}

#[tokio::test]
async fn next_cycle_picks_up_only_new_records() {
    let env = Env::new();
    env.host.push("old", start() - TimeDelta::hours(2));
    env.scheduler.tick(false).unwrap();
    let worker = env.worker("w1");
    env.drain(&worker).await;

    // Not due yet: the pairs synced moments ago.
    env.clock.advance_secs(60);
    assert_eq!(env.scheduler.tick(false).unwrap().enqueued, 0);

    env.host.push("new", env.clock.now() - TimeDelta::seconds(30));
    env.clock.advance_secs(600);
    assert_eq!(env.scheduler.tick(false).unwrap().enqueued, 3);
    env.drain(&worker).await;

    let ids = env.sink.ids.lock().unwrap().clone();
    assert_eq!(ids, vec!["old".to_string(), "new".to_string()]);
    let cursor = env.store.get_cursor("acme/api", JobKind::Commits).unwrap().unwrap();
    assert_eq!(cursor.watermark.id, "new");
}

#[tokio::test]
async fn reaper_hands_crashed_job_to_another_worker() {
    let env = Env::new();
    env.host.push("c0", start() - TimeDelta::hours(1));
    env.scheduler.tick(false).unwrap();

    // A worker claims the commits job and dies holding lease and lock.
    let shared = self_clock(&env.clock);
    let queue = JobQueue::new(env.store.clone(), shared.clone());
    let crashed = queue.claim("crashed", &[JobKind::Commits], 300).unwrap().unwrap();
    assert!(DistributedLock::new(env.store.clone(), shared.clone()).acquire(
        "acme/api",
        JobKind::Commits,
        "crashed",
        300
    ));

    let survivor = env.worker("w2");
    env.drain(&survivor).await;
    assert_eq!(env.store.get_job(&crashed.job_id).unwrap().unwrap().state, JobState::Running);

    env.clock.advance_secs(301);
    let report = Reaper::new(env.store.clone(), shared).run_once(false).unwrap();
    assert_eq!(report.requeued(), 1);
    assert_eq!(report.expired_locks.len(), 1);

    let outcomes = env.drain(&survivor).await;
    assert_eq!(outcomes.len(), 1);
    let job = env.store.get_job(&crashed.job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(env.sink.ids.lock().unwrap().as_slice(), ["c0".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_a_pair() {
    let env = Env::new();
    for i in 0..40 {
        env.host.push(&format!("c{i:02}"), start() - TimeDelta::minutes(200 - i * 5));
    }
    env.scheduler.tick(false).unwrap();

    let workers: Vec<_> = (0..4).map(|i| Arc::new(env.worker(&format!("w{i}")))).collect();
    let mut handles = Vec::new();
    for worker in &workers {
        let worker = Arc::clone(worker);
        handles.push(tokio::spawn(async move {
            let mut done = Vec::new();
            while let Some(outcome) = worker.process_next().await.unwrap() {
                done.push(outcome);
            }
            done
        }));
    }
    let mut completed = Vec::new();
    for handle in handles {
        completed.extend(handle.await.unwrap());
    }

    let job_ids: BTreeSet<_> = completed
        .iter()
        .filter(|o| matches!(o, JobOutcome::Completed { .. }))
        .map(|o| o.job_id().to_string())
        .collect();
    assert_eq!(job_ids.len(), 3);
    assert_eq!(env.jobs_in(JobState::Completed), 3);

    let ids = env.sink.ids.lock().unwrap().clone();
    let unique: BTreeSet<_> = ids.iter().collect();
    assert_eq!(ids.len(), 40);
    assert_eq!(unique.len(), 40);
}
