//! `syncd run`: scheduler, workers and reaper hosted in one process.
//!
//! The store file is locked by whichever process opens it, so a deployment
//! that wants every role against one database runs them here as tasks
//! sharing a single [`StateStore`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use syncgrid_core::{JobKind, SharedClock};
use syncgrid_metrics::{StatusReport, render_prometheus};
use syncgrid_queue::Reaper;
use syncgrid_scheduler::Scheduler;
use syncgrid_state::StateStore;
use syncgrid_worker::RoutingExecutor;

use super::{Context, interval, shutdown_signal, worker};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workers: usize,
    /// Worker ids are `{worker_prefix}-{n}`.
    pub worker_prefix: String,
    pub job_kinds: Vec<JobKind>,
    /// Prometheus textfile rewritten every reaper interval.
    pub metrics_file: Option<PathBuf>,
}

pub async fn run(ctx: &Context, options: RunOptions) -> anyhow::Result<()> {
    run_with(ctx, options, worker::executors(), shutdown_signal()).await
}

pub async fn run_with(
    ctx: &Context,
    options: RunOptions,
    router: RoutingExecutor,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut workers = Vec::with_capacity(options.workers);
    for n in 0..options.workers {
        let worker_id = format!("{}-{n}", options.worker_prefix);
        workers.push(worker::build(ctx, &worker_id, options.job_kinds.clone(), &router)?);
    }
    let scheduler = Scheduler::new(ctx.store.clone(), ctx.clock.clone(), &ctx.config);
    let reaper = Reaper::new(ctx.store.clone(), ctx.clock.clone())
        .with_retention(ctx.config.reaper.retention());
    let tick = interval(None, ctx.config.scheduler.tick_interval_seconds);
    let reap = interval(None, ctx.config.reaper.interval_seconds);

    info!(
        workers = workers.len(),
        tick_secs = tick.as_secs(),
        reap_secs = reap.as_secs(),
        "hosting scheduler, workers and reaper"
    );

    let mut tasks = JoinSet::new();
    let rx = shutdown.clone();
    tasks.spawn(async move { scheduler.run(tick, false, rx).await });
    let rx = shutdown.clone();
    tasks.spawn(async move { reaper.run(reap, false, rx).await });
    for worker in workers {
        let rx = shutdown.clone();
        tasks.spawn(async move { worker.run(rx).await });
    }
    if let Some(path) = options.metrics_file {
        let store = ctx.store.clone();
        let clock = ctx.clock.clone();
        let window = ctx.config.scheduler.health_window_minutes;
        let rx = shutdown.clone();
        tasks.spawn(async move { export_metrics(store, clock, window, path, reap, rx).await });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "hosted task failed");
        }
    }
    info!("all roles stopped");
    Ok(())
}

async fn export_metrics(
    store: StateStore,
    clock: SharedClock,
    window_minutes: i64,
    path: PathBuf,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match write_metrics(&store, clock.now(), window_minutes, &path) {
                    Ok(()) => debug!(path = %path.display(), "metrics written"),
                    Err(e) => warn!(path = %path.display(), error = %e, "metrics export failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Write to a sibling temp file, then rename, so scrapers never see a
/// partial file.
fn write_metrics(
    store: &StateStore,
    now: DateTime<Utc>,
    window_minutes: i64,
    path: &Path,
) -> anyhow::Result<()> {
    let report = StatusReport::collect(store, now, window_minutes)?;
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, render_prometheus(&report))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use syncgrid_core::{JobState, PhysicalKind};
    use syncgrid_worker::{ExecutionJob, SyncExecutor, SyncOutcome};

    const CONFIG: &str = r#"
[worker]
idle_sleep_seconds = 1

[[repositories]]
repo_id = "acme/mirror"
repo_type = "git"
hosting_instance = "git.acme.internal"
tenant_id = "acme"
"#;

    struct NothingNew;

    #[async_trait]
    impl SyncExecutor for NothingNew {
        async fn execute(&self, _job: &ExecutionJob) -> anyhow::Result<SyncOutcome> {
            Ok(SyncOutcome::no_data())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_process_hosts_every_role_on_one_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("syncgrid.toml");
        std::fs::write(&config, CONFIG).unwrap();
        let db = dir.path().join("syncgrid.redb");
        let metrics = dir.path().join("syncgrid.prom");

        let ctx = Context::load(Some(&config), Some(&db)).unwrap();
        let store = ctx.store.clone();
        let router = RoutingExecutor::new().register(PhysicalKind::GitCommits, Arc::new(NothingNew));
        let options = RunOptions {
            workers: 2,
            worker_prefix: "host".into(),
            job_kinds: vec![],
            metrics_file: Some(metrics.clone()),
        };
        let (tx, rx) = watch::channel(false);

        let driver = async {
            // A separate role process cannot open the store meanwhile.
            let err = Context::load(Some(&config), Some(&db)).err().unwrap();
            assert!(format!("{err:#}").contains("syncd run"));

            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            loop {
                let jobs = store.list_jobs().unwrap();
                if jobs.len() == 1 && jobs[0].state == JobState::Completed {
                    break;
                }
                assert!(tokio::time::Instant::now() < deadline, "job never completed: {jobs:?}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            tx.send(true).unwrap();
        };

        let (hosted, ()) = tokio::join!(run_with(&ctx, options, router, rx), driver);
        hosted.unwrap();

        let runs = ctx.store.list_running_runs().unwrap();
        assert!(runs.is_empty());
        let exported = std::fs::read_to_string(&metrics).unwrap();
        assert!(exported.contains("# TYPE syncgrid_jobs gauge"));
    }

    #[tokio::test]
    async fn run_refuses_workers_without_executors() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("syncgrid.toml");
        std::fs::write(&config, CONFIG).unwrap();
        let ctx = Context::load(Some(&config), Some(&dir.path().join("db"))).unwrap();
        let (_tx, rx) = watch::channel(false);
        let options = RunOptions {
            workers: 1,
            worker_prefix: "host".into(),
            job_kinds: vec![],
            metrics_file: None,
        };
        let err = run_with(&ctx, options, RoutingExecutor::new(), rx).await.unwrap_err();
        assert!(err.to_string().contains("git_commits"));
    }
}
