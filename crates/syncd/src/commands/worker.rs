use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use syncgrid_core::{JobKind, PhysicalKind, resolve_physical_kind};
use syncgrid_queue::{DistributedLock, JobQueue};
use syncgrid_worker::{RoutingExecutor, Worker};

use super::{Context, shutdown_signal};

/// Executors compiled into this binary. The stock build ships none, so
/// `syncd worker` only runs where no repository needs one; host adapters
/// plug in here as
/// `RoutingExecutor::register(kind, Arc::new(WindowedExecutor::new(..)))`.
pub(crate) fn executors() -> RoutingExecutor {
    RoutingExecutor::new()
}

pub async fn run(
    ctx: &Context,
    worker_id: &str,
    job_kinds: Vec<JobKind>,
    once: bool,
) -> anyhow::Result<()> {
    run_with(ctx, worker_id, job_kinds, once, executors()).await
}

pub async fn run_with(
    ctx: &Context,
    worker_id: &str,
    job_kinds: Vec<JobKind>,
    once: bool,
    router: RoutingExecutor,
) -> anyhow::Result<()> {
    let worker = build(ctx, worker_id, job_kinds, &router)?;
    if once {
        match worker.process_next().await? {
            Some(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
            None => println!("queue empty"),
        }
        return Ok(());
    }

    info!(worker_id, executors = ?router.kinds(), "starting worker loop");
    worker.run(shutdown_signal()).await;
    Ok(())
}

/// A worker over the context's store, refusing kinds the router cannot run.
pub(crate) fn build(
    ctx: &Context,
    worker_id: &str,
    job_kinds: Vec<JobKind>,
    router: &RoutingExecutor,
) -> anyhow::Result<Worker> {
    anyhow::ensure!(!worker_id.trim().is_empty(), "--worker-id must not be empty");
    let worker = Worker::new(
        worker_id,
        job_kinds,
        JobQueue::new(ctx.store.clone(), ctx.clock.clone()),
        DistributedLock::new(ctx.store.clone(), ctx.clock.clone()),
        Arc::new(router.clone()),
        ctx.config.classification.policy()?,
        ctx.config.worker.clone(),
    );

    let missing = missing_executors(ctx, router, worker.job_kinds())?;
    if !missing.is_empty() {
        let names: Vec<_> = missing.iter().map(PhysicalKind::as_str).collect();
        anyhow::bail!(
            "no executor registered for {}; refusing to claim jobs that would be dead-lettered",
            names.join(", ")
        );
    }
    Ok(worker)
}

/// Physical kinds this worker could claim (from known repositories and its
/// job kinds) that the router cannot serve.
fn missing_executors(
    ctx: &Context,
    router: &RoutingExecutor,
    job_kinds: &[JobKind],
) -> anyhow::Result<BTreeSet<PhysicalKind>> {
    let mut repo_types: BTreeSet<_> = ctx
        .config
        .repositories
        .iter()
        .filter(|r| r.enabled)
        .map(|r| r.repo_type)
        .collect();
    repo_types.extend(
        ctx.store
            .list_repositories()?
            .into_iter()
            .filter(|r| r.enabled)
            .map(|r| r.repo_type),
    );

    let served: BTreeSet<_> = router.kinds().into_iter().collect();
    let mut missing = BTreeSet::new();
    for repo_type in repo_types {
        for &kind in job_kinds {
            if let Some(physical) = resolve_physical_kind(repo_type, kind) {
                if !served.contains(&physical) {
                    missing.insert(physical);
                }
            }
        }
    }
    Ok(missing)
}
