use syncgrid_queue::{ReapReport, Reaper};
use syncgrid_state::ReclaimAction;

use super::{Context, interval, shutdown_signal};

pub async fn run(
    ctx: &Context,
    once: bool,
    interval_seconds: Option<u64>,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    let reaper = Reaper::new(ctx.store.clone(), ctx.clock.clone())
        .with_retention(ctx.config.reaper.retention());
    if once {
        let report = reaper.run_once(dry_run)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", summary(&report));
        }
        return Ok(());
    }

    let every = interval(interval_seconds, ctx.config.reaper.interval_seconds);
    reaper.run(every, dry_run, shutdown_signal()).await;
    Ok(())
}

pub(crate) fn summary(report: &ReapReport) -> String {
    let mut out = format!(
        "{}requeued={} dead={} expired_locks={} orphaned_runs={} pruned_jobs={} pruned_runs={}\n",
        if report.dry_run { "[dry run] " } else { "" },
        report.requeued(),
        report.dead(),
        report.expired_locks.len(),
        report.orphaned_runs.len(),
        report.pruned_jobs,
        report.pruned_runs,
    );
    for job in &report.reclaimed_jobs {
        let action = match job.action {
            ReclaimAction::Requeued => "requeue",
            ReclaimAction::Dead => "dead",
        };
        out.push_str(&format!(
            "  {action:<7} {} {}/{} (was {})\n",
            job.job_id,
            job.repo_id,
            job.job_kind,
            job.previous_owner.as_deref().unwrap_or("nobody")
        ));
    }
    for lock in &report.expired_locks {
        out.push_str(&format!(
            "  unlock  {}/{} (held by {})\n",
            lock.repo_id, lock.job_kind, lock.holder_worker_id
        ));
    }
    out
}
