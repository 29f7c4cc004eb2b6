use syncgrid_scheduler::{Scheduler, TickReport};

use super::{Context, interval, shutdown_signal};

pub async fn run(
    ctx: &Context,
    once: bool,
    interval_seconds: Option<u64>,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(ctx.store.clone(), ctx.clock.clone(), &ctx.config);
    if once {
        let report = scheduler.tick(dry_run)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", summary(&report));
        }
        return Ok(());
    }

    let every = interval(interval_seconds, ctx.config.scheduler.tick_interval_seconds);
    scheduler.run(every, dry_run, shutdown_signal()).await;
    Ok(())
}

fn summary(report: &TickReport) -> String {
    let mut out = format!(
        "{}repositories={} planned={} enqueued={} already_active={} skipped={} errors={}\n",
        if report.dry_run { "[dry run] " } else { "" },
        report.repositories,
        report.planned.len(),
        report.enqueued,
        report.already_active,
        report.skipped.len(),
        report.errors.len(),
    );
    for planned in &report.planned {
        out.push_str(&format!(
            "  + {}/{} mode={} priority={}\n",
            planned.repo_id, planned.job_kind, planned.mode, planned.priority
        ));
    }
    for (reason, count) in report.skip_counts() {
        out.push_str(&format!("  skipped {reason}: {count}\n"));
    }
    for failure in &report.errors {
        out.push_str(&format!(
            "  ! {}/{}: {}\n",
            failure.repo_id, failure.job_kind, failure.error
        ));
    }
    out
}
