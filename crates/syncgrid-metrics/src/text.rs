//! Operator-facing plain text rendering.

use std::fmt::Write;

use crate::status::StatusReport;

/// Render the report the way `syncd status` prints it.
pub fn render_text(report: &StatusReport) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_report(&mut out, report);
    out
}

fn write_report(out: &mut String, r: &StatusReport) -> std::fmt::Result {
    writeln!(out, "SyncGrid status at {}", r.generated_at.to_rfc3339())?;
    writeln!(
        out,
        "repositories: {} ({} enabled)",
        r.repositories, r.enabled_repositories
    )?;

    let jobs: Vec<String> = r.jobs.iter().map(|(s, n)| format!("{s}={n}")).collect();
    writeln!(out, "jobs: {}", jobs.join(" "))?;

    writeln!(out)?;
    writeln!(out, "runs (last {} min): {}", r.window_minutes, r.runs.total)?;
    for (status, n) in &r.runs.by_status {
        writeln!(out, "  {status:<12} {n}")?;
    }
    if !r.runs.failures_by_category.is_empty() {
        let failures: Vec<String> = r
            .runs
            .failures_by_category
            .iter()
            .map(|(c, n)| format!("{c}={n}"))
            .collect();
        writeln!(out, "  failures: {}", failures.join(" "))?;
    }
    writeln!(
        out,
        "  records: fetched={} inserted={} updated={}",
        r.runs.records_fetched, r.runs.records_inserted, r.runs.records_updated
    )?;
    if let Some(mean) = r.runs.mean_duration_seconds {
        writeln!(out, "  mean duration: {mean:.1}s")?;
    }
    writeln!(out, "  still running: {}", r.running_runs)?;

    if !r.breakers.is_empty() {
        writeln!(out)?;
        writeln!(out, "breakers:")?;
        for b in &r.breakers {
            writeln!(
                out,
                "  {:<32} {:<10} failures={} successes={} rate_limited={} probes={}",
                b.key,
                b.state.as_str(),
                b.failure_count,
                b.success_count,
                b.rate_limited_count,
                b.probes_issued
            )?;
        }
    }

    if !r.locks.is_empty() {
        writeln!(out)?;
        writeln!(out, "locks:")?;
        for l in &r.locks {
            let expiry = if l.expires_in_seconds >= 0 {
                format!("expires in {}s", l.expires_in_seconds)
            } else {
                format!("EXPIRED {}s ago", -l.expires_in_seconds)
            };
            writeln!(
                out,
                "  {}/{} held by {} ({expiry})",
                l.repo_id, l.job_kind, l.holder_worker_id
            )?;
        }
    }

    if !r.buckets.is_empty() {
        writeln!(out)?;
        writeln!(out, "buckets:")?;
        for b in &r.buckets {
            writeln!(
                out,
                "  {:<32} {}/{} resets in {}s",
                b.hosting_instance, b.remaining, b.limit, b.reset_in_seconds
            )?;
        }
    }

    if !r.active_pauses.is_empty() {
        writeln!(out)?;
        writeln!(out, "paused:")?;
        for p in &r.active_pauses {
            writeln!(
                out,
                "  {} until {} ({})",
                p.scope,
                p.paused_until.to_rfc3339(),
                p.reason
            )?;
        }
    }

    if !r.cursors.is_empty() {
        writeln!(out)?;
        writeln!(out, "most lagging cursors:")?;
        for c in r.cursors.iter().take(10) {
            writeln!(out, "  {}/{} {}s behind", c.repo_id, c.job_kind, c.lag_seconds)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::tests::{now, populated_store};

    #[test]
    fn text_lists_every_section() {
        let report = StatusReport::collect(&populated_store(), now(), 60).unwrap();
        let text = render_text(&report);
        assert!(text.contains("jobs: completed=0 dead=0 pending=1 running=1"));
        assert!(text.contains("failures: rate_limited=1"));
        assert!(text.contains("tenant:acme"));
        assert!(text.contains("acme/api/commits held by w1 (expires in 300s)"));
        assert!(text.contains("42/5000 resets in 900s"));
        assert!(text.contains("instance:gitlab.example until"));
        assert!(text.contains("acme/api/commits 7200s behind"));
    }
}
