//! Prometheus text exposition format.
//!
//! Renders a [`StatusReport`] for scraping via a textfile collector or a
//! sidecar that shells out to `syncd status --prometheus`.

use syncgrid_state::BreakerState;

use crate::status::StatusReport;

const BREAKER_STATES: [BreakerState; 3] = [
    BreakerState::Closed,
    BreakerState::Open,
    BreakerState::HalfOpen,
];

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} {kind}\n"));
}

/// Escape a label value per the exposition format.
fn label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Render a status report into Prometheus text format.
pub fn render_prometheus(report: &StatusReport) -> String {
    let mut out = String::new();

    header(&mut out, "syncgrid_jobs", "gauge", "Sync jobs by queue state.");
    for (state, count) in &report.jobs {
        out.push_str(&format!("syncgrid_jobs{{state=\"{state}\"}} {count}\n"));
    }

    header(
        &mut out,
        "syncgrid_repositories",
        "gauge",
        "Registered repositories.",
    );
    out.push_str(&format!(
        "syncgrid_repositories{{enabled=\"true\"}} {}\n",
        report.enabled_repositories
    ));
    out.push_str(&format!(
        "syncgrid_repositories{{enabled=\"false\"}} {}\n",
        report.repositories - report.enabled_repositories
    ));

    header(
        &mut out,
        "syncgrid_runs",
        "gauge",
        "Runs started inside the report window, by status.",
    );
    for (status, count) in &report.runs.by_status {
        out.push_str(&format!("syncgrid_runs{{status=\"{status}\"}} {count}\n"));
    }

    header(
        &mut out,
        "syncgrid_run_failures",
        "gauge",
        "Failed runs inside the report window, by error category.",
    );
    for (category, count) in &report.runs.failures_by_category {
        out.push_str(&format!(
            "syncgrid_run_failures{{category=\"{category}\"}} {count}\n"
        ));
    }

    header(
        &mut out,
        "syncgrid_records",
        "gauge",
        "Records processed inside the report window.",
    );
    out.push_str(&format!(
        "syncgrid_records{{op=\"fetched\"}} {}\n",
        report.runs.records_fetched
    ));
    out.push_str(&format!(
        "syncgrid_records{{op=\"inserted\"}} {}\n",
        report.runs.records_inserted
    ));
    out.push_str(&format!(
        "syncgrid_records{{op=\"updated\"}} {}\n",
        report.runs.records_updated
    ));

    if let Some(mean) = report.runs.mean_duration_seconds {
        header(
            &mut out,
            "syncgrid_run_duration_mean_seconds",
            "gauge",
            "Mean wall time of finished runs.",
        );
        out.push_str(&format!("syncgrid_run_duration_mean_seconds {mean:.3}\n"));
    }

    header(
        &mut out,
        "syncgrid_breaker_state",
        "gauge",
        "Circuit breaker state (1 for the current state).",
    );
    for b in &report.breakers {
        for state in BREAKER_STATES {
            out.push_str(&format!(
                "syncgrid_breaker_state{{key=\"{}\",state=\"{}\"}} {}\n",
                label(&b.key),
                state,
                u8::from(b.state == state)
            ));
        }
    }

    header(
        &mut out,
        "syncgrid_breaker_failures",
        "gauge",
        "Failures counted by the breaker since its last transition.",
    );
    for b in &report.breakers {
        out.push_str(&format!(
            "syncgrid_breaker_failures{{key=\"{}\"}} {}\n",
            label(&b.key),
            b.failure_count
        ));
    }

    header(&mut out, "syncgrid_locks_held", "gauge", "Lock rows present.");
    out.push_str(&format!("syncgrid_locks_held {}\n", report.locks.len()));

    header(
        &mut out,
        "syncgrid_bucket_remaining",
        "gauge",
        "Remaining rate-limit quota per hosting instance.",
    );
    for b in &report.buckets {
        out.push_str(&format!(
            "syncgrid_bucket_remaining{{instance=\"{}\"}} {}\n",
            label(&b.hosting_instance),
            b.remaining
        ));
    }

    header(
        &mut out,
        "syncgrid_paused_scopes",
        "gauge",
        "Active operator pauses.",
    );
    out.push_str(&format!(
        "syncgrid_paused_scopes {}\n",
        report.active_pauses.len()
    ));

    header(
        &mut out,
        "syncgrid_cursor_lag_seconds",
        "gauge",
        "Age of the newest synced record per repository and kind.",
    );
    for c in &report.cursors {
        out.push_str(&format!(
            "syncgrid_cursor_lag_seconds{{repo=\"{}\",kind=\"{}\"}} {}\n",
            label(&c.repo_id),
            c.job_kind,
            c.lag_seconds
        ));
    }

    out
}
