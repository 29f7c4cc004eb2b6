use syncgrid_metrics::{StatusReport, render_prometheus, render_text};

use super::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
    Prometheus,
}

pub fn run(ctx: &Context, format: Format, window_minutes: Option<i64>) -> anyhow::Result<()> {
    let window = window_minutes.unwrap_or(ctx.config.scheduler.health_window_minutes);
    anyhow::ensure!(window > 0, "--window-minutes must be positive, got {window}");
    let report = StatusReport::collect(&ctx.store, ctx.clock.now(), window)?;
    print!("{}", render(&report, format)?);
    Ok(())
}

fn render(report: &StatusReport, format: Format) -> anyhow::Result<String> {
    Ok(match format {
        Format::Text => render_text(report),
        Format::Prometheus => render_prometheus(report),
        Format::Json => serde_json::to_string_pretty(report)? + "\n",
    })
}
