//! syncd — the SyncGrid daemon.
//!
//! One binary for every role:
//! - `run`: scheduler, workers and reaper together in one process
//! - `scheduler`: decides which (repository, kind) pairs to enqueue
//! - `worker`: claims and executes sync jobs
//! - `reaper`: reclaims lapsed leases and expired locks
//! - `status`: prints queue, run and breaker state
//!
//! The database file is locked by the process that opens it. Roles that
//! must share one store at the same time run under `syncd run`; the single
//! role commands suit one-shot passes and inspection while nothing else
//! holds the file.
//!
//! # Usage
//!
//! ```text
//! syncd --config /etc/syncgrid.toml run --workers 4 --metrics-file /var/lib/node_exporter/syncgrid.prom
//! syncd --config /etc/syncgrid.toml scheduler --once --dry-run
//! syncd --db /var/lib/syncgrid/syncgrid.redb status --prometheus
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use syncgrid_core::{JobKind, redact_credentials};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "syncd",
    about = "SyncGrid: distributed sync scheduling and execution",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to syncgrid.toml.
    #[arg(long, global = true, env = "SYNCGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Database file; overrides `[storage] path`.
    #[arg(long, global = true, env = "SYNCGRID_DB")]
    db: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host scheduler, workers and reaper in one process on one store.
    Run(RunArgs),
    /// Enqueue due sync jobs.
    Scheduler(LoopArgs),
    /// Claim and execute sync jobs with the executors compiled into this
    /// binary.
    ///
    /// The stock build registers no host adapters and refuses to start while
    /// any repository needs one. It is the harness for embedding
    /// `syncgrid-worker` with your own `RecordSource`/`RecordSink`, not a
    /// deployable worker on its own.
    Worker(WorkerArgs),
    /// Reclaim lapsed job leases, expired locks and orphaned runs.
    Reaper(LoopArgs),
    /// Print queue, run, breaker, lock and bucket state.
    Status(StatusArgs),
}

/// Shared by `scheduler` and `reaper`.
#[derive(Args, Debug)]
#[command(group(ArgGroup::new("mode").required(true).args(["once", "run_loop"])))]
struct LoopArgs {
    /// Run a single pass and exit.
    #[arg(long)]
    once: bool,

    /// Run until interrupted.
    #[arg(long = "loop")]
    run_loop: bool,

    /// Seconds between passes in loop mode.
    #[arg(long, requires = "run_loop", conflicts_with = "once")]
    interval_seconds: Option<u64>,

    /// Compute and report without writing.
    #[arg(long)]
    dry_run: bool,

    /// Print the pass report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long, env = "SYNCGRID_WORKER_ID")]
    worker_id: String,

    /// Comma-separated job kinds to claim (default: all).
    #[arg(long, value_delimiter = ',')]
    job_types: Vec<JobKind>,

    /// Process at most one job and exit.
    #[arg(long)]
    once: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Worker tasks to host; `0` runs only scheduler and reaper.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    #[arg(long, env = "SYNCGRID_WORKER_ID", default_value = "syncd")]
    worker_prefix: String,

    /// Comma-separated job kinds the workers claim (default: all).
    #[arg(long, value_delimiter = ',')]
    job_types: Vec<JobKind>,

    /// Rewrite Prometheus metrics to this file every reaper interval.
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long, conflicts_with = "prometheus")]
    json: bool,

    #[arg(long)]
    prometheus: bool,

    /// Run summary window; defaults to `scheduler.health_window_minutes`.
    #[arg(long)]
    window_minutes: Option<i64>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,syncd=debug,syncgrid=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("syncd: {}", redact_credentials(&format!("{e:#}")));
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = commands::Context::load(cli.config.as_deref(), cli.db.as_deref())?;
    match cli.command {
        Command::Run(args) => {
            let options = commands::run::RunOptions {
                workers: args.workers,
                worker_prefix: args.worker_prefix,
                job_kinds: args.job_types,
                metrics_file: args.metrics_file,
            };
            commands::run::run(&ctx, options).await
        }
        Command::Scheduler(args) => {
            commands::scheduler::run(&ctx, args.once, args.interval_seconds, args.dry_run, args.json)
                .await
        }
        Command::Worker(args) => {
            commands::worker::run(&ctx, &args.worker_id, args.job_types, args.once).await
        }
        Command::Reaper(args) => {
            commands::reaper::run(&ctx, args.once, args.interval_seconds, args.dry_run, args.json)
                .await
        }
        Command::Status(args) => {
            let format = if args.json {
                commands::status::Format::Json
            } else if args.prometheus {
                commands::status::Format::Prometheus
            } else {
                commands::status::Format::Text
            };
            commands::status::run(&ctx, format, args.window_minutes)
        }
    }
}
