//! Worker: claim → lock → run → settle → release.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::error::Elapsed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use syncgrid_core::config::WorkerConfig;
use syncgrid_core::{ClassificationPolicy, Disposition, ErrorCategory, JobKind, RunStatus};
use syncgrid_queue::{DistributedLock, JobQueue};
use syncgrid_state::{RunFinish, SyncJob, SyncRun};

use crate::error::{WorkerError, WorkerResult};
use crate::executor::{ExecutionJob, SyncExecutor, SyncOutcome, cursor_override};
use crate::heartbeat::{AbortReason, HeartbeatManager};

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Run finished `completed` or `no_data` and the job was acked.
    Completed {
        job_id: String,
        run_id: String,
        status: RunStatus,
    },
    Retried {
        job_id: String,
        run_id: String,
        category: ErrorCategory,
        backoff_seconds: u64,
    },
    Dead {
        job_id: String,
        run_id: String,
        category: ErrorCategory,
    },
    /// Ignorable failure, back to pending with no attempt counted.
    Requeued {
        job_id: String,
        run_id: String,
        category: ErrorCategory,
    },
    /// Another worker holds the lock; the job went back untouched.
    LockHeld { job_id: String },
    /// The run was recorded but the job is no longer ours to transition.
    Abandoned { job_id: String, run_id: String },
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            JobOutcome::Completed { job_id, .. }
            | JobOutcome::Retried { job_id, .. }
            | JobOutcome::Dead { job_id, .. }
            | JobOutcome::Requeued { job_id, .. }
            | JobOutcome::LockHeld { job_id }
            | JobOutcome::Abandoned { job_id, .. } => job_id,
        }
    }
}

enum Finished {
    Joined(Result<Result<anyhow::Result<SyncOutcome>, JoinError>, Elapsed>),
    Aborted(AbortReason),
}

/// Executor result after the timeout and heartbeat guards.
struct Guarded {
    outcome: SyncOutcome,
    /// Set when the executor raised or panicked.
    exception: Option<String>,
}

pub struct Worker {
    worker_id: String,
    job_kinds: Vec<JobKind>,
    queue: JobQueue,
    lock: DistributedLock,
    executor: Arc<dyn SyncExecutor>,
    policy: ClassificationPolicy,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        job_kinds: Vec<JobKind>,
        queue: JobQueue,
        lock: DistributedLock,
        executor: Arc<dyn SyncExecutor>,
        policy: ClassificationPolicy,
        config: WorkerConfig,
    ) -> Self {
        let job_kinds = if job_kinds.is_empty() {
            JobKind::ALL.to_vec()
        } else {
            job_kinds
        };
        Self {
            worker_id: worker_id.into(),
            job_kinds,
            queue,
            lock,
            executor,
            policy,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn job_kinds(&self) -> &[JobKind] {
        &self.job_kinds
    }

    /// Process one job if any is claimable. `false` means the queue was empty.
    pub async fn process_one_job(&self) -> WorkerResult<bool> {
        Ok(self.process_next().await?.is_some())
    }

    /// Claim and fully process the next job.
    ///
    /// An executor that raised is reported as [`WorkerError::Executor`],
    /// but only after its run record and queue transition were written.
    pub async fn process_next(&self) -> WorkerResult<Option<JobOutcome>> {
        let Some(job) = self
            .queue
            .claim(&self.worker_id, &self.job_kinds, self.config.lease_seconds)?
        else {
            return Ok(None);
        };
        info!(
            worker_id = %self.worker_id,
            job_id = %job.job_id,
            repo_id = %job.repo_id,
            job_kind = %job.job_kind,
            mode = %job.mode,
            attempt = job.attempt_count + 1,
            "claimed job"
        );

        if !self.lock.acquire(
            &job.repo_id,
            job.job_kind,
            &self.worker_id,
            self.config.lease_seconds,
        ) {
            self.queue
                .requeue_without_penalty(&job.job_id, &self.worker_id, "lock_held")?;
            debug!(job_id = %job.job_id, "lock held elsewhere, requeued");
            return Ok(Some(JobOutcome::LockHeld { job_id: job.job_id }));
        }

        let result = self.run_locked(&job).await;
        self.lock.release(&job.repo_id, job.job_kind, &self.worker_id);
        result.map(Some)
    }

    async fn run_locked(&self, job: &SyncJob) -> WorkerResult<JobOutcome> {
        let store = self.queue.store();
        let clock = self.queue.clock();

        let cursor_before = match cursor_override(&job.payload) {
            Some(cursor) => {
                info!(job_id = %job.job_id, cursor = ?cursor, "using cursor override");
                Some(cursor)
            }
            None => store
                .get_cursor(&job.repo_id, job.job_kind)?
                .map(|c| c.watermark),
        };
        let run_id = Uuid::new_v4().to_string();
        let run = SyncRun::start(
            run_id.clone(),
            job,
            &self.worker_id,
            cursor_before.clone(),
            clock.now(),
        );
        store.insert_run(&run)?;

        let heartbeat = HeartbeatManager::start(
            self.queue.clone(),
            self.lock.clone(),
            job,
            &self.worker_id,
            &self.config,
        );
        let guarded = self
            .execute_guarded(ExecutionJob::new(job, run_id.clone(), cursor_before), &heartbeat)
            .await;
        // An abort that lands after the executor returned still voids the result.
        let late_abort = heartbeat.abort_reason();
        heartbeat.stop().await;

        let Guarded { mut outcome, exception } = guarded;
        if let Some(reason) = late_abort {
            if outcome.error_category != Some(ErrorCategory::LeaseLost) {
                outcome = lease_lost(reason, &outcome);
            }
        }

        let settled = self.settle(job, &run_id, &outcome)?;
        match exception {
            Some(message) => Err(WorkerError::Executor {
                job_id: job.job_id.clone(),
                message,
            }),
            None => Ok(settled),
        }
    }

    async fn execute_guarded(&self, exec_job: ExecutionJob, heartbeat: &HeartbeatManager) -> Guarded {
        let executor = Arc::clone(&self.executor);
        let mut task = tokio::spawn(async move { executor.execute(&exec_job).await });
        let limit = Duration::from_secs(self.config.execution_timeout_seconds.max(1));

        let finished = tokio::select! {
            joined = tokio::time::timeout(limit, &mut task) => Finished::Joined(joined),
            reason = heartbeat.aborted() => Finished::Aborted(reason),
        };

        match finished {
            Finished::Joined(Ok(Ok(Ok(outcome)))) => Guarded {
                outcome,
                exception: None,
            },
            Finished::Joined(Ok(Ok(Err(e)))) => exception(format!("{e:#}")),
            Finished::Joined(Ok(Err(join))) => exception(describe_join_error(&join)),
            Finished::Joined(Err(_elapsed)) => {
                task.abort();
                Guarded {
                    outcome: SyncOutcome::failure(
                        ErrorCategory::Timeout,
                        format!("execution exceeded {}s", limit.as_secs()),
                    ),
                    exception: None,
                }
            }
            Finished::Aborted(reason) => {
                warn!(worker_id = %self.worker_id, %reason, "abandoning execution");
                task.abort();
                Guarded {
                    outcome: lease_lost(reason, &SyncOutcome::default()),
                    exception: None,
                }
            }
        }
    }

    /// Finish the run, move the cursor and apply the queue transition.
    fn settle(&self, job: &SyncJob, run_id: &str, outcome: &SyncOutcome) -> WorkerResult<JobOutcome> {
        let store = self.queue.store();
        let clock = self.queue.clock();
        let finish = self.run_finish(outcome);

        if finish.status.is_success() {
            if let Some(cursor) = &outcome.cursor_after {
                store.advance_cursor(&job.repo_id, job.job_kind, cursor, clock.now())?;
            }
        }
        store.finish_run(run_id, &finish, clock.now())?;

        let job_id = job.job_id.clone();
        let run_id = run_id.to_string();
        if finish.status.is_success() {
            info!(
                %job_id,
                %run_id,
                status = %finish.status,
                fetched = finish.counts.fetched,
                inserted = finish.counts.inserted,
                "run succeeded"
            );
            return Ok(if self.queue.ack(&job_id, &self.worker_id, &run_id)? {
                JobOutcome::Completed {
                    job_id,
                    run_id,
                    status: finish.status,
                }
            } else {
                JobOutcome::Abandoned { job_id, run_id }
            });
        }

        let category = finish.error_category.unwrap_or(ErrorCategory::Unknown);
        let raw_error = outcome.error.as_deref().unwrap_or(category.as_str());
        let summary = finish.error_summary.as_deref().unwrap_or(category.as_str());
        let attempt = job.attempt_count.saturating_add(1);
        let disposition = self
            .policy
            .disposition(category, raw_error, attempt, outcome.retry_after);
        warn!(%job_id, %run_id, %category, attempt, ?disposition, error = %summary, "run failed");

        let (applied, settled) = match disposition {
            Disposition::Dead => (
                self.queue.mark_dead(&job_id, &self.worker_id, summary)?,
                JobOutcome::Dead {
                    job_id: job_id.clone(),
                    run_id: run_id.clone(),
                    category,
                },
            ),
            Disposition::Requeue => (
                self.queue
                    .requeue_without_penalty(&job_id, &self.worker_id, summary)?,
                JobOutcome::Requeued {
                    job_id: job_id.clone(),
                    run_id: run_id.clone(),
                    category,
                },
            ),
            Disposition::Retry { .. } if attempt >= job.max_attempts => {
                let message = format!("attempts exhausted ({attempt}/{}): {summary}", job.max_attempts);
                (
                    self.queue.mark_dead(&job_id, &self.worker_id, &message)?,
                    JobOutcome::Dead {
                        job_id: job_id.clone(),
                        run_id: run_id.clone(),
                        category,
                    },
                )
            }
            Disposition::Retry { backoff_seconds } => (
                self.queue
                    .fail_retry(&job_id, &self.worker_id, summary, backoff_seconds)?,
                JobOutcome::Retried {
                    job_id: job_id.clone(),
                    run_id: run_id.clone(),
                    category,
                    backoff_seconds,
                },
            ),
        };

        Ok(if applied {
            settled
        } else {
            JobOutcome::Abandoned { job_id, run_id }
        })
    }

    fn run_finish(&self, outcome: &SyncOutcome) -> RunFinish {
        let status = outcome.run_status();
        let (error_summary, error_category) = if status == RunStatus::Failed {
            let category = outcome.error_category.unwrap_or(ErrorCategory::Unknown);
            let summary = outcome
                .error
                .as_deref()
                .map(|e| self.policy.redact(e))
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| category.as_str().to_string());
            (Some(summary), Some(category))
        } else {
            (None, None)
        };
        RunFinish {
            status,
            cursor_after: outcome.cursor_after.clone(),
            counts: outcome.counts,
            error_summary,
            error_category,
            degradation_info: outcome.degradation_info.clone(),
        }
    }

    /// Process jobs until `shutdown` flips. Sleeps `idle_sleep_seconds` on an
    /// empty queue and `contention_pause_millis` after lock contention.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_secs(self.config.idle_sleep_seconds.max(1));
        let contention = Duration::from_millis(self.config.contention_pause_millis);
        info!(
            worker_id = %self.worker_id,
            job_kinds = ?self.job_kinds,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.process_next().await {
                Ok(None) => idle,
                Ok(Some(JobOutcome::LockHeld { .. })) => contention,
                Ok(Some(outcome)) => {
                    debug!(job_id = %outcome.job_id(), ?outcome, "job settled");
                    Duration::ZERO
                }
                Err(e @ WorkerError::Executor { .. }) => {
                    error!(error = %e, "executor raised");
                    Duration::ZERO
                }
                Err(e) => {
                    error!(error = %e, "job processing failed");
                    idle
                }
            };
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(worker_id = %self.worker_id, "worker shutting down");
    }
}

fn exception(message: String) -> Guarded {
    Guarded {
        outcome: SyncOutcome::failure(ErrorCategory::Exception, format!("executor exception: {message}")),
        exception: Some(message),
    }
}

fn describe_join_error(err: &JoinError) -> String {
    if err.is_panic() {
        "executor panicked".to_string()
    } else {
        "executor task cancelled".to_string()
    }
}

/// Replace an outcome with a lease-lost failure, keeping reported progress.
fn lease_lost(reason: AbortReason, outcome: &SyncOutcome) -> SyncOutcome {
    SyncOutcome::failure(ErrorCategory::LeaseLost, format!("heartbeat aborted: {reason}"))
        .with_progress(outcome.cursor_after.clone(), outcome.counts)
}
