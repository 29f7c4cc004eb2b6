//! Lease heartbeat for a running job.
//!
//! While an executor runs, a background task renews the job lease and
//! extends the (repository, kind) lock every `renew_interval_seconds`.
//! Losing ownership aborts at once; storage errors abort after
//! `heartbeat_max_failures` consecutive misses.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use syncgrid_core::JobKind;
use syncgrid_core::config::WorkerConfig;
use syncgrid_queue::{DistributedLock, JobQueue};
use syncgrid_state::SyncJob;

/// Why the heartbeat gave up on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The job lease now belongs to someone else (or the job left `running`).
    LeaseLost,
    /// Too many consecutive renewals failed.
    RenewalFailures(u32),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::LeaseLost => f.write_str("lease lost to another owner"),
            AbortReason::RenewalFailures(n) => write!(f, "{n} consecutive lease renewals failed"),
        }
    }
}

/// Counters reported when the heartbeat stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub renewals: u32,
    pub failures: u32,
}

struct Beat {
    queue: JobQueue,
    lock: DistributedLock,
    job_id: String,
    repo_id: String,
    job_kind: JobKind,
    worker_id: String,
    lease_seconds: i64,
    max_failures: u32,
}

impl Beat {
    /// One renewal. `Err` carries a terminal reason.
    fn renew(&self, consecutive_failures: &mut u32) -> Result<(), AbortReason> {
        let renewed = match self
            .queue
            .renew_lease(&self.job_id, &self.worker_id, self.lease_seconds)
        {
            Ok(false) => return Err(AbortReason::LeaseLost),
            Ok(true) => self.lock.extend(
                &self.repo_id,
                self.job_kind,
                &self.worker_id,
                self.lease_seconds,
            ),
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "lease renewal errored");
                false
            }
        };

        if renewed {
            *consecutive_failures = 0;
            return Ok(());
        }
        *consecutive_failures += 1;
        warn!(
            job_id = %self.job_id,
            failures = *consecutive_failures,
            threshold = self.max_failures,
            "heartbeat missed"
        );
        if *consecutive_failures >= self.max_failures {
            return Err(AbortReason::RenewalFailures(*consecutive_failures));
        }
        Ok(())
    }
}

/// Handle to a running heartbeat task.
pub struct HeartbeatManager {
    job_id: String,
    stop_tx: watch::Sender<bool>,
    abort_rx: watch::Receiver<Option<AbortReason>>,
    handle: Option<JoinHandle<HeartbeatStats>>,
    join_timeout: Duration,
}

impl HeartbeatManager {
    /// Spawn the heartbeat for a claimed job. Must be called inside a runtime.
    pub fn start(
        queue: JobQueue,
        lock: DistributedLock,
        job: &SyncJob,
        worker_id: &str,
        config: &WorkerConfig,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(None);
        let period = Duration::from_secs(config.renew_interval_seconds.max(1));
        let beat = Beat {
            queue,
            lock,
            job_id: job.job_id.clone(),
            repo_id: job.repo_id.clone(),
            job_kind: job.job_kind,
            worker_id: worker_id.to_string(),
            lease_seconds: config.lease_seconds,
            max_failures: config.heartbeat_max_failures.max(1),
        };

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut stats = HeartbeatStats::default();
            let mut consecutive = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match beat.renew(&mut consecutive) {
                            Ok(()) if consecutive == 0 => {
                                stats.renewals += 1;
                                debug!(job_id = %beat.job_id, "lease renewed");
                            }
                            Ok(()) => stats.failures += 1,
                            Err(reason) => {
                                if matches!(reason, AbortReason::RenewalFailures(_)) {
                                    stats.failures += 1;
                                }
                                warn!(job_id = %beat.job_id, %reason, "heartbeat aborting job");
                                let _ = abort_tx.send(Some(reason));
                                break;
                            }
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            stats
        });

        Self {
            job_id: job.job_id.clone(),
            stop_tx,
            abort_rx,
            handle: Some(handle),
            join_timeout: Duration::from_secs(config.heartbeat_join_timeout_seconds),
        }
    }

    /// Set once the heartbeat has given up.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.abort_rx.borrow()
    }

    pub fn should_abort(&self) -> bool {
        self.abort_reason().is_some()
    }

    /// Resolves when the heartbeat gives up. Pending forever otherwise.
    pub async fn aborted(&self) -> AbortReason {
        let mut rx = self.abort_rx.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Task finished without aborting: never resolve.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stop the task and wait for it, bounded by the join timeout.
    pub async fn stop(mut self) -> Option<HeartbeatStats> {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.take()?;
        match tokio::time::timeout(self.join_timeout, handle).await {
            Ok(Ok(stats)) => {
                debug!(job_id = %self.job_id, renewals = stats.renewals, "heartbeat stopped");
                Some(stats)
            }
            Ok(Err(e)) => {
                warn!(job_id = %self.job_id, error = %e, "heartbeat task failed");
                None
            }
            Err(_) => {
                info!(job_id = %self.job_id, "heartbeat did not stop in time, detaching");
                None
            }
        }
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}
