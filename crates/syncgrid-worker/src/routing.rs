use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use syncgrid_core::{ErrorCategory, PhysicalKind};

use crate::executor::{ExecutionJob, SyncExecutor, SyncOutcome};

/// Dispatches each job to the executor registered for its physical kind.
///
/// A kind with no executor fails as `invalid_config`, which dead-letters
/// the job instead of retrying it forever.
#[derive(Default, Clone)]
pub struct RoutingExecutor {
    routes: HashMap<PhysicalKind, Arc<dyn SyncExecutor>>,
}

impl RoutingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: PhysicalKind, executor: Arc<dyn SyncExecutor>) -> Self {
        self.routes.insert(kind, executor);
        self
    }

    pub fn kinds(&self) -> Vec<PhysicalKind> {
        let mut kinds: Vec<_> = self.routes.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[async_trait]
impl SyncExecutor for RoutingExecutor {
    async fn execute(&self, job: &ExecutionJob) -> anyhow::Result<SyncOutcome> {
        match self.routes.get(&job.physical_kind) {
            Some(executor) => executor.execute(job).await,
            None => {
                warn!(job_id = %job.job_id, physical_kind = %job.physical_kind, "no executor registered");
                Ok(SyncOutcome::failure(
                    ErrorCategory::InvalidConfig,
                    format!("no executor registered for physical kind {}", job.physical_kind),
                ))
            }
        }
    }
}
