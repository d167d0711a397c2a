//! Sync execution
//!
//! Steps run one after another; the operations inside a step run
//! concurrently. A failed or skipped operation blocks everything that
//! depends on it, while independent operations carry on. Cancellation is
//! checked between steps only.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::plan::{SyncOperation, SyncPlan};
use crate::adapters::ClusterClient;
use crate::diff::with_last_applied;
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{ManagedApp, OpOutcome, OperationRecord, ResourceKey, SyncAction};

/// Default bound for a single apply or delete call
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of executing a plan
#[derive(Clone, Debug, Default)]
pub struct SyncResult {
    pub records: Vec<OperationRecord>,
    /// Execution stopped early at a step boundary
    pub cancelled: bool,
}

impl SyncResult {
    pub fn count(&self, outcome: OpOutcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(OpOutcome::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(OpOutcome::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(OpOutcome::Skipped)
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    /// Keys whose operation failed on a concurrent modification
    pub fn conflicts(&self) -> Vec<ResourceKey> {
        self.records
            .iter()
            .filter(|r| r.outcome == OpOutcome::Failed && r.conflict)
            .map(|r| r.key.clone())
            .collect()
    }

    pub fn first_failure(&self) -> Option<&OperationRecord> {
        self.records.iter().find(|r| r.outcome == OpOutcome::Failed)
    }

    /// Replace the records of retried keys with their new outcome
    pub fn merge_retry(&mut self, retry: SyncResult) {
        for record in retry.records {
            let previous_attempts = match self.records.iter().position(|r| r.key == record.key) {
                Some(pos) => self.records.remove(pos).attempts,
                None => 0,
            };
            let mut record = record;
            record.attempts += previous_attempts;
            self.records.push(record);
        }
        self.records.sort_by(|a, b| a.key.cmp(&b.key));
        self.cancelled |= retry.cancelled;
    }
}

/// Executes sync plans against a cluster
pub struct SyncExecutor {
    cluster: Arc<dyn ClusterClient>,
    apply_timeout: Duration,
}

impl SyncExecutor {
    pub fn new(cluster: Arc<dyn ClusterClient>, apply_timeout: Duration) -> Self {
        Self {
            cluster,
            apply_timeout,
        }
    }

    /// Run every step of `plan` in order
    #[instrument(skip_all, fields(app = %app.name, operations = plan.len()))]
    pub async fn execute(
        &self,
        app: &ManagedApp,
        plan: &SyncPlan,
        cancel: &CancellationToken,
    ) -> SyncResult {
        let mut records = plan.rejected.clone();
        let mut blocked: HashSet<ResourceKey> =
            plan.rejected.iter().map(|r| r.key.clone()).collect();
        let mut cancelled = false;

        for (index, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                for op in plan.steps[index..].iter().flatten() {
                    records.push(OperationRecord::skipped(
                        op.key.clone(),
                        op.action,
                        "sync cancelled",
                    ));
                }
                warn!(app = %app.name, remaining_steps = plan.steps.len() - index, "Sync cancelled");
                break;
            }

            let mut runnable = Vec::with_capacity(step.len());
            for op in step {
                if let Some(dep) = op.depends_on.iter().find(|d| blocked.contains(*d)) {
                    blocked.insert(op.key.clone());
                    records.push(OperationRecord::skipped(
                        op.key.clone(),
                        op.action,
                        format!("dependency {} did not succeed", dep),
                    ));
                } else if op.action == SyncAction::Delete && !app.policy.prune {
                    blocked.insert(op.key.clone());
                    records.push(OperationRecord::skipped(
                        op.key.clone(),
                        op.action,
                        "prune is disabled",
                    ));
                } else {
                    runnable.push(op);
                }
            }

            let results = join_all(runnable.into_iter().map(|op| self.run_operation(app, op))).await;
            for record in results {
                if record.outcome != OpOutcome::Succeeded {
                    blocked.insert(record.key.clone());
                }
                records.push(record);
            }
        }

        for record in &records {
            metrics::SYNC_OPERATIONS
                .with_label_values(&[record.action.as_str(), record.outcome.as_str()])
                .inc();
        }

        SyncResult { records, cancelled }
    }

    async fn run_operation(&self, app: &ManagedApp, op: &SyncOperation) -> OperationRecord {
        let started_at = Utc::now();
        let _timer = metrics::SYNC_OPERATION_DURATION
            .with_label_values(&[op.action.as_str()])
            .start_timer();

        let result = self.call(op).await;
        let (outcome, message, conflict) = match &result {
            Ok(()) => {
                info!(app = %app.name, key = %op.key, action = op.action.as_str(), "Operation succeeded");
                (OpOutcome::Succeeded, None, false)
            }
            Err(e) => {
                warn!(app = %app.name, key = %op.key, action = op.action.as_str(), error = %e, "Operation failed");
                (OpOutcome::Failed, Some(e.to_string()), e.is_conflict())
            }
        };

        OperationRecord {
            key: op.key.clone(),
            action: op.action,
            outcome,
            message,
            attempts: 1,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            conflict,
        }
    }

    async fn call(&self, op: &SyncOperation) -> Result<()> {
        let request = async {
            match op.action {
                SyncAction::Delete => self.cluster.delete(&op.api_version, &op.key).await,
                SyncAction::Create | SyncAction::Update => {
                    let object = op.object.as_ref().ok_or_else(|| {
                        Error::manifest(op.key.to_string(), "no desired object to apply")
                    })?;
                    let payload = with_last_applied(object)?;
                    self.cluster
                        .apply(&op.api_version, &payload)
                        .await
                        .map(|_| ())
                }
            }
        };

        match tokio::time::timeout(self.apply_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("{} {}", op.action.as_str(), op.key),
                seconds: self.apply_timeout.as_secs(),
            }),
        }
    }
}
