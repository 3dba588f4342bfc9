//! Action dispatcher — validates and applies operator actions.
//!
//! Every action is checked against the state machine, the retry policy
//! and (optionally) an expected version, then committed through the store
//! under the task's lock. Bulk actions fan out concurrently and report one
//! outcome per requested id.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::broadcast::ChangeKind;
use super::model::{OperatorAction, Task};
use super::retry::RetryPolicy;
use super::store::TaskStore;
use super::transition::transition;
use crate::error::TaskError;

/// Per-request options for a single action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyParams {
    /// Reject with `ConcurrentModification` unless the task is at this version.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

/// Result of one id within a bulk action.
#[derive(Debug)]
pub struct BulkOutcome {
    pub task_id: Uuid,
    pub result: Result<Task, TaskError>,
}

impl BulkOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Entry point for operator control of tasks.
pub struct ActionDispatcher {
    store: Arc<TaskStore>,
    retry: RetryPolicy,
}

impl ActionDispatcher {
    pub fn new(store: Arc<TaskStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Apply `action` to one task.
    pub async fn apply(&self, id: Uuid, action: OperatorAction) -> Result<Task, TaskError> {
        self.apply_with(id, action, ApplyParams::default()).await
    }

    /// Apply `action` to one task with explicit options.
    pub async fn apply_with(
        &self,
        id: Uuid,
        action: OperatorAction,
        params: ApplyParams,
    ) -> Result<Task, TaskError> {
        let policy = &self.retry;
        let result = self
            .store
            .commit(id, ChangeKind::Status, |task| {
                match params.expected_version {
                    Some(expected) if expected != task.version => {
                        return Err(TaskError::ConcurrentModification {
                            id,
                            expected,
                            actual: task.version,
                        });
                    }
                    _ => {}
                }

                let status = transition(task.status, action.into()).map_err(|e| e.for_task(id))?;

                let mut next = task.clone();
                next.status = status;
                if action == OperatorAction::Retry {
                    policy.check(task)?;
                    next.retry_count = task.retry_count.saturating_add(1);
                }
                Ok(next)
            })
            .await;

        match &result {
            Ok(task) => info!(
                task_id = %id,
                action = %action,
                status = %task.status,
                retry_count = task.retry_count,
                "Task action applied"
            ),
            Err(e) => warn!(
                task_id = %id,
                action = %action,
                code = e.code(),
                error = %e,
                "Task action rejected"
            ),
        }
        result
    }

    /// Apply `action` to each id independently. Outcomes come back in input
    /// order; one failure never blocks the others.
    pub async fn apply_bulk(&self, ids: &[Uuid], action: OperatorAction) -> Vec<BulkOutcome> {
        let outcomes = join_all(ids.iter().map(|&task_id| async move {
            BulkOutcome {
                task_id,
                result: self.apply(task_id, action).await,
            }
        }))
        .await;

        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        info!(
            action = %action,
            total = outcomes.len(),
            succeeded,
            failed = outcomes.len() - succeeded,
            "Bulk action applied"
        );
        outcomes
    }
}
