//! Task state machine.
//!
//! `transition` is a pure function of `(status, action)`. It performs no
//! I/O and knows nothing about retry limits or task identity; the
//! dispatcher layers those on top.

use uuid::Uuid;

use super::model::{TaskAction, TaskStatus};
use crate::error::TaskError;

/// A requested edge that is not in the state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while {from}")]
pub struct IllegalTransition {
    pub from: TaskStatus,
    pub action: TaskAction,
}

impl IllegalTransition {
    /// Attach the task id to produce the caller-facing error.
    pub fn for_task(self, id: Uuid) -> TaskError {
        TaskError::InvalidTransition {
            id,
            status: self.from,
            action: self.action,
        }
    }
}

/// Resolve the status reached by applying `action` in `from`.
pub fn transition(from: TaskStatus, action: TaskAction) -> Result<TaskStatus, IllegalTransition> {
    use TaskAction::*;
    use TaskStatus::*;

    let to = match (from, action) {
        (Pending, Start) | (Retrying, Start) => Running,
        (Pending, Cancel) | (Running, Cancel) | (Paused, Cancel) => Cancelled,
        (Running, Pause) => Paused,
        (Running, Complete) => Completed,
        (Running, Fail) => Failed,
        (Paused, Resume) => Pending,
        (Failed, Retry) => Retrying,
        _ => return Err(IllegalTransition { from, action }),
    };
    Ok(to)
}

/// Check whether `action` is legal in `from` without computing the result.
pub fn is_allowed(from: TaskStatus, action: TaskAction) -> bool {
    transition(from, action).is_ok()
}
