//! Task data model — task record, closed enums, actions and wire messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::broadcast::{ChangeKind, TaskEvent};
use crate::error::TaskError;

/// Producer-facing category of a task. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Automation,
    Workflow,
    Ai,
    Mcp,
    Telegram,
    System,
}

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses. `Failed` still has the explicit `retry` exit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Eligible to be picked up by a scheduler.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informational weight, independent of queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// Every action the state machine knows about.
///
/// `Start`, `Complete` and `Fail` are issued by the scheduler side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
    Retry,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
        }
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subset of actions an operator may request through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    Pause,
    Resume,
    Cancel,
    Retry,
}

impl From<OperatorAction> for TaskAction {
    fn from(action: OperatorAction) -> Self {
        match action {
            OperatorAction::Pause => TaskAction::Pause,
            OperatorAction::Resume => TaskAction::Resume,
            OperatorAction::Cancel => TaskAction::Cancel,
            OperatorAction::Retry => TaskAction::Retry,
        }
    }
}

impl std::str::FromStr for OperatorAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "cancel" => Ok(Self::Cancel),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

impl std::fmt::Display for OperatorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        TaskAction::from(*self).fmt(f)
    }
}

/// A tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID, assigned on enqueue.
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Dense position within the queue.
    pub order: usize,
    /// 0–100, only present while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub retry_count: u32,
    /// Reason reported by the last `fail`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Bumped on every commit; used as an optimistic concurrency token.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh pending task at the given queue position.
    pub fn from_new(new: NewTask, order: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            task_type: new.task_type,
            status: TaskStatus::Pending,
            priority: new.priority,
            order,
            progress: None,
            retry_count: 0,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a producer submits on enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
}

fn default_priority() -> TaskPriority {
    TaskPriority::Medium
}

impl NewTask {
    pub fn new(name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            task_type,
            priority: TaskPriority::Medium,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Error payload returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&TaskError> for ErrorBody {
    fn from(err: &TaskError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one action on one task, as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub task_id: Uuid,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ActionReport {
    pub fn new(task_id: Uuid, result: &Result<Task, TaskError>) -> Self {
        match result {
            Ok(task) => Self {
                task_id,
                ok: true,
                task: Some(task.clone()),
                error: None,
            },
            Err(e) => Self {
                task_id,
                ok: false,
                task: None,
                error: Some(ErrorBody::from(e)),
            },
        }
    }
}

/// Requests a client can send over the task WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskClientMessage {
    Pause {
        task_id: Uuid,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    Resume {
        task_id: Uuid,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    Cancel {
        task_id: Uuid,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    Retry {
        task_id: Uuid,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    /// Apply `op` to every listed task.
    Bulk { task_ids: Vec<Uuid>, op: OperatorAction },
    Reorder { task_id: Uuid, target_index: usize },
    /// Ask for a fresh `tasks_sync`.
    Sync,
}

/// Messages sent over the task WebSocket (server → client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskWsMessage {
    /// Full ordered snapshot (sent on connect, on request and after lag).
    TasksSync { tasks: Vec<Task> },
    /// One committed mutation.
    TaskUpdate {
        task_id: Uuid,
        status: TaskStatus,
        change: ChangeKind,
        timestamp: DateTime<Utc>,
    },
    /// Reply to a single action request.
    ActionResult {
        action: OperatorAction,
        #[serde(flatten)]
        report: ActionReport,
    },
    /// Reply to a bulk request, one entry per requested id.
    BulkResult {
        action: OperatorAction,
        results: Vec<ActionReport>,
    },
    /// Reply to a reorder request.
    ReorderResult {
        task_id: Uuid,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
}

impl From<TaskEvent> for TaskWsMessage {
    fn from(event: TaskEvent) -> Self {
        Self::TaskUpdate {
            task_id: event.task_id,
            status: event.status,
            change: event.change,
            timestamp: event.timestamp,
        }
    }
}
