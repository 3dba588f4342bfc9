//! Query engine — filtered, ordered views over a task snapshot.

use serde::{Deserialize, Serialize};

use super::model::{Task, TaskPriority, TaskStatus};

/// Optional, conjunctive filter. An empty filter matches everything.
///
/// Deserializes straight from `?status=&priority=&search=` query strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// Case-insensitive substring of name or description.
    #[serde(default)]
    pub search: Option<String>,
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Search term, lowercased. Blank terms count as no search; any
    /// surrounding whitespace is otherwise part of the term.
    fn needle(&self) -> Option<String> {
        self.search
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.matches_with(task, self.needle().as_deref())
    }

    fn matches_with(&self, task: &Task, needle: Option<&str>) -> bool {
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        if self.priority.is_some_and(|p| p != task.priority) {
            return false;
        }
        match needle {
            Some(needle) => {
                task.name.to_lowercase().contains(needle)
                    || task.description.to_lowercase().contains(needle)
            }
            None => true,
        }
    }
}

/// Keep the tasks matching `filter`, ascending by order.
pub fn filter_tasks(mut tasks: Vec<Task>, filter: &TaskFilter) -> Vec<Task> {
    let needle = filter.needle();
    tasks.retain(|t| filter.matches_with(t, needle.as_deref()));
    tasks.sort_by_key(|t| t.order);
    tasks
}

/// Per-status totals, for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending
            + self.running
            + self.paused
            + self.retrying
            + self.completed
            + self.failed
            + self.cancelled
    }
}

pub fn count_by_status(tasks: &[Task]) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for task in tasks {
        let slot = match task.status {
            TaskStatus::Pending => &mut counts.pending,
            TaskStatus::Running => &mut counts.running,
            TaskStatus::Paused => &mut counts.paused,
            TaskStatus::Retrying => &mut counts.retrying,
            TaskStatus::Completed => &mut counts.completed,
            TaskStatus::Failed => &mut counts.failed,
            TaskStatus::Cancelled => &mut counts.cancelled,
        };
        *slot += 1;
    }
    counts
}
