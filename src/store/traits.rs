//! `TaskRepository` trait — single async interface for task persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::Task;

/// Backend-agnostic persistence for the task store.
///
/// The in-memory `TaskStore` stays authoritative at runtime; a repository
/// only has to make each committed value durable and reload it on start.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a newly enqueued task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Overwrite every mutable column of an existing task.
    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Rewrite positions for a batch of tasks in one transaction.
    async fn update_positions(&self, tasks: &[Task]) -> Result<(), DatabaseError>;

    /// Delete tasks by id and rewrite the positions of the survivors that
    /// shifted, in one transaction. Returns the number removed.
    async fn remove_tasks(&self, ids: &[Uuid], shifted: &[Task]) -> Result<usize, DatabaseError>;

    /// Load every task, ordered by position.
    async fn load_tasks(&self) -> Result<Vec<Task>, DatabaseError>;
}
