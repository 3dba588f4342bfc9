//! Error types for the task queue core.

use uuid::Uuid;

use crate::tasks::model::{TaskAction, TaskStatus};

/// Typed outcome of every rejected task operation.
///
/// None of these are fatal: the store and dispatcher report them to the
/// caller and leave the task untouched.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} cannot {action} while {status}")]
    InvalidTransition {
        id: Uuid,
        status: TaskStatus,
        action: TaskAction,
    },

    #[error("Task {id} cannot retry: limit exceeded ({retry_count} of {max} retries used)")]
    RetryLimitExceeded { id: Uuid, retry_count: u32, max: u32 },

    #[error("Task {id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification { id: Uuid, expected: u64, actual: u64 },

    #[error("Task {id} is {status}; progress is only tracked while running")]
    NotRunning { id: Uuid, status: TaskStatus },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl TaskError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::RetryLimitExceeded { .. } => "retry_limit_exceeded",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::NotRunning { .. } => "not_running",
            Self::Database(_) => "database",
        }
    }

    /// The task this error refers to, if any.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::NotFound { id }
            | Self::InvalidTransition { id, .. }
            | Self::RetryLimitExceeded { id, .. }
            | Self::ConcurrentModification { id, .. }
            | Self::NotRunning { id, .. } => Some(*id),
            Self::Database(_) => None,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
