//! libSQL backend — async `TaskRepository` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::TaskRepository;
use crate::tasks::model::{Task, TaskPriority, TaskStatus, TaskType};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use,
/// but a transaction opened on it spans every statement issued on that
/// connection until commit. Writes therefore go through `writes` so a
/// single-row update never lands inside another caller's batch.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    writes: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            writes: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Column list for task SELECT queries (13 columns).
const TASK_COLUMNS: &str = "id, name, description, task_type, status, priority, position, progress, retry_count, last_error, version, created_at, updated_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Encode a snake_case serde enum as its DB string.
fn enum_to_str<T: serde::Serialize>(value: &T, column: &str) -> Result<String, DatabaseError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(DatabaseError::Serialization(format!(
            "{column}: expected string, got {other}"
        ))),
        Err(e) => Err(DatabaseError::Serialization(format!("{column}: {e}"))),
    }
}

fn str_to_enum<T: serde::de::DeserializeOwned>(
    s: String,
    column: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_value(serde_json::Value::String(s))
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn text(row: &libsql::Row, idx: i32, column: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("task.{column}: {e}")))
}

fn opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(Value::Text(s)) => Some(s),
        _ => None,
    }
}

fn opt_integer(row: &libsql::Row, idx: i32) -> Option<i64> {
    match row.get_value(idx) {
        Ok(Value::Integer(n)) => Some(n),
        _ => None,
    }
}

fn integer(row: &libsql::Row, idx: i32, column: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("task.{column}: {e}")))
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str = text(row, 0, "id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.id parse: {e}")))?;

    let task_type: TaskType = str_to_enum(text(row, 3, "task_type")?, "task_type")?;
    let status: TaskStatus = str_to_enum(text(row, 4, "status")?, "status")?;
    let priority: TaskPriority = str_to_enum(text(row, 5, "priority")?, "priority")?;

    Ok(Task {
        id,
        name: text(row, 1, "name")?,
        description: opt_text(row, 2).unwrap_or_default(),
        task_type,
        status,
        priority,
        order: integer(row, 6, "position")?.max(0) as usize,
        progress: opt_integer(row, 7).map(|p| p.clamp(0, 100) as u8),
        retry_count: integer(row, 8, "retry_count")?.max(0) as u32,
        last_error: opt_text(row, 9),
        version: integer(row, 10, "version")?.max(0) as u64,
        created_at: parse_datetime(&text(row, 11, "created_at")?),
        updated_at: parse_datetime(&text(row, 12, "updated_at")?),
    })
}

/// Rewrite position, version and updated_at for each task.
async fn write_positions(conn: &Connection, tasks: &[Task]) -> Result<(), DatabaseError> {
    for task in tasks {
        conn.execute(
            "UPDATE tasks SET position = ?1, version = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                task.order as i64,
                task.version as i64,
                task.updated_at.to_rfc3339(),
                task.id.to_string(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("write_positions: {e}")))?;
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskRepository for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _writing = self.writes.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    task.id.to_string(),
                    task.name.as_str(),
                    task.description.as_str(),
                    enum_to_str(&task.task_type, "task_type")?,
                    enum_to_str(&task.status, "status")?,
                    enum_to_str(&task.priority, "priority")?,
                    task.order as i64,
                    task.progress.map(i64::from),
                    task.retry_count as i64,
                    task.last_error.clone(),
                    task.version as i64,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        debug!(task_id = %task.id, "Task inserted");
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _writing = self.writes.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET name = ?1, description = ?2, task_type = ?3, status = ?4, priority = ?5, position = ?6, progress = ?7, retry_count = ?8, last_error = ?9, version = ?10, updated_at = ?11 WHERE id = ?12",
                params![
                    task.name.as_str(),
                    task.description.as_str(),
                    enum_to_str(&task.task_type, "task_type")?,
                    enum_to_str(&task.status, "status")?,
                    enum_to_str(&task.priority, "priority")?,
                    task.order as i64,
                    task.progress.map(i64::from),
                    task.retry_count as i64,
                    task.last_error.clone(),
                    task.version as i64,
                    task.updated_at.to_rfc3339(),
                    task.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".into(),
                id: task.id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_positions(&self, tasks: &[Task]) -> Result<(), DatabaseError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let _writing = self.writes.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_positions begin: {e}")))?;

        write_positions(&tx, tasks).await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("update_positions commit: {e}")))?;
        debug!(count = tasks.len(), "Task positions updated");
        Ok(())
    }

    async fn remove_tasks(&self, ids: &[Uuid], shifted: &[Task]) -> Result<usize, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let _writing = self.writes.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_tasks begin: {e}")))?;

        let mut removed: u64 = 0;
        for id in ids {
            removed += tx
                .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(|e| DatabaseError::Query(format!("remove_tasks: {e}")))?;
        }
        write_positions(&tx, shifted).await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_tasks commit: {e}")))?;
        debug!(removed, shifted = shifted.len(), "Tasks removed");
        Ok(removed as usize)
    }

    async fn load_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY position ASC, created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_tasks row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}
