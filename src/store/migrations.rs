//! Schema versioning for the libSQL backend.
//!
//! Applied steps are recorded in `schema_version`. Each pending step runs in
//! its own transaction together with its version row, so a failed step
//! leaves the database at the previous version.

use libsql::Connection;

use crate::error::DatabaseError;

struct Step {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered schema history. Append only.
static STEPS: &[Step] = &[Step {
    version: 1,
    name: "tasks",
    sql: r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            task_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority TEXT NOT NULL DEFAULT 'medium',
            position INTEGER NOT NULL,
            progress INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_position ON tasks(position);
    "#,
}];

/// Schema version this build expects.
fn target_version() -> i64 {
    STEPS.iter().map(|s| s.version).max().unwrap_or(0)
}

fn pending(applied: i64) -> impl Iterator<Item = &'static Step> {
    STEPS.iter().filter(move |s| s.version > applied)
}

/// Bring the schema up to `target_version()`.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_version table: {e}")))?;

    let applied = applied_version(conn).await?;
    let mut ran = 0usize;

    for step in pending(applied) {
        tracing::info!(version = step.version, name = step.name, "Applying schema step");
        apply(conn, step).await?;
        ran += 1;
    }

    let version = applied_version(conn).await?;
    if version > target_version() {
        tracing::warn!(
            version,
            expected = target_version(),
            "Database schema is newer than this build"
        );
    } else if ran > 0 {
        tracing::info!(version, steps = ran, "Schema upgraded");
    } else {
        tracing::debug!(version, "Schema up to date");
    }
    Ok(())
}

async fn apply(conn: &Connection, step: &Step) -> Result<(), DatabaseError> {
    let fail = |stage: &str, e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {} {stage}: {e}", step.version, step.name))
    };

    let tx = conn.transaction().await.map_err(|e| fail("begin", e))?;
    tx.execute_batch(step.sql).await.map_err(|e| fail("apply", e))?;
    tx.execute(
        "INSERT INTO schema_version (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await
    .map_err(|e| fail("record", e))?;
    tx.commit().await.map_err(|e| fail("commit", e))
}

async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("schema_version read: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("schema_version row: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("schema_version value: {e}"))),
        None => Ok(0),
    }
}
