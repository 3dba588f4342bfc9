use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use taskflow::config::QueueConfig;
use taskflow::store::{LibSqlBackend, TaskRepository};
use taskflow::tasks::dispatcher::ActionDispatcher;
use taskflow::tasks::store::{self, TaskStore};
use taskflow::tasks::ws::task_routes;

/// How often the prune sweep runs.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

fn init_tracing(config: &QueueConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = QueueConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("📋 Taskflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Task WS:  ws://0.0.0.0:{}/ws/tasks", config.port);
    eprintln!("   Task API: http://0.0.0.0:{}/api/tasks", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let backend = if config.is_ephemeral() {
        LibSqlBackend::new_memory().await
    } else {
        LibSqlBackend::new_local(Path::new(&config.db_path)).await
    }
    .with_context(|| format!("Failed to open database at {}", config.db_path))?;
    let repo: Arc<dyn TaskRepository> = Arc::new(backend);

    // ── Task store ───────────────────────────────────────────────────────
    let task_store = TaskStore::open(repo, config.broadcast_capacity)
        .await
        .context("Failed to load tasks")?;

    // No executor survives a restart, so anything still running is orphaned.
    task_store
        .fail_interrupted("interrupted by restart")
        .await
        .context("Failed to recover interrupted tasks")?;

    let _prune_handle = config.prune_after.map(|retention| {
        tracing::info!(retention_hours = retention.as_secs() / 3600, "Prune sweep enabled");
        store::spawn_prune_task(Arc::clone(&task_store), retention, PRUNE_INTERVAL)
    });

    let dispatcher = Arc::new(ActionDispatcher::new(
        Arc::clone(&task_store),
        config.retry_policy(),
    ));

    // ── Server ───────────────────────────────────────────────────────────
    let app = task_routes(dispatcher);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, tasks = task_store.len().await, "Task server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}
