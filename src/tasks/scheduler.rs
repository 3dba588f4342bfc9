//! In-process scheduler — runs pending and retrying tasks through a handler.
//!
//! Each tick scans the queue in order and starts runnable tasks until
//! `max_concurrent` runs are in flight. A `retrying` task is only started
//! once its backoff delay since the retry has elapsed. The run outcome is
//! committed as `complete` or `fail`; if an operator paused or cancelled
//! the task meanwhile, that commit is rejected and the operator wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Task, TaskStatus};
use super::query::TaskFilter;
use super::retry::RetryPolicy;
use super::store::TaskStore;
use crate::error::TaskError;

/// Executes one task. Return `Err(reason)` to mark it failed.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: Task, ctx: RunContext) -> Result<(), String>;
}

/// Handle a running task uses to talk back to the store.
#[derive(Clone)]
pub struct RunContext {
    store: Arc<TaskStore>,
    task_id: Uuid,
}

impl RunContext {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub async fn report_progress(&self, progress: u8) -> Result<Task, TaskError> {
        self.store.report_progress(self.task_id, progress).await
    }

    pub async fn status(&self) -> Result<TaskStatus, TaskError> {
        self.store.get(self.task_id).await.map(|t| t.status)
    }

    /// True once the task has left `running` (paused, cancelled or gone).
    /// Long handlers should poll this and bail out early.
    pub async fn should_stop(&self) -> bool {
        !matches!(self.status().await, Ok(TaskStatus::Running))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            tick_interval: Duration::from_secs(1),
        }
    }
}

pub struct Scheduler {
    store: Arc<TaskStore>,
    handler: Arc<dyn TaskHandler>,
    retry: RetryPolicy,
    config: SchedulerConfig,
    /// Task ids with a run in flight.
    running: Arc<RwLock<HashSet<Uuid>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        handler: Arc<dyn TaskHandler>,
        retry: RetryPolicy,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            handler,
            retry,
            config,
            running: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    pub async fn in_flight(&self) -> usize {
        self.running.read().await.len()
    }

    fn backoff_elapsed(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::Retrying {
            return true;
        }
        let delay = self.retry.backoff(task.retry_count);
        (now - task.updated_at)
            .to_std()
            .map(|waited| waited >= delay)
            .unwrap_or(false)
    }

    /// Start every runnable task that fits. Returns the ids started.
    pub async fn tick(self: &Arc<Self>) -> Vec<Uuid> {
        let now = Utc::now();
        let candidates: Vec<Task> = self
            .store
            .list(&TaskFilter::default())
            .await
            .into_iter()
            .filter(|t| t.status.is_runnable() && self.backoff_elapsed(t, now))
            .collect();

        let mut started = Vec::new();
        for task in candidates {
            {
                let mut running = self.running.write().await;
                if running.len() >= self.config.max_concurrent {
                    break;
                }
                if !running.insert(task.id) {
                    continue;
                }
            }

            match self.store.start(task.id).await {
                Ok(task) => {
                    started.push(task.id);
                    self.spawn_run(task);
                }
                Err(e) => {
                    // Lost a race with an operator action; skip this round.
                    debug!(task_id = %task.id, error = %e, "Task not started");
                    self.running.write().await.remove(&task.id);
                }
            }
        }

        if !started.is_empty() {
            info!(count = started.len(), "Scheduler started tasks");
        }
        started
    }

    fn spawn_run(self: &Arc<Self>, task: Task) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = task.id;
            let ctx = RunContext {
                store: Arc::clone(&this.store),
                task_id,
            };

            let handler = Arc::clone(&this.handler);
            let result = match tokio::spawn(async move { handler.run(task, ctx).await }).await {
                Ok(result) => result,
                Err(e) => Err(format!("handler panicked: {e}")),
            };

            let outcome = match result {
                Ok(()) => this.store.complete(task_id).await,
                Err(reason) => {
                    warn!(task_id = %task_id, reason = %reason, "Task run failed");
                    this.store.fail(task_id, reason).await
                }
            };
            if let Err(e) = outcome {
                debug!(task_id = %task_id, error = %e, "Run outcome discarded");
            }

            this.running.write().await.remove(&task_id);
        })
    }
}

/// Spawn the scheduler loop. The first tick fires immediately.
pub fn spawn_scheduler(scheduler: Arc<Scheduler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            max_concurrent = scheduler.config.max_concurrent,
            interval_ms = scheduler.config.tick_interval.as_millis() as u64,
            "Task scheduler started"
        );
        let mut interval = tokio::time::interval(scheduler.config.tick_interval);
        loop {
            interval.tick().await;
            scheduler.tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::broadcast::ChangeKind;
    use crate::tasks::model::{NewTask, TaskType};
    use tokio::sync::Semaphore;

    const WAIT: Duration = Duration::from_secs(5);

    struct Succeed;

    #[async_trait]
    impl TaskHandler for Succeed {
        async fn run(&self, _task: Task, ctx: RunContext) -> Result<(), String> {
            ctx.report_progress(50).await.map_err(|e| e.to_string())?;
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl TaskHandler for Fail {
        async fn run(&self, _task: Task, _ctx: RunContext) -> Result<(), String> {
            Err("exit code 1".into())
        }
    }

    /// Blocks until a permit is released.
    struct Gate(Arc<Semaphore>);

    #[async_trait]
    impl TaskHandler for Gate {
        async fn run(&self, _task: Task, _ctx: RunContext) -> Result<(), String> {
            self.0.acquire().await.map_err(|e| e.to_string())?.forget();
            Ok(())
        }
    }

    fn instant_retry() -> RetryPolicy {
        RetryPolicy::default().with_base_delay(Duration::ZERO)
    }

    async fn wait_for(store: &TaskStore, id: Uuid, status: TaskStatus) -> Task {
        tokio::time::timeout(WAIT, async {
            loop {
                let task = store.get(id).await.unwrap();
                if task.status == status {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for status")
    }

    async fn enqueue(store: &TaskStore, name: &str) -> Task {
        store
            .enqueue(NewTask::new(name, TaskType::System))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn runs_pending_task_to_completion() {
        let store = TaskStore::new();
        let task = enqueue(&store, "a").await;
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(Succeed),
            instant_retry(),
            SchedulerConfig::default(),
        );

        assert_eq!(scheduler.tick().await, vec![task.id]);
        let done = wait_for(&store, task.id, TaskStatus::Completed).await;
        assert_eq!(done.progress, None);
    }

    #[tokio::test]
    async fn handler_error_fails_task() {
        let store = TaskStore::new();
        let task = enqueue(&store, "a").await;
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(Fail),
            instant_retry(),
            SchedulerConfig::default(),
        );

        scheduler.tick().await;
        let failed = wait_for(&store, task.id, TaskStatus::Failed).await;
        assert_eq!(failed.last_error.as_deref(), Some("exit code 1"));
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let store = TaskStore::new();
        for name in ["a", "b", "c"] {
            enqueue(&store, name).await;
        }
        let gate = Arc::new(Semaphore::new(0));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(Gate(Arc::clone(&gate))),
            instant_retry(),
            SchedulerConfig {
                max_concurrent: 2,
                ..SchedulerConfig::default()
            },
        );

        assert_eq!(scheduler.tick().await.len(), 2);
        assert!(scheduler.tick().await.is_empty());
        assert_eq!(scheduler.in_flight().await, 2);

        let running = store.list(&TaskFilter::default().with_status(TaskStatus::Running)).await;
        assert_eq!(running.len(), 2);
        gate.add_permits(8);
    }

    #[tokio::test]
    async fn operator_pause_wins_over_completion() {
        let store = TaskStore::new();
        let task = enqueue(&store, "a").await;
        let gate = Arc::new(Semaphore::new(0));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(Gate(Arc::clone(&gate))),
            instant_retry(),
            SchedulerConfig::default(),
        );

        scheduler.tick().await;
        wait_for(&store, task.id, TaskStatus::Running).await;
        store
            .commit(task.id, ChangeKind::Status, |t| {
                let mut next = t.clone();
                next.status = TaskStatus::Paused;
                Ok(next)
            })
            .await
            .unwrap();

        gate.add_permits(8);
        tokio::time::timeout(WAIT, async {
            while scheduler.in_flight().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn retrying_task_waits_for_backoff() {
        let store = TaskStore::new();
        let task = enqueue(&store, "a").await;
        store.start(task.id).await.unwrap();
        store.fail(task.id, "boom").await.unwrap();
        store
            .commit(task.id, ChangeKind::Status, |t| {
                let mut next = t.clone();
                next.status = TaskStatus::Retrying;
                next.retry_count = 1;
                Ok(next)
            })
            .await
            .unwrap();

        let slow = Scheduler::new(
            Arc::clone(&store),
            Arc::new(Succeed),
            RetryPolicy::default().with_base_delay(Duration::from_secs(3600)),
            SchedulerConfig::default(),
        );
        assert!(slow.tick().await.is_empty());

        let fast = Scheduler::new(
            Arc::clone(&store),
            Arc::new(Succeed),
            instant_retry(),
            SchedulerConfig::default(),
        );
        assert_eq!(fast.tick().await, vec![task.id]);
        wait_for(&store, task.id, TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn spawned_loop_picks_up_later_enqueues() {
        let store = TaskStore::new();
        let first = enqueue(&store, "a").await;
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::new(Succeed),
            instant_retry(),
            SchedulerConfig {
                tick_interval: Duration::from_millis(20),
                ..SchedulerConfig::default()
            },
        );

        let handle = spawn_scheduler(scheduler);
        wait_for(&store, first.id, TaskStatus::Completed).await;

        let second = enqueue(&store, "b").await;
        wait_for(&store, second.id, TaskStatus::Completed).await;

        handle.abort();
    }
}
