//! Task store — authoritative in-memory record of every task.
//!
//! Each task lives in its own mutex so mutations of different tasks never
//! contend. A commit takes the task's lock, validates and computes the next
//! value, persists it (when a repository is attached), swaps it in and
//! publishes exactly one event, all before releasing the lock. That makes
//! commits per task totally ordered and keeps event order equal to commit
//! order for that task.
//!
//! Lock order is `order` → `tasks` map → per-task mutex. Single-task
//! commits drop the map guard before locking the task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::{Mutex, MutexGuard, RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broadcast::{
    ChangeBroadcaster, ChangeKind, DEFAULT_BROADCAST_CAPACITY, Subscription, TaskEvent,
};
use super::model::{NewTask, Task, TaskAction, TaskStatus};
use super::order::OrderIndex;
use super::query::{self, TaskFilter};
use super::transition::transition;
use crate::error::{DatabaseError, TaskError};
use crate::store::TaskRepository;

/// A task plus a tombstone flag. Prune flips `live` under the task lock so
/// a commit that fetched the slot before removal sees `NotFound`.
struct Slot {
    task: Task,
    live: bool,
}

impl Slot {
    fn live(task: Task) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self { task, live: true }))
    }

    fn expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.live && self.task.status.is_terminal() && self.task.updated_at < cutoff
    }
}

type SlotRef = Arc<Mutex<Slot>>;

/// Owns every task, the queue order and the change broadcaster.
pub struct TaskStore {
    tasks: RwLock<HashMap<Uuid, SlotRef>>,
    order: Mutex<OrderIndex>,
    broadcaster: ChangeBroadcaster,
    repo: Option<Arc<dyn TaskRepository>>,
}

impl TaskStore {
    /// Create an empty, memory-only store.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Memory-only store with a custom broadcast capacity.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            order: Mutex::new(OrderIndex::new()),
            broadcaster: ChangeBroadcaster::new(capacity),
            repo: None,
        })
    }

    /// Load every persisted task and write through to `repo` from now on.
    ///
    /// Positions are recompacted to `0..n` if the stored ones have gaps.
    pub async fn open(
        repo: Arc<dyn TaskRepository>,
        capacity: usize,
    ) -> Result<Arc<Self>, DatabaseError> {
        let mut tasks = repo.load_tasks().await?;

        let mut drifted = Vec::new();
        for (pos, task) in tasks.iter_mut().enumerate() {
            if task.order != pos {
                task.order = pos;
                drifted.push(task.clone());
            }
        }
        if !drifted.is_empty() {
            warn!(count = drifted.len(), "Recompacting stored task positions");
            repo.update_positions(&drifted).await?;
        }

        let index = OrderIndex::from_ids(tasks.iter().map(|t| t.id).collect());
        let map: HashMap<Uuid, SlotRef> =
            tasks.into_iter().map(|t| (t.id, Slot::live(t))).collect();

        info!(count = map.len(), "Task store loaded");

        Ok(Arc::new(Self {
            tasks: RwLock::new(map),
            order: Mutex::new(index),
            broadcaster: ChangeBroadcaster::new(capacity),
            repo: Some(repo),
        }))
    }

    pub fn broadcaster(&self) -> &ChangeBroadcaster {
        &self.broadcaster
    }

    /// Subscribe to committed mutations. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.broadcaster.subscribe()
    }

    /// Subscribe as a stream that reports lag explicitly.
    pub fn stream(&self) -> impl Stream<Item = Subscription> + Send + 'static {
        self.broadcaster.stream()
    }

    /// Number of tasks in the queue.
    pub async fn len(&self) -> usize {
        self.order.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.order.lock().await.is_empty()
    }

    // ── Reads ────────────────────────────────────────────────────────

    async fn slot(&self, id: Uuid) -> Result<SlotRef, TaskError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound { id })
    }

    /// Latest committed value of one task.
    pub async fn get(&self, id: Uuid) -> Result<Task, TaskError> {
        let slot = self.slot(id).await?;
        let slot = slot.lock().await;
        if !slot.live {
            return Err(TaskError::NotFound { id });
        }
        Ok(slot.task.clone())
    }

    /// Every task, in queue order.
    ///
    /// Holding the order lock while reading keeps the result consistent
    /// with any reorder or prune, and each task reflects its latest commit.
    pub async fn snapshot(&self) -> Vec<Task> {
        let order = self.order.lock().await;
        let slots: Vec<SlotRef> = {
            let map = self.tasks.read().await;
            order.ids().iter().filter_map(|id| map.get(id).cloned()).collect()
        };

        let mut tasks = Vec::with_capacity(slots.len());
        for slot in slots {
            let slot = slot.lock().await;
            if slot.live {
                tasks.push(slot.task.clone());
            }
        }
        tasks
    }

    /// Tasks matching `filter`, in queue order.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        query::filter_tasks(self.snapshot().await, filter)
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Append a new pending task at the tail of the queue.
    pub async fn enqueue(&self, new: NewTask) -> Result<Task, TaskError> {
        let mut order = self.order.lock().await;
        let task = Task::from_new(new, order.tail());

        if let Some(repo) = &self.repo {
            repo.insert_task(&task).await?;
        }

        // Hold the new slot's lock until `created` is out, so no later
        // commit on this task can publish ahead of it. Nobody else can be
        // waiting on a slot that is not yet in the map.
        let slot = Slot::live(task.clone());
        let guard = slot.lock().await;
        self.tasks.write().await.insert(task.id, Arc::clone(&slot));
        order.push(task.id);

        info!(
            task_id = %task.id,
            name = %task.name,
            task_type = ?task.task_type,
            priority = ?task.priority,
            order = task.order,
            "Task enqueued"
        );
        self.broadcaster
            .publish(TaskEvent::for_task(&task, ChangeKind::Created));
        drop(guard);

        Ok(task)
    }

    /// Serialize one mutation of one task.
    ///
    /// `mutate` sees the current value and returns the next one or an
    /// error. On error, or if persistence fails, nothing changes and no
    /// event is published.
    pub(crate) async fn commit<F>(
        &self,
        id: Uuid,
        change: ChangeKind,
        mutate: F,
    ) -> Result<Task, TaskError>
    where
        F: FnOnce(&Task) -> Result<Task, TaskError>,
    {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        if !slot.live {
            return Err(TaskError::NotFound { id });
        }

        let mut next = mutate(&slot.task)?;
        next.id = slot.task.id;
        next.version = slot.task.version + 1;
        next.updated_at = Utc::now();
        if next.status != TaskStatus::Running {
            next.progress = None;
        }

        if let Some(repo) = &self.repo {
            repo.update_task(&next).await?;
        }

        slot.task = next.clone();
        self.broadcaster.publish(TaskEvent::for_task(&next, change));

        Ok(next)
    }

    /// Apply a state-machine action and record an optional failure reason.
    async fn advance(
        &self,
        id: Uuid,
        action: TaskAction,
        last_error: Option<String>,
    ) -> Result<Task, TaskError> {
        let result = self
            .commit(id, ChangeKind::Status, |task| {
                let status = transition(task.status, action).map_err(|e| e.for_task(id))?;
                let mut next = task.clone();
                next.status = status;
                if last_error.is_some() {
                    next.last_error = last_error;
                }
                Ok(next)
            })
            .await;

        match &result {
            Ok(task) => info!(
                task_id = %id,
                action = %action,
                status = %task.status,
                "Task advanced"
            ),
            Err(e) => debug!(task_id = %id, action = %action, error = %e, "Task action rejected"),
        }
        result
    }

    /// Executor tick: a runnable task begins execution.
    pub async fn start(&self, id: Uuid) -> Result<Task, TaskError> {
        self.advance(id, TaskAction::Start, None).await
    }

    /// Executor tick: the running task finished successfully.
    pub async fn complete(&self, id: Uuid) -> Result<Task, TaskError> {
        self.advance(id, TaskAction::Complete, None).await
    }

    /// Executor tick: the running task failed with `reason`.
    pub async fn fail(&self, id: Uuid, reason: impl Into<String>) -> Result<Task, TaskError> {
        self.advance(id, TaskAction::Fail, Some(reason.into())).await
    }

    /// Executor tick: record progress (clamped to 100) of a running task.
    pub async fn report_progress(&self, id: Uuid, progress: u8) -> Result<Task, TaskError> {
        self.commit(id, ChangeKind::Progress, |task| {
            if task.status != TaskStatus::Running {
                return Err(TaskError::NotRunning {
                    id,
                    status: task.status,
                });
            }
            let mut next = task.clone();
            next.progress = Some(progress.min(100));
            Ok(next)
        })
        .await
    }

    /// Move a task to `target` (clamped to the tail), shifting the tasks in
    /// between by one. Moving to the current position is a no-op.
    pub async fn reorder(&self, id: Uuid, target: usize) -> Result<(), TaskError> {
        let mut order = self.order.lock().await;
        let plan = order.plan_move(id, target).ok_or(TaskError::NotFound { id })?;
        if plan.is_noop() {
            debug!(task_id = %id, position = plan.from, "Reorder to same position ignored");
            return Ok(());
        }

        let slots: Vec<SlotRef> = {
            let map = self.tasks.read().await;
            plan.changes
                .iter()
                .map(|(moved, _)| map.get(moved).cloned().ok_or(TaskError::NotFound { id: *moved }))
                .collect::<Result<_, _>>()?
        };

        // Only one multi-task writer runs at a time (it holds `order`), and
        // single-task commits hold at most one slot, so any locking order
        // among these slots is deadlock free.
        let mut guards: Vec<MutexGuard<'_, Slot>> = Vec::with_capacity(slots.len());
        for slot in &slots {
            guards.push(slot.lock().await);
        }

        let now = Utc::now();
        let moved: Vec<Task> = guards
            .iter()
            .zip(&plan.changes)
            .map(|(slot, (_, position))| {
                let mut task = slot.task.clone();
                task.order = *position;
                task.version += 1;
                task.updated_at = now;
                task
            })
            .collect();

        if let Some(repo) = &self.repo {
            repo.update_positions(&moved).await?;
        }

        for (guard, task) in guards.iter_mut().zip(&moved) {
            guard.task = task.clone();
        }
        order.apply(&plan);

        for task in &moved {
            self.broadcaster
                .publish(TaskEvent::for_task(task, ChangeKind::Reordered));
        }

        info!(
            task_id = %id,
            from = plan.from,
            to = plan.to,
            shifted = moved.len(),
            "Task reordered"
        );
        Ok(())
    }

    /// Remove terminal tasks last updated before `cutoff` and close the
    /// gaps they leave. Returns the number removed.
    ///
    /// Only the tail from the first candidate onward is locked, and the map
    /// write lock is taken just to unlink the removed slots.
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, TaskError> {
        let mut order = self.order.lock().await;
        let slots: Vec<SlotRef> = {
            let map = self.tasks.read().await;
            order.ids().iter().filter_map(|id| map.get(id).cloned()).collect()
        };
        let mut first = None;
        for (position, slot) in slots.iter().enumerate() {
            if slot.lock().await.expired(cutoff) {
                first = Some(position);
                break;
            }
        }
        let Some(first) = first else {
            return Ok(0);
        };

        let mut guards: Vec<MutexGuard<'_, Slot>> = Vec::with_capacity(slots.len() - first);
        for slot in &slots[first..] {
            guards.push(slot.lock().await);
        }

        // Re-checked under the locks: a failed task may have been retried.
        let doomed: HashSet<Uuid> = guards
            .iter()
            .filter(|slot| slot.expired(cutoff))
            .map(|slot| slot.task.id)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let shifts: HashMap<Uuid, usize> = order.plan_remove(&doomed).into_iter().collect();
        let now = Utc::now();
        let shifted: Vec<Task> = guards
            .iter()
            .filter_map(|slot| {
                let position = shifts.get(&slot.task.id)?;
                let mut task = slot.task.clone();
                task.order = *position;
                task.version += 1;
                task.updated_at = now;
                Some(task)
            })
            .collect();

        if let Some(repo) = &self.repo {
            let ids: Vec<Uuid> = doomed.iter().copied().collect();
            repo.remove_tasks(&ids, &shifted).await?;
        }

        let mut updates: HashMap<Uuid, &Task> = shifted.iter().map(|t| (t.id, t)).collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for guard in guards.iter_mut() {
            if doomed.contains(&guard.task.id) {
                guard.live = false;
                removed.push((guard.task.id, guard.task.status));
            } else if let Some(task) = updates.remove(&guard.task.id) {
                guard.task = task.clone();
            }
        }
        {
            let mut map = self.tasks.write().await;
            for id in &doomed {
                map.remove(id);
            }
        }
        order.remove(&doomed);

        for (task_id, status) in &removed {
            self.broadcaster.publish(TaskEvent {
                task_id: *task_id,
                status: *status,
                change: ChangeKind::Removed,
                timestamp: now,
            });
        }
        for task in &shifted {
            self.broadcaster
                .publish(TaskEvent::for_task(task, ChangeKind::Reordered));
        }

        info!(removed = removed.len(), shifted = shifted.len(), "Pruned finished tasks");
        Ok(removed.len())
    }

    /// Fail every task still marked running, e.g. after an unclean restart
    /// where no executor survives to finish them.
    pub async fn fail_interrupted(&self, reason: &str) -> Result<usize, TaskError> {
        let running: Vec<Uuid> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id)
            .collect();

        let mut failed = 0;
        for id in running {
            match self.fail(id, reason).await {
                Ok(_) => failed += 1,
                // Raced with another writer; it is no longer running.
                Err(TaskError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if failed > 0 {
            warn!(count = failed, "Interrupted tasks marked failed");
        }
        Ok(failed)
    }
}

/// Spawn a background task that prunes finished tasks older than `retention`
/// every `every`.
pub fn spawn_prune_task(
    store: Arc<TaskStore>,
    retention: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let retention = match chrono::Duration::from_std(retention) {
            Ok(retention) => retention,
            Err(e) => {
                warn!(error = %e, "Prune retention out of range, sweep disabled");
                return;
            }
        };

        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
                continue;
            };
            if let Err(e) = store.prune(cutoff).await {
                warn!(error = %e, "Prune sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::{TaskPriority, TaskType};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;

    fn new_task(name: &str) -> NewTask {
        NewTask::new(name, TaskType::Automation)
    }

    fn drain(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    /// Repository whose writes can be switched to fail.
    #[derive(Default)]
    struct FlakyRepo {
        failing: AtomicBool,
    }

    impl FlakyRepo {
        fn check(&self) -> Result<(), DatabaseError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(DatabaseError::Query("disk full".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl TaskRepository for FlakyRepo {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn insert_task(&self, _task: &Task) -> Result<(), DatabaseError> {
            self.check()
        }
        async fn update_task(&self, _task: &Task) -> Result<(), DatabaseError> {
            self.check()
        }
        async fn update_positions(&self, _tasks: &[Task]) -> Result<(), DatabaseError> {
            self.check()
        }
        async fn remove_tasks(
            &self,
            ids: &[Uuid],
            _shifted: &[Task],
        ) -> Result<usize, DatabaseError> {
            self.check().map(|_| ids.len())
        }
        async fn load_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    /// Repository whose `remove_tasks` parks until a permit is released.
    struct GatedRepo {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl TaskRepository for GatedRepo {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn insert_task(&self, _task: &Task) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn update_task(&self, _task: &Task) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn update_positions(&self, _tasks: &[Task]) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn remove_tasks(
            &self,
            ids: &[Uuid],
            _shifted: &[Task],
        ) -> Result<usize, DatabaseError> {
            let permit = self.gate.acquire().await;
            permit
                .map(|p| p.forget())
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            Ok(ids.len())
        }
        async fn load_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn enqueue_appends_at_tail() {
        let store = TaskStore::new();
        assert!(store.is_empty().await);

        let a = store.enqueue(new_task("a")).await.unwrap();
        let b = store
            .enqueue(new_task("b").with_priority(TaskPriority::High))
            .await
            .unwrap();

        assert_eq!(a.order, 0);
        assert_eq!(b.order, 1);
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(a.version, 0);
        assert_eq!(store.len().await, 2);

        let names: Vec<String> = store.snapshot().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = TaskStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(store.get(id).await, Err(TaskError::NotFound { id: got }) if got == id));
    }

    #[tokio::test]
    async fn each_commit_emits_one_event() {
        let store = TaskStore::new();
        let mut rx = store.subscribe();

        let task = store.enqueue(new_task("a")).await.unwrap();
        store.start(task.id).await.unwrap();
        store.report_progress(task.id, 40).await.unwrap();
        store.complete(task.id).await.unwrap();

        let events = drain(&mut rx);
        let changes: Vec<(ChangeKind, TaskStatus)> =
            events.iter().map(|e| (e.change, e.status)).collect();
        assert_eq!(
            changes,
            vec![
                (ChangeKind::Created, TaskStatus::Pending),
                (ChangeKind::Status, TaskStatus::Running),
                (ChangeKind::Progress, TaskStatus::Running),
                (ChangeKind::Status, TaskStatus::Completed),
            ]
        );
        assert!(events.iter().all(|e| e.task_id == task.id));
    }

    #[tokio::test]
    async fn rejected_commit_changes_nothing() {
        let store = TaskStore::new();
        let task = store.enqueue(new_task("a")).await.unwrap();
        let mut rx = store.subscribe();

        let err = store.complete(task.id).await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
        assert_eq!(store.get(task.id).await.unwrap(), task);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn progress_is_clamped_and_cleared() {
        let store = TaskStore::new();
        let task = store.enqueue(new_task("a")).await.unwrap();

        let err = store.report_progress(task.id, 10).await.unwrap_err();
        assert!(matches!(err, TaskError::NotRunning { status: TaskStatus::Pending, .. }));

        store.start(task.id).await.unwrap();
        let running = store.report_progress(task.id, 250).await.unwrap();
        assert_eq!(running.progress, Some(100));

        let done = store.complete(task.id).await.unwrap();
        assert_eq!(done.progress, None);
    }

    #[tokio::test]
    async fn fail_records_reason_and_bumps_version() {
        let store = TaskStore::new();
        let task = store.enqueue(new_task("a")).await.unwrap();
        store.start(task.id).await.unwrap();

        let failed = store.fail(task.id, "timeout").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
        assert_eq!(failed.version, 2);
        assert!(failed.updated_at >= task.updated_at);
    }

    #[tokio::test]
    async fn reorder_moves_last_to_front() {
        let store = TaskStore::new();
        let a = store.enqueue(new_task("A")).await.unwrap();
        let b = store.enqueue(new_task("B")).await.unwrap();
        let c = store.enqueue(new_task("C")).await.unwrap();
        let mut rx = store.subscribe();

        store.reorder(c.id, 0).await.unwrap();

        let tasks = store.snapshot().await;
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![c.id, a.id, b.id]);
        let orders: Vec<usize> = tasks.iter().map(|t| t.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.change == ChangeKind::Reordered));
    }

    #[tokio::test]
    async fn reorder_applies_to_finished_tasks() {
        let store = TaskStore::new();
        let pending = store.enqueue(new_task("pending")).await.unwrap();
        let done = store.enqueue(new_task("done")).await.unwrap();
        let failed = store.enqueue(new_task("failed")).await.unwrap();
        let cancelled = store.enqueue(new_task("cancelled")).await.unwrap();

        store.start(done.id).await.unwrap();
        store.complete(done.id).await.unwrap();
        store.start(failed.id).await.unwrap();
        store.fail(failed.id, "boom").await.unwrap();
        store
            .commit(cancelled.id, ChangeKind::Status, |t| {
                let mut next = t.clone();
                next.status = TaskStatus::Cancelled;
                Ok(next)
            })
            .await
            .unwrap();

        store.reorder(cancelled.id, 0).await.unwrap();
        store.reorder(failed.id, 0).await.unwrap();
        store.reorder(done.id, 0).await.unwrap();

        let tasks = store.snapshot().await;
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![done.id, failed.id, cancelled.id, pending.id]);
        let statuses: Vec<TaskStatus> = tasks.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
                TaskStatus::Pending,
            ]
        );
    }

    #[tokio::test]
    async fn reorders_racing_status_changes_keep_order_dense() {
        let store = TaskStore::new();
        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(store.enqueue(new_task(&format!("t{i}"))).await.unwrap().id);
        }
        let done = ids[5];
        store.start(done).await.unwrap();
        store.complete(done).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..100 {
            let s = Arc::clone(&store);
            let (id, target) = (ids[i % 20], (i * 7) % 20);
            handles.push(tokio::spawn(async move { s.reorder(id, target).await }));

            let s = Arc::clone(&store);
            let id = ids[(i * 3) % 20];
            handles.push(tokio::spawn(async move { s.start(id).await.map(|_| ()) }));
        }
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) | Err(TaskError::InvalidTransition { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        store.reorder(done, 0).await.unwrap();

        let tasks = store.snapshot().await;
        assert_eq!(tasks.len(), 20);
        let orders: Vec<usize> = tasks.iter().map(|t| t.order).collect();
        assert_eq!(orders, (0..20).collect::<Vec<_>>());
        assert_eq!(tasks[0].id, done);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert!(tasks[1..].iter().all(|t| t.status == TaskStatus::Running));
    }

    #[tokio::test]
    async fn reorder_same_position_is_silent() {
        let store = TaskStore::new();
        let a = store.enqueue(new_task("A")).await.unwrap();
        store.enqueue(new_task("B")).await.unwrap();
        let mut rx = store.subscribe();

        store.reorder(a.id, 0).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.get(a.id).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn reorder_unknown_is_not_found() {
        let store = TaskStore::new();
        store.enqueue(new_task("A")).await.unwrap();
        let err = store.reorder(Uuid::new_v4(), 0).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn reorder_past_end_clamps() {
        let store = TaskStore::new();
        let a = store.enqueue(new_task("A")).await.unwrap();
        let b = store.enqueue(new_task("B")).await.unwrap();

        store.reorder(a.id, 42).await.unwrap();
        let ids: Vec<Uuid> = store.snapshot().await.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn concurrent_mutations_of_one_task_serialize() {
        let store = TaskStore::new();
        let task = store.enqueue(new_task("a")).await.unwrap();
        store.start(task.id).await.unwrap();

        let handles: Vec<_> = (0..20u8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.report_progress(task.id, i).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // start plus 20 progress commits, none lost
        assert_eq!(store.get(task.id).await.unwrap().version, 21);
    }

    #[tokio::test]
    async fn per_task_events_follow_commit_order() {
        let store = TaskStore::new();
        let mut stream = Box::pin(store.stream());
        let task = store.enqueue(new_task("a")).await.unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.start(task.id).await.unwrap();
                for p in 0..10u8 {
                    store.report_progress(task.id, p * 10).await.unwrap();
                }
                store.complete(task.id).await.unwrap();
            })
        };
        writer.await.unwrap();

        let mut changes = Vec::new();
        for _ in 0..13 {
            match stream.next().await {
                Some(Subscription::Event(ev)) => changes.push((ev.change, ev.status)),
                other => panic!("expected event, got {other:?}"),
            }
        }

        let mut expected = vec![
            (ChangeKind::Created, TaskStatus::Pending),
            (ChangeKind::Status, TaskStatus::Running),
        ];
        expected.extend(std::iter::repeat_n((ChangeKind::Progress, TaskStatus::Running), 10));
        expected.push((ChangeKind::Status, TaskStatus::Completed));
        assert_eq!(changes, expected);
    }

    #[tokio::test]
    async fn persistence_failure_leaves_state_unchanged() {
        let repo = Arc::new(FlakyRepo::default());
        let store = TaskStore::open(repo.clone(), 16).await.unwrap();
        let task = store.enqueue(new_task("a")).await.unwrap();
        let other = store.enqueue(new_task("b")).await.unwrap();
        let mut rx = store.subscribe();

        repo.failing.store(true, Ordering::SeqCst);

        let err = store.start(task.id).await.unwrap_err();
        assert_eq!(err.code(), "database");
        assert_eq!(store.get(task.id).await.unwrap(), task);

        assert!(store.reorder(other.id, 0).await.is_err());
        let ids: Vec<Uuid> = store.snapshot().await.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![task.id, other.id]);

        assert!(store.enqueue(new_task("c")).await.is_err());
        assert_eq!(store.len().await, 2);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn prune_removes_old_terminal_tasks() {
        let store = TaskStore::new();
        let a = store.enqueue(new_task("a")).await.unwrap();
        let b = store.enqueue(new_task("b")).await.unwrap();
        let c = store.enqueue(new_task("c")).await.unwrap();
        store.start(a.id).await.unwrap();
        store.complete(a.id).await.unwrap();
        let mut rx = store.subscribe();

        let removed = store.prune(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);

        let tasks = store.snapshot().await;
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b.id, c.id]);
        assert_eq!(tasks[0].order, 0);
        assert_eq!(tasks[1].order, 1);
        assert!(matches!(store.get(a.id).await, Err(TaskError::NotFound { .. })));

        let events = drain(&mut rx);
        assert_eq!(events[0].change, ChangeKind::Removed);
        assert_eq!(events[0].task_id, a.id);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn prune_leaves_tasks_ahead_of_candidates_usable() {
        let gate = Arc::new(Semaphore::new(0));
        let repo = Arc::new(GatedRepo { gate: Arc::clone(&gate) });
        let store = TaskStore::open(repo, 16).await.unwrap();
        let keep = store.enqueue(new_task("keep")).await.unwrap();
        let old = store.enqueue(new_task("old")).await.unwrap();
        store.start(old.id).await.unwrap();
        store.complete(old.id).await.unwrap();

        let pruning = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.prune(Utc::now() + chrono::Duration::seconds(1)).await }
        });
        // Let the sweep park inside the repository.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pruning.is_finished());

        let wait = std::time::Duration::from_secs(1);
        let got = tokio::time::timeout(wait, store.get(keep.id)).await.unwrap();
        assert_eq!(got.unwrap().status, TaskStatus::Pending);
        let started = tokio::time::timeout(wait, store.start(keep.id)).await.unwrap();
        assert_eq!(started.unwrap().status, TaskStatus::Running);

        gate.add_permits(1);
        assert_eq!(pruning.await.unwrap().unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn prune_keeps_recent_and_active_tasks() {
        let store = TaskStore::new();
        let a = store.enqueue(new_task("a")).await.unwrap();
        store.enqueue(new_task("b")).await.unwrap();
        store.start(a.id).await.unwrap();
        store.complete(a.id).await.unwrap();

        let removed = store.prune(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn open_restores_persisted_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");

        let (a, b) = {
            let repo = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
            let store = TaskStore::open(repo, 16).await.unwrap();
            let a = store.enqueue(new_task("a")).await.unwrap();
            let b = store.enqueue(new_task("b")).await.unwrap();
            store.reorder(b.id, 0).await.unwrap();
            store.start(a.id).await.unwrap();
            (a, b)
        };

        let repo = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let store = TaskStore::open(repo, 16).await.unwrap();
        let tasks = store.snapshot().await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, b.id);
        assert_eq!(tasks[1].id, a.id);
        assert_eq!(tasks[1].status, TaskStatus::Running);

        let failed = store.fail_interrupted("interrupted by restart").await.unwrap();
        assert_eq!(failed, 1);
        let a = store.get(a.id).await.unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.last_error.as_deref(), Some("interrupted by restart"));
    }

    #[tokio::test]
    async fn list_applies_filter_in_order() {
        let store = TaskStore::new();
        let a = store.enqueue(new_task("Deploy api")).await.unwrap();
        store.enqueue(new_task("Backup")).await.unwrap();
        let c = store.enqueue(new_task("deploy web")).await.unwrap();

        let found = store
            .list(&TaskFilter::default().with_search("DEPLOY"))
            .await;
        let ids: Vec<Uuid> = found.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }
}
