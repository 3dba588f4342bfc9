//! Change broadcaster — fan-out of committed task mutations.
//!
//! Delivery is at-most-once per subscriber. A subscriber that falls more
//! than `capacity` events behind loses the oldest ones and is told how
//! many it missed; it must re-query for a full snapshot.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use super::model::{Task, TaskStatus};

/// Default broadcast channel capacity.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// What kind of mutation produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Status,
    Progress,
    Reordered,
    Removed,
}

/// One committed mutation of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub change: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn for_task(task: &Task, change: ChangeKind) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            change,
            timestamp: task.updated_at,
        }
    }
}

/// Item yielded by `ChangeBroadcaster::stream`.
#[derive(Debug, Clone, PartialEq)]
pub enum Subscription {
    Event(TaskEvent),
    /// Events were dropped; reconcile via a fresh `list`.
    Lagged { missed: u64 },
}

/// Push channel for task events.
#[derive(Debug, Clone)]
pub struct ChangeBroadcaster {
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl ChangeBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish without waiting on subscribers. Ok if nobody is listening.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, surfacing lag instead of hiding it.
    pub fn stream(&self) -> impl Stream<Item = Subscription> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).map(|item| match item {
            Ok(event) => Subscription::Event(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Subscription::Lagged { missed },
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
