//! Task lifecycle core — state machine, queue order, dispatch and push updates.

pub mod broadcast;
pub mod dispatcher;
pub mod model;
pub mod order;
pub mod query;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transition;
pub mod ws;

pub use broadcast::{ChangeBroadcaster, ChangeKind, Subscription, TaskEvent};
pub use dispatcher::{ActionDispatcher, ApplyParams, BulkOutcome};
pub use model::{NewTask, OperatorAction, Task, TaskAction, TaskPriority, TaskStatus, TaskType};
pub use query::TaskFilter;
pub use retry::RetryPolicy;
pub use scheduler::{RunContext, Scheduler, SchedulerConfig, TaskHandler};
pub use store::TaskStore;
