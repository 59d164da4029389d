//! Priority task scheduler.
//!
//! Tasks wait in a ready queue ordered by priority and submission order. A
//! dispatcher hands ready tasks to a bounded set of worker slots; each worker
//! leases the task's environment, steps its flow and reports every transition.
//! Failed attempts go through the retry controller and come back as pending
//! after their backoff delay.

pub mod api;
pub mod error;
pub mod metrics;
pub mod model;
mod orchestrator;
pub mod queue;
pub mod retry;
mod runtime;

pub use api::{Scheduler, SchedulerBuilder};
pub use error::SchedulerError;
pub use model::{
    AttemptRecord, RecoveryReport, SchedulerConfig, SchedulerStats, Task, TaskRecord, TaskSpec, DEFAULT_PRIORITY,
};
pub use queue::{QueueEntry, ReadyQueue};
pub use retry::{decide, seed_for, RetryPolicy, RetryVerdict};
pub use rpa_core_types::TaskStatus;
