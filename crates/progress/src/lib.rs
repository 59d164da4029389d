//! Progress reporting for scheduled tasks.
//!
//! The scheduler and the flow interpreter push [`ProgressEvent`]s into a
//! [`ProgressReporter`]. Delivery is at-least-once; every event carries a
//! per-task sequence number so consumers can drop duplicates.

pub mod bus;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rpa_core_types::{ErrorInfo, NodeId, RpaError, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use bus::{to_mpsc, BroadcastProgressReporter};
pub use memory::{InMemoryProgressReporter, ProgressStats, TaskView};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Status transition of the task.
    Status,
    /// Pointer/progress update while running.
    Progress,
    /// Execution log line.
    Log,
}

/// One entry of the ordered per-task event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    /// Strictly increasing per task; duplicates share the same value.
    pub seq: u64,
    pub kind: EventKind,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default)]
    pub current_node: Option<NodeId>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub recorded_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, seq: u64, kind: EventKind, status: TaskStatus, progress: u8) -> Self {
        Self {
            task_id,
            seq,
            kind,
            status,
            progress: progress.min(100),
            current_node: None,
            message: None,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_node(mut self, node: Option<NodeId>) -> Self {
        self.current_node = node;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: Option<ErrorInfo>) -> Self {
        self.error = error;
        self
    }
}

#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, event: ProgressEvent) -> Result<(), RpaError>;
}

#[async_trait]
impl<R> ProgressReporter for Arc<R>
where
    R: ProgressReporter + ?Sized,
{
    async fn report(&self, event: ProgressEvent) -> Result<(), RpaError> {
        (**self).report(event).await
    }
}

/// Reporter that drops everything.
pub struct NoopProgressReporter;

impl NoopProgressReporter {
    pub fn new() -> Arc<dyn ProgressReporter> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ProgressReporter for NoopProgressReporter {
    async fn report(&self, _event: ProgressEvent) -> Result<(), RpaError> {
        Ok(())
    }
}

/// Delivers each event to every sink in order. A failing sink is logged and
/// skipped so one broken consumer cannot stall the others.
#[derive(Default)]
pub struct FanoutReporter {
    sinks: Vec<Arc<dyn ProgressReporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressReporter>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl ProgressReporter for FanoutReporter {
    async fn report(&self, event: ProgressEvent) -> Result<(), RpaError> {
        for sink in &self.sinks {
            if let Err(err) = sink.report(event.clone()).await {
                warn!(task_id = %event.task_id, seq = event.seq, "progress sink failed: {err}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl ProgressReporter for FailingSink {
        async fn report(&self, _event: ProgressEvent) -> Result<(), RpaError> {
            Err(RpaError::new("sink down"))
        }
    }

    #[tokio::test]
    async fn fanout_skips_failing_sink() {
        let memory = Arc::new(InMemoryProgressReporter::new(8));
        let fanout = FanoutReporter::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(memory.clone());
        let task = TaskId::from("t-1");
        fanout
            .report(ProgressEvent::new(
                task.clone(),
                1,
                EventKind::Status,
                TaskStatus::Running,
                0,
            ))
            .await
            .unwrap();
        assert_eq!(memory.recent_task(&task).len(), 1);
        assert_eq!(fanout.len(), 2);
    }

    #[test]
    fn progress_is_clamped() {
        let event = ProgressEvent::new(TaskId::new(), 1, EventKind::Progress, TaskStatus::Running, 250);
        assert_eq!(event.progress, 100);
    }
}
