use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rpa_core_types::{EnvironmentId, ErrorInfo, FlowId, NodeId, TaskId, TaskStatus, Variables};
use rpa_flow::{ExecutionState, StepLog};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PRIORITY: i32 = 5;

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// Submission request for a new task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<TaskId>,
    #[serde(default)]
    pub name: Option<String>,
    pub flow: FlowId,
    pub environment: EnvironmentId,
    /// Overrides applied on top of the flow defaults
    #[serde(default)]
    pub variables: Variables,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Falls back to the scheduler's `default_max_retries`
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Deferred execution; the task stays pending until then
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl TaskSpec {
    pub fn new(flow: impl Into<FlowId>, environment: impl Into<EnvironmentId>) -> Self {
        Self {
            id: None,
            name: None,
            flow: flow.into(),
            environment: environment.into(),
            variables: Variables::new(),
            priority: DEFAULT_PRIORITY,
            max_retries: None,
            scheduled_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// One failed attempt kept for diagnosis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub error: ErrorInfo,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    /// Delay before the next attempt; `None` when the failure was final
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

/// A scheduled unit of work and everything known about its execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: Option<String>,
    pub flow: FlowId,
    pub flow_version: u32,
    pub environment: EnvironmentId,
    pub status: TaskStatus,
    pub priority: i32,
    pub progress: u8,
    /// Per-task overrides, kept so retries restart from a clean environment
    pub inputs: Variables,
    pub execution: ExecutionState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Earliest time a retried task may run again
    pub ready_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorInfo>,
    pub attempts: Vec<AttemptRecord>,
    /// Final variable environment of a completed task
    pub result: Option<Variables>,
    pub logs: VecDeque<StepLog>,
}

impl Task {
    pub fn current_node(&self) -> Option<&NodeId> {
        self.execution.pointer.as_ref()
    }

    pub fn variables(&self) -> &Variables {
        &self.execution.variables
    }

    pub fn duration(&self) -> Option<ChronoDuration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    pub(crate) fn push_log(&mut self, log: StepLog, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.logs.len() >= capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(log);
    }

    /// Moves to `next`. Debug builds reject transitions the status machine
    /// does not allow.
    pub(crate) fn set_status(&mut self, next: TaskStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal status transition {} -> {} for task {}",
            self.status.as_str(),
            next.as_str(),
            self.id
        );
        self.status = next;
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn to_record(&self, last_event_seq: u64) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            flow: self.flow.clone(),
            environment: self.environment.clone(),
            status: self.status,
            priority: self.priority,
            progress: self.progress,
            inputs: self.inputs.clone(),
            execution: self.execution.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            started_at: self.started_at,
            last_error: self.last_error.clone(),
            attempts: self.attempts.clone(),
            last_event_seq,
        }
    }
}

/// Durable snapshot of a non-terminal task, enough to resume it after a
/// restart from its saved node pointer and variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    #[serde(default)]
    pub name: Option<String>,
    pub flow: FlowId,
    pub environment: EnvironmentId,
    /// Status when the record was taken
    pub status: TaskStatus,
    pub priority: i32,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub inputs: Variables,
    pub execution: ExecutionState,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<ErrorInfo>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Progress events continue after this sequence number
    #[serde(default)]
    pub last_event_seq: u64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_lease_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_idle_poll_ms() -> u64 {
    500
}

fn default_log_capacity() -> usize {
    200
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker slots
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
    /// Per-action timeout when the flow sets none. Off by default.
    #[serde(default)]
    pub action_timeout_ms: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Upper bound on how long the dispatcher sleeps without a wake-up
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Log lines kept per task
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            lease_timeout_ms: default_lease_timeout_ms(),
            action_timeout_ms: None,
            default_max_retries: default_max_retries(),
            idle_poll_ms: default_idle_poll_ms(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.lease_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_action_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.action_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }
}

/// Counts of tasks by status plus queue and slot occupancy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Pending tasks in the ready queue, including deferred ones
    pub queued: usize,
    pub available_slots: usize,
}

impl SchedulerStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.paused + self.completed + self.failed + self.cancelled
    }

    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}

/// Outcome of a [`crate::Scheduler::recover`] call.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<TaskId>,
    pub rejected: Vec<(TaskId, crate::error::SchedulerError)>,
}
