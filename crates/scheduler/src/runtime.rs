//! Scheduler state owned behind a single lock.
//!
//! Every transition happens here, synchronously, and pushes its progress
//! event onto the event channel while the lock is held, so the order events
//! reach the reporter is the order transitions happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rpa_core_types::{EnvironmentId, ErrorInfo, FlowId, TaskId, TaskStatus};
use rpa_flow::{ExecutionState, FlowCatalog, StepLog};
use rpa_progress::{EventKind, ProgressEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::metrics;
use crate::model::{AttemptRecord, SchedulerStats, Task, TaskRecord};
use crate::queue::{QueueEntry, ReadyQueue};
use crate::retry::{decide, seed_for, RetryPolicy, RetryVerdict};

pub(crate) enum PumpMsg {
    Event(ProgressEvent),
    Flush(oneshot::Sender<()>),
}

/// Flags a running attempt polls between steps.
#[derive(Clone, Debug, Default)]
pub(crate) struct AttemptControl {
    pub cancel: CancellationToken,
    pause: Arc<AtomicBool>,
}

impl AttemptControl {
    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::Acquire)
    }

    fn set_pause(&self, value: bool) {
        self.pause.store(value, Ordering::Release);
    }
}

struct TaskSlot {
    task: Task,
    seq: u64,
    event_seq: u64,
    control: Option<AttemptControl>,
}

/// Work handed from the dispatcher to a worker.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub task: TaskId,
    pub flow: FlowId,
    pub environment: EnvironmentId,
    pub execution: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub control: AttemptControl,
}

#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Completed(ExecutionState),
    Failed { state: ExecutionState, error: ErrorInfo },
    Cancelled(ExecutionState),
    Paused(ExecutionState),
}

pub(crate) enum Pick {
    Dispatch(Dispatch),
    Idle { wake_at: Option<Instant> },
}

/// Converts a wall-clock schedule time into a queue instant; past times are
/// ready immediately.
pub(crate) fn instant_for(at: DateTime<Utc>) -> Option<Instant> {
    (at - Utc::now()).to_std().ok().map(|delay| Instant::now() + delay)
}

fn emit(
    events: &mpsc::UnboundedSender<PumpMsg>,
    slot: &mut TaskSlot,
    kind: EventKind,
    message: Option<String>,
    error: Option<ErrorInfo>,
) {
    slot.event_seq += 1;
    let task = &slot.task;
    let mut event = ProgressEvent::new(task.id.clone(), slot.event_seq, kind, task.status, task.progress)
        .with_node(task.current_node().cloned())
        .with_error(error);
    if let Some(message) = message {
        event = event.with_message(message);
    }
    if events.send(PumpMsg::Event(event)).is_err() {
        debug!(target: "scheduler", task_id = %task.id, "progress channel closed");
    }
}

pub(crate) struct SchedulerState {
    tasks: HashMap<TaskId, TaskSlot>,
    queue: ReadyQueue,
    /// Environments bound to a dispatched task
    claimed: HashMap<EnvironmentId, TaskId>,
    flow_running: HashMap<FlowId, usize>,
    running: usize,
    next_seq: u64,
    shutting_down: bool,
    log_capacity: usize,
    events: mpsc::UnboundedSender<PumpMsg>,
}

impl SchedulerState {
    pub fn new(events: mpsc::UnboundedSender<PumpMsg>, log_capacity: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            queue: ReadyQueue::new(),
            claimed: HashMap::new(),
            flow_running: HashMap::new(),
            running: 0,
            next_seq: 0,
            shutting_down: false,
            log_capacity,
            events,
        }
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Nothing running and nothing waiting in the ready queue.
    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.queue.is_empty()
    }

    /// Adds a pending task to the ready queue. `event_seq` continues the
    /// task's progress sequence, 0 for new tasks.
    pub fn insert(
        &mut self,
        task: Task,
        event_seq: u64,
        ready_at: Option<Instant>,
        message: &str,
    ) -> Result<(), SchedulerError> {
        if self.shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }
        if self.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueueEntry {
            task: task.id.clone(),
            priority: task.priority,
            seq,
            environment: task.environment.clone(),
            flow: task.flow.clone(),
            ready_at,
        });
        let id = task.id.clone();
        let slot = self.tasks.entry(id).or_insert(TaskSlot {
            task,
            seq,
            event_seq,
            control: None,
        });
        info!(
            target: "scheduler",
            task_id = %slot.task.id,
            flow = %slot.task.flow,
            environment = %slot.task.environment,
            priority = slot.task.priority,
            deferred = ready_at.is_some(),
            "task queued"
        );
        emit(&self.events, slot, EventKind::Status, Some(message.to_string()), None);
        metrics::set_gauges(self.running, self.queue.len());
        Ok(())
    }

    /// Takes the highest-priority ready task whose environment is free and
    /// whose flow is below its instance limit, scanning past blocked ones.
    pub fn pick(&mut self, now: Instant, flows: &FlowCatalog) -> Pick {
        if self.shutting_down {
            return Pick::Idle { wake_at: None };
        }
        loop {
            let claimed = &self.claimed;
            let flow_running = &self.flow_running;
            let entry = self.queue.select(now, |entry| {
                if claimed.contains_key(&entry.environment) {
                    return false;
                }
                let limit = flows
                    .get(&entry.flow)
                    .and_then(|flow| flow.settings().max_concurrent_instances);
                limit.map_or(true, |limit| {
                    flow_running.get(&entry.flow).copied().unwrap_or(0) < limit
                })
            });
            let Some(entry) = entry else {
                return Pick::Idle {
                    wake_at: self.queue.next_wakeup(now),
                };
            };
            let Some(slot) = self.tasks.get_mut(&entry.task) else {
                warn!(target: "scheduler", task_id = %entry.task, "queued task has no record");
                continue;
            };

            let started_at = Utc::now();
            let control = AttemptControl::default();
            slot.task.set_status(TaskStatus::Running);
            slot.task.started_at.get_or_insert(started_at);
            slot.task.ready_at = None;
            slot.task.touch();
            slot.control = Some(control.clone());

            self.claimed.insert(entry.environment.clone(), entry.task.clone());
            *self.flow_running.entry(entry.flow.clone()).or_insert(0) += 1;
            self.running += 1;

            let attempt = slot.task.attempts.len() + 1;
            info!(
                target: "scheduler",
                task_id = %slot.task.id,
                environment = %entry.environment,
                attempt,
                running = self.running,
                "task dispatched"
            );
            emit(
                &self.events,
                slot,
                EventKind::Status,
                Some(format!("attempt {attempt} started")),
                None,
            );
            metrics::set_gauges(self.running, self.queue.len());
            return Pick::Dispatch(Dispatch {
                task: entry.task,
                flow: entry.flow,
                environment: entry.environment,
                execution: slot.task.execution.clone(),
                started_at,
                control,
            });
        }
    }

    /// Saves the state after a step so pause and recovery see it.
    pub fn record_step(&mut self, id: &TaskId, state: &ExecutionState, progress: u8, logs: Vec<StepLog>) {
        let capacity = self.log_capacity;
        let Some(slot) = self.tasks.get_mut(id) else {
            return;
        };
        slot.task.execution = state.clone();
        slot.task.progress = slot.task.progress.max(progress);
        slot.task.touch();
        emit(&self.events, slot, EventKind::Progress, None, None);
        for log in logs {
            let message = log.message.clone();
            slot.task.push_log(log, capacity);
            emit(&self.events, slot, EventKind::Log, Some(message), None);
        }
    }

    /// Applies the result of an attempt: frees the environment claim and the
    /// flow instance count, then moves the task to its next status.
    pub fn finish(
        &mut self,
        dispatch: Dispatch,
        outcome: AttemptOutcome,
        policy: &RetryPolicy,
        flows: &FlowCatalog,
    ) {
        if self.claimed.get(&dispatch.environment) == Some(&dispatch.task) {
            self.claimed.remove(&dispatch.environment);
        }
        if let Some(count) = self.flow_running.get_mut(&dispatch.flow) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.flow_running.remove(&dispatch.flow);
            }
        }
        self.running = self.running.saturating_sub(1);

        let Some(slot) = self.tasks.get_mut(&dispatch.task) else {
            warn!(target: "scheduler", task_id = %dispatch.task, "finished task has no record");
            return;
        };
        slot.control = None;
        let now = Utc::now();

        match outcome {
            AttemptOutcome::Completed(state) => {
                let task = &mut slot.task;
                task.result = Some(state.variables.clone());
                task.execution = state;
                task.set_status(TaskStatus::Completed);
                task.progress = 100;
                task.completed_at = Some(now);
                task.touch();
                flows.record_execution(&task.flow, true);
                metrics::record_outcome("completed");
                info!(
                    target: "scheduler",
                    task_id = %task.id,
                    steps = task.execution.steps,
                    duration_ms = task.duration().map(|d| d.num_milliseconds()).unwrap_or(0),
                    "task completed"
                );
                emit(&self.events, slot, EventKind::Status, Some("completed".into()), None);
            }
            AttemptOutcome::Cancelled(state) => {
                let task = &mut slot.task;
                task.execution = state;
                task.set_status(TaskStatus::Cancelled);
                task.completed_at = Some(now);
                task.touch();
                metrics::record_outcome("cancelled");
                info!(target: "scheduler", task_id = %task.id, "task cancelled");
                emit(&self.events, slot, EventKind::Status, Some("cancelled".into()), None);
            }
            AttemptOutcome::Paused(state) => {
                let task = &mut slot.task;
                task.execution = state;
                task.set_status(TaskStatus::Paused);
                task.touch();
                let message = match task.current_node() {
                    Some(node) => format!("paused before node {node}"),
                    None => "paused".to_string(),
                };
                info!(target: "scheduler", task_id = %task.id, "task paused");
                emit(&self.events, slot, EventKind::Status, Some(message), None);
            }
            AttemptOutcome::Failed { state, error } => {
                let task = &mut slot.task;
                task.execution = state;
                task.last_error = Some(error.clone());
                let attempt = task.attempts.len() as u32 + 1;
                let verdict = decide(
                    error.class,
                    task.retry_count,
                    task.max_retries,
                    policy,
                    seed_for(task.id.as_str()),
                );
                match verdict {
                    RetryVerdict::Retry { retry_count, .. } => {
                        let delay = verdict.total_delay().unwrap_or(Duration::ZERO);
                        task.attempts.push(AttemptRecord {
                            attempt,
                            error: error.clone(),
                            started_at: Some(dispatch.started_at),
                            ended_at: now,
                            retry_delay_ms: Some(delay.as_millis() as u64),
                        });
                        task.retry_count = retry_count;
                        task.set_status(TaskStatus::Pending);
                        task.progress = 0;
                        if let Some(flow) = flows.get(&task.flow) {
                            task.execution = ExecutionState::start(&flow, &task.inputs);
                        }
                        task.ready_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                        task.touch();
                        self.queue.push(QueueEntry {
                            task: task.id.clone(),
                            priority: task.priority,
                            seq: slot.seq,
                            environment: task.environment.clone(),
                            flow: task.flow.clone(),
                            ready_at: Some(Instant::now() + delay),
                        });
                        metrics::record_retry();
                        warn!(
                            target: "scheduler",
                            task_id = %task.id,
                            retry_count,
                            max_retries = task.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "attempt failed, retry scheduled"
                        );
                        let message = format!(
                            "retry {}/{} in {}ms",
                            retry_count,
                            task.max_retries,
                            delay.as_millis()
                        );
                        emit(&self.events, slot, EventKind::Status, Some(message), Some(error));
                    }
                    RetryVerdict::Terminate => {
                        task.attempts.push(AttemptRecord {
                            attempt,
                            error: error.clone(),
                            started_at: Some(dispatch.started_at),
                            ended_at: now,
                            retry_delay_ms: None,
                        });
                        task.set_status(TaskStatus::Failed);
                        task.completed_at = Some(now);
                        task.touch();
                        flows.record_execution(&task.flow, false);
                        metrics::record_outcome("failed");
                        warn!(
                            target: "scheduler",
                            task_id = %task.id,
                            attempts = task.attempts.len(),
                            error = %error,
                            "task failed"
                        );
                        emit(&self.events, slot, EventKind::Status, Some("failed".into()), Some(error));
                    }
                }
            }
        }
        metrics::set_gauges(self.running, self.queue.len());
    }

    /// Pending and paused tasks end immediately; a running task is flagged
    /// and stops at its next node boundary. Terminal tasks are left alone.
    pub fn cancel(&mut self, id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        let slot = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        match slot.task.status {
            TaskStatus::Pending | TaskStatus::Paused => {
                self.queue.remove(id);
                slot.task.set_status(TaskStatus::Cancelled);
                slot.task.completed_at = Some(Utc::now());
                slot.task.ready_at = None;
                slot.task.touch();
                metrics::record_outcome("cancelled");
                info!(target: "scheduler", task_id = %id, "task cancelled before running");
                emit(&self.events, slot, EventKind::Status, Some("cancelled".into()), None);
                metrics::set_gauges(self.running, self.queue.len());
            }
            TaskStatus::Running => {
                if let Some(control) = &slot.control {
                    control.cancel.cancel();
                }
                info!(target: "scheduler", task_id = %id, "cancellation requested");
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {}
        }
        Ok(slot.task.status)
    }

    pub fn pause(&mut self, id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        let slot = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        match slot.task.status {
            TaskStatus::Running => {
                if let Some(control) = &slot.control {
                    control.set_pause(true);
                }
                info!(target: "scheduler", task_id = %id, "pause requested");
                Ok(TaskStatus::Running)
            }
            TaskStatus::Paused => Ok(TaskStatus::Paused),
            status => Err(SchedulerError::InvalidTransition {
                task: id.clone(),
                status,
                action: "pause",
            }),
        }
    }

    /// Re-queues a paused task, or withdraws a pause request that has not
    /// taken effect yet.
    pub fn resume(&mut self, id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        let slot = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        match slot.task.status {
            TaskStatus::Paused => {
                if !self.queue.contains(id) {
                    self.queue.push(QueueEntry {
                        task: id.clone(),
                        priority: slot.task.priority,
                        seq: slot.seq,
                        environment: slot.task.environment.clone(),
                        flow: slot.task.flow.clone(),
                        ready_at: None,
                    });
                    info!(target: "scheduler", task_id = %id, "task resumed");
                    emit(&self.events, slot, EventKind::Log, Some("resume requested".into()), None);
                    metrics::set_gauges(self.running, self.queue.len());
                }
                Ok(TaskStatus::Paused)
            }
            TaskStatus::Running => {
                if let Some(control) = &slot.control {
                    control.set_pause(false);
                }
                Ok(TaskStatus::Running)
            }
            status => Err(SchedulerError::InvalidTransition {
                task: id.clone(),
                status,
                action: "resume",
            }),
        }
    }

    /// Manual retry of a failed task within its retry budget.
    pub fn retry(&mut self, id: &TaskId, flows: &FlowCatalog) -> Result<(), SchedulerError> {
        let slot = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        let task = &mut slot.task;
        if task.status != TaskStatus::Failed {
            return Err(SchedulerError::InvalidTransition {
                task: id.clone(),
                status: task.status,
                action: "retry",
            });
        }
        if !task.can_retry() {
            return Err(SchedulerError::RetryExhausted {
                task: id.clone(),
                max_retries: task.max_retries,
            });
        }
        let flow = flows
            .get(&task.flow)
            .ok_or_else(|| SchedulerError::InvalidReference(format!("unknown flow {}", task.flow)))?;
        task.retry_count += 1;
        task.set_status(TaskStatus::Pending);
        task.progress = 0;
        task.completed_at = None;
        task.execution = ExecutionState::start(&flow, &task.inputs);
        task.touch();
        self.queue.push(QueueEntry {
            task: id.clone(),
            priority: task.priority,
            seq: slot.seq,
            environment: task.environment.clone(),
            flow: task.flow.clone(),
            ready_at: None,
        });
        info!(target: "scheduler", task_id = %id, retry_count = slot.task.retry_count, "manual retry queued");
        emit(&self.events, slot, EventKind::Status, Some("retry requested".into()), None);
        metrics::set_gauges(self.running, self.queue.len());
        Ok(())
    }

    /// Deletes a terminal task.
    pub fn remove(&mut self, id: &TaskId) -> Result<Task, SchedulerError> {
        let status = self
            .tasks
            .get(id)
            .map(|slot| slot.task.status)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                task: id.clone(),
                status,
                action: "remove",
            });
        }
        self.tasks
            .remove(id)
            .map(|slot| slot.task)
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))
    }

    /// Stops dispatching and asks every running attempt to pause.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        for slot in self.tasks.values() {
            if let Some(control) = &slot.control {
                control.set_pause(true);
            }
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).map(|slot| slot.task.clone())
    }

    /// All tasks in submission order.
    pub fn tasks(&self) -> Vec<Task> {
        let mut slots: Vec<_> = self.tasks.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.task.clone()).collect()
    }

    pub fn export_recoverable(&self) -> Vec<TaskRecord> {
        let mut slots: Vec<_> = self
            .tasks
            .values()
            .filter(|slot| !slot.task.status.is_terminal())
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        slots
            .into_iter()
            .map(|slot| slot.task.to_record(slot.event_seq))
            .collect()
    }

    pub fn stats(&self, available_slots: usize) -> SchedulerStats {
        let mut stats = SchedulerStats {
            queued: self.queue.len(),
            available_slots,
            ..SchedulerStats::default()
        };
        for slot in self.tasks.values() {
            match slot.task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}
