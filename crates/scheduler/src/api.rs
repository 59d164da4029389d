use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rpa_core_types::{TaskId, TaskStatus};
use rpa_flow::{ActionExecutor, ExecutionState, FlowCatalog};
use rpa_lease_pool::LeasePool;
use rpa_progress::{NoopProgressReporter, ProgressReporter};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::error::SchedulerError;
use crate::metrics;
use crate::model::{RecoveryReport, SchedulerConfig, SchedulerStats, Task, TaskRecord, TaskSpec};
use crate::orchestrator::{dispatch_loop, pump_events, Inner, Workers};
use crate::retry::RetryPolicy;
use crate::runtime::{instant_for, PumpMsg, SchedulerState};

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    policy: RetryPolicy,
    flows: Arc<FlowCatalog>,
    pool: Arc<LeasePool>,
    executor: Arc<dyn ActionExecutor>,
    reporter: Arc<dyn ProgressReporter>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn build(self) -> Scheduler {
        let (events, rx) = mpsc::unbounded_channel();
        let slots = self.config.max_concurrent.max(1);
        let state = SchedulerState::new(events.clone(), self.config.log_capacity);
        Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                policy: self.policy,
                flows: self.flows,
                pool: self.pool,
                executor: self.executor,
                reporter: self.reporter,
                state: Mutex::new(state),
                wake: Notify::new(),
                changed: Notify::new(),
                slots: Arc::new(Semaphore::new(slots)),
                events,
                pump_rx: Mutex::new(Some(rx)),
                workers: tokio::sync::Mutex::new(None),
            }),
        }
    }
}

/// Handle to the task scheduler. Cloning is cheap and every clone drives the
/// same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder(
        flows: Arc<FlowCatalog>,
        pool: Arc<LeasePool>,
        executor: Arc<dyn ActionExecutor>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            policy: RetryPolicy::default(),
            flows,
            pool,
            executor,
            reporter: NoopProgressReporter::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn flows(&self) -> &Arc<FlowCatalog> {
        &self.inner.flows
    }

    pub fn pool(&self) -> &Arc<LeasePool> {
        &self.inner.pool
    }

    /// Validates the flow and environment references and queues the task as
    /// pending.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        let flow = self
            .inner
            .flows
            .get(&spec.flow)
            .ok_or_else(|| SchedulerError::InvalidReference(format!("unknown flow {}", spec.flow)))?;
        if !flow.flow().active {
            return Err(SchedulerError::InvalidReference(format!("flow {} is inactive", spec.flow)));
        }
        self.inner
            .pool
            .check_available(&spec.environment)
            .map_err(|err| SchedulerError::InvalidReference(err.to_string()))?;

        let now = Utc::now();
        let id = spec.id.unwrap_or_default();
        let ready_at = spec.scheduled_at.and_then(instant_for);
        let task = Task {
            id: id.clone(),
            name: spec.name,
            flow: spec.flow,
            flow_version: flow.version(),
            environment: spec.environment,
            status: TaskStatus::Pending,
            priority: spec.priority,
            progress: 0,
            execution: ExecutionState::start(&flow, &spec.variables),
            inputs: spec.variables,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(self.inner.config.default_max_retries),
            scheduled_at: spec.scheduled_at,
            ready_at: spec.scheduled_at.filter(|at| *at > now),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            attempts: Vec::new(),
            result: None,
            logs: Default::default(),
        };
        self.inner.state.lock().insert(task, 0, ready_at, "submitted")?;
        metrics::record_submitted();
        self.inner.notify_change();
        Ok(id)
    }

    /// Idempotent; returns the status after the call. A running task keeps
    /// `Running` until it reaches its next node boundary.
    pub fn cancel(&self, id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        let status = self.inner.state.lock().cancel(id)?;
        self.inner.notify_change();
        Ok(status)
    }

    /// Takes effect at the next node boundary; the lease and worker slot are
    /// released and the execution state is kept for `resume`.
    pub fn pause(&self, id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        self.inner.state.lock().pause(id)
    }

    pub fn resume(&self, id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        let status = self.inner.state.lock().resume(id)?;
        self.inner.notify_change();
        Ok(status)
    }

    /// Re-queues a failed task that still has retry budget.
    pub fn retry(&self, id: &TaskId) -> Result<(), SchedulerError> {
        self.inner.state.lock().retry(id, &self.inner.flows)?;
        self.inner.notify_change();
        Ok(())
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.inner.state.lock().task(id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.state.lock().tasks()
    }

    /// Explicit deletion; only terminal tasks can be removed.
    pub fn remove(&self, id: &TaskId) -> Result<Task, SchedulerError> {
        self.inner.state.lock().remove(id)
    }

    /// Records of every non-terminal task, with the execution state saved at
    /// its last node boundary.
    pub fn export_recoverable(&self) -> Vec<TaskRecord> {
        self.inner.state.lock().export_recoverable()
    }

    /// Re-submits saved tasks as pending. A task resumes from its saved node
    /// pointer and variables; records whose references no longer resolve are
    /// rejected.
    pub fn recover(&self, records: Vec<TaskRecord>) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        for record in records {
            let id = record.id.clone();
            match self.recover_one(record) {
                Ok(()) => report.recovered.push(id),
                Err(err) => {
                    warn!(target: "scheduler", task_id = %id, error = %err, "task not recovered");
                    report.rejected.push((id, err));
                }
            }
        }
        if !report.recovered.is_empty() {
            info!(target: "scheduler", recovered = report.recovered.len(), "tasks recovered");
            self.inner.notify_change();
        }
        report
    }

    fn recover_one(&self, record: TaskRecord) -> Result<(), SchedulerError> {
        if record.status.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                task: record.id,
                status: record.status,
                action: "recover",
            });
        }
        let flow = self
            .inner
            .flows
            .get(&record.flow)
            .ok_or_else(|| SchedulerError::InvalidReference(format!("unknown flow {}", record.flow)))?;
        if let Some(pointer) = &record.execution.pointer {
            if flow.node(pointer).is_none() {
                return Err(SchedulerError::InvalidReference(format!(
                    "node {pointer} not in flow {} version {}",
                    record.flow,
                    flow.version()
                )));
            }
        }
        self.inner
            .pool
            .check_available(&record.environment)
            .map_err(|err| SchedulerError::InvalidReference(err.to_string()))?;

        let now = Utc::now();
        let ready_at = record.scheduled_at.and_then(instant_for);
        let task = Task {
            id: record.id,
            name: record.name,
            flow: record.flow,
            flow_version: flow.version(),
            environment: record.environment,
            status: TaskStatus::Pending,
            priority: record.priority,
            progress: record.progress,
            inputs: record.inputs,
            execution: record.execution,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            scheduled_at: record.scheduled_at,
            ready_at: record.scheduled_at.filter(|at| *at > now),
            created_at: record.created_at,
            updated_at: now,
            started_at: record.started_at,
            completed_at: None,
            last_error: record.last_error,
            attempts: record.attempts,
            result: None,
            logs: Default::default(),
        };
        self.inner
            .state
            .lock()
            .insert(task, record.last_event_seq, ready_at, "recovered")?;
        metrics::record_submitted();
        Ok(())
    }

    /// Spawns the dispatcher and the progress pump. Calling it again is a
    /// no-op.
    pub async fn start(&self) {
        let mut workers = self.inner.workers.lock().await;
        if workers.is_some() {
            return;
        }
        let Some(rx) = self.inner.pump_rx.lock().take() else {
            return;
        };
        let pump = tokio::spawn(pump_events(Arc::clone(&self.inner.reporter), rx));
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&self.inner)));
        *workers = Some(Workers { dispatcher, pump });
        info!(
            target: "scheduler",
            max_concurrent = self.inner.config.max_concurrent,
            "scheduler started"
        );
    }

    /// Stops dispatching, asks running attempts to pause at their next node
    /// boundary and waits up to `grace` for them. Returns how many were still
    /// running when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.inner.state.lock().begin_shutdown();
        self.inner.notify_change();

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().running() == 0 {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => break,
            }
        }

        self.inner.slots.close();
        self.flush().await;
        if let Some(workers) = self.inner.workers.lock().await.take() {
            workers.dispatcher.abort();
            workers.pump.abort();
        }
        let still_running = self.inner.state.lock().running();
        let destroyed = self.inner.pool.shutdown().await;
        info!(target: "scheduler", still_running, destroyed, "scheduler stopped");
        still_running
    }

    /// Resolves once nothing is running and the ready queue is empty, and
    /// every event emitted so far has reached the reporter. Paused tasks do
    /// not count as work. Needs a started scheduler.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().is_idle() {
                break;
            }
            notified.await;
        }
        self.flush().await;
    }

    /// Waits until events queued so far were handed to the reporter.
    pub async fn flush(&self) {
        if self.inner.workers.lock().await.is_none() {
            return;
        }
        let (done, wait) = oneshot::channel();
        if self.inner.events.send(PumpMsg::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let available = self.inner.slots.available_permits();
        self.inner.state.lock().stats(available)
    }
}
