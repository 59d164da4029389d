use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use rpa_core_types::{ErrorClass, ErrorInfo, RpaError};
use rpa_flow::{ActionExecutor, FlowCatalog, FlowInterpreter, StepEnv};
use rpa_lease_pool::LeasePool;
use rpa_progress::ProgressReporter;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::model::SchedulerConfig;
use crate::retry::RetryPolicy;
use crate::runtime::{AttemptOutcome, Dispatch, Pick, PumpMsg, SchedulerState};

pub(crate) struct Workers {
    pub dispatcher: JoinHandle<()>,
    pub pump: JoinHandle<()>,
}

/// Shared scheduler internals. Workers get an `Arc` of this explicitly.
pub(crate) struct Inner {
    pub config: SchedulerConfig,
    pub policy: RetryPolicy,
    pub flows: Arc<FlowCatalog>,
    pub pool: Arc<LeasePool>,
    pub executor: Arc<dyn ActionExecutor>,
    pub reporter: Arc<dyn ProgressReporter>,
    pub state: Mutex<SchedulerState>,
    /// Wakes the dispatcher: new work, freed environment, freed slot
    pub wake: Notify,
    /// Signalled after every finished attempt and API transition
    pub changed: Notify,
    pub slots: Arc<Semaphore>,
    pub events: mpsc::UnboundedSender<PumpMsg>,
    pub pump_rx: Mutex<Option<mpsc::UnboundedReceiver<PumpMsg>>>,
    pub workers: tokio::sync::Mutex<Option<Workers>>,
}

impl Inner {
    pub fn notify_change(&self) {
        self.wake.notify_one();
        self.changed.notify_waiters();
    }
}

pub(crate) async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        let permit = match inner.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let Some(dispatch) = next_dispatch(&inner).await else {
            break;
        };
        let worker = Arc::clone(&inner);
        tokio::spawn(run_attempt(worker, dispatch, permit));
    }
    debug!(target: "scheduler", "dispatcher stopped");
}

async fn next_dispatch(inner: &Arc<Inner>) -> Option<Dispatch> {
    let idle_poll = Duration::from_millis(inner.config.idle_poll_ms.max(1));
    loop {
        let notified = inner.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let now = Instant::now();
        let pick = {
            let mut state = inner.state.lock();
            if state.is_shutting_down() {
                return None;
            }
            state.pick(now, &inner.flows)
        };
        match pick {
            Pick::Dispatch(dispatch) => return Some(dispatch),
            Pick::Idle { wake_at } => {
                let poll_at = now + idle_poll;
                let deadline = wake_at.map_or(poll_at, |at| at.min(poll_at));
                tokio::select! {
                    _ = &mut notified => {}
                    _ = sleep_until(deadline) => {}
                }
            }
        }
    }
}

async fn run_attempt(inner: Arc<Inner>, dispatch: Dispatch, permit: OwnedSemaphorePermit) {
    let outcome = execute_attempt(&inner, &dispatch).await;
    inner
        .state
        .lock()
        .finish(dispatch, outcome, &inner.policy, &inner.flows);
    drop(permit);
    inner.notify_change();
}

/// One attempt: lease, step until done or interrupted, give the lease back.
async fn execute_attempt(inner: &Inner, dispatch: &Dispatch) -> AttemptOutcome {
    let Some(flow) = inner.flows.get(&dispatch.flow) else {
        let error = RpaError::InvalidReference(format!("flow {} is no longer registered", dispatch.flow));
        return AttemptOutcome::Failed {
            state: dispatch.execution.clone(),
            error: error.to_info(),
        };
    };

    let lease_timeout = Duration::from_millis(inner.config.lease_timeout_ms);
    let lease = tokio::select! {
        biased;
        _ = dispatch.control.cancel.cancelled() => {
            return AttemptOutcome::Cancelled(dispatch.execution.clone());
        }
        acquired = inner.pool.acquire(&dispatch.environment, &dispatch.task, lease_timeout) => {
            match acquired {
                Ok(lease) => lease,
                Err(err) => {
                    warn!(
                        target: "scheduler",
                        task_id = %dispatch.task,
                        environment = %dispatch.environment,
                        error = %err,
                        "lease not acquired"
                    );
                    return AttemptOutcome::Failed {
                        state: dispatch.execution.clone(),
                        error: RpaError::from(err).to_info(),
                    };
                }
            }
        }
    };

    let env = StepEnv {
        task: dispatch.task.clone(),
        instance: lease.instance.clone(),
        cancel: dispatch.control.cancel.clone(),
        action_timeout: inner.config.action_timeout_ms.map(Duration::from_millis),
    };
    let mut interpreter = FlowInterpreter::new(flow, dispatch.execution.clone());
    let driven = AssertUnwindSafe(drive(inner, dispatch, &mut interpreter, &env))
        .catch_unwind()
        .await;

    match driven {
        Ok(outcome) => {
            if !inner.pool.release(&dispatch.environment, &dispatch.task).await {
                debug!(
                    target: "scheduler",
                    task_id = %dispatch.task,
                    environment = %dispatch.environment,
                    "lease already gone at release"
                );
            }
            outcome
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                target: "scheduler",
                task_id = %dispatch.task,
                environment = %dispatch.environment,
                panic = %message,
                "attempt panicked, tearing down instance"
            );
            inner.pool.invalidate(&dispatch.environment).await;
            let info = ErrorInfo::new(ErrorClass::Permanent, "panic", message)
                .at_node(interpreter.state().pointer.clone());
            AttemptOutcome::Failed {
                state: interpreter.into_state(),
                error: info,
            }
        }
    }
}

/// Steps the interpreter, checking cancel and pause at every node boundary.
async fn drive(
    inner: &Inner,
    dispatch: &Dispatch,
    interpreter: &mut FlowInterpreter,
    env: &StepEnv,
) -> AttemptOutcome {
    loop {
        if interpreter.is_finished() {
            return AttemptOutcome::Completed(interpreter.state().clone());
        }
        if dispatch.control.cancel.is_cancelled() {
            return AttemptOutcome::Cancelled(interpreter.state().clone());
        }
        if dispatch.control.pause_requested() {
            return AttemptOutcome::Paused(interpreter.state().clone());
        }

        let result = interpreter.step(inner.executor.as_ref(), env).await;
        let logs = interpreter.drain_logs();
        inner
            .state
            .lock()
            .record_step(&dispatch.task, interpreter.state(), interpreter.progress(), logs);

        if let Err(err) = result {
            if dispatch.control.cancel.is_cancelled() {
                return AttemptOutcome::Cancelled(interpreter.state().clone());
            }
            return AttemptOutcome::Failed {
                state: interpreter.state().clone(),
                error: err.to_info(),
            };
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Forwards progress events to the reporter in the order they were queued.
pub(crate) async fn pump_events(
    reporter: Arc<dyn ProgressReporter>,
    mut rx: mpsc::UnboundedReceiver<PumpMsg>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            PumpMsg::Event(event) => {
                let task_id = event.task_id.clone();
                let seq = event.seq;
                if let Err(err) = reporter.report(event).await {
                    warn!(target: "scheduler", task_id = %task_id, seq, error = %err, "progress reporter failed");
                }
            }
            PumpMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
