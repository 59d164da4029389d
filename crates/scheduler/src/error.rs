use rpa_core_types::{ErrorClass, RpaError, TaskId, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("task {0} already exists")]
    DuplicateTask(TaskId),
    #[error("cannot {action} task {task} while {status}")]
    InvalidTransition {
        task: TaskId,
        status: TaskStatus,
        action: &'static str,
    },
    #[error("task {task} exhausted its {max_retries} retries")]
    RetryExhausted { task: TaskId, max_retries: u32 },
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// Only a refusal during shutdown is worth resubmitting later.
    pub fn class(&self) -> ErrorClass {
        match self {
            SchedulerError::ShuttingDown => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

impl From<SchedulerError> for RpaError {
    fn from(value: SchedulerError) -> Self {
        match value {
            SchedulerError::InvalidReference(reason) => RpaError::InvalidReference(reason),
            other => RpaError::new(other.to_string()),
        }
    }
}
