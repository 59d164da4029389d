//! Action executor interface

use std::sync::Arc;

use async_trait::async_trait;
use rpa_core_types::{ErrorClass, InstanceHandle, NodeId, TaskId, Variables};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::ActionSpec;

/// What the executor gets to know about the step it runs.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub task: TaskId,
    pub node: NodeId,
    pub instance: InstanceHandle,
    /// Cancelled when the task is cancelled; honouring it is optional.
    pub cancel: CancellationToken,
}

/// Successful action outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionReport {
    /// Variables to merge into the task's environment
    pub variables: Variables,
    /// Stored under the action's `into` variable when set
    pub output: Option<Value>,
    pub message: Option<String>,
}

impl ActionReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Classified action failure
#[derive(Debug, Clone, PartialEq)]
pub struct ActionFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl ActionFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }
}

/// Performs the actual browser or automation work of a leaf node.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &ActionSpec,
        variables: &Variables,
        ctx: &ActionContext,
    ) -> Result<ActionReport, ActionFailure>;
}

#[async_trait]
impl<E> ActionExecutor for Arc<E>
where
    E: ActionExecutor + ?Sized,
{
    async fn execute(
        &self,
        action: &ActionSpec,
        variables: &Variables,
        ctx: &ActionContext,
    ) -> Result<ActionReport, ActionFailure> {
        (**self).execute(action, variables, ctx).await
    }
}
