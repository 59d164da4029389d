//! Shared primitives for the environment task runner crates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Variable environment of a running task. Ordered so snapshots are stable.
pub type Variables = BTreeMap<String, serde_json::Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a scheduled task.
    TaskId
);
string_id!(
    /// Identifier of a flow definition.
    FlowId
);
string_id!(
    /// Identifier of a node inside a flow. Stable across versions of the same flow.
    NodeId
);
string_id!(
    /// Identifier of an automation environment (browser profile).
    EnvironmentId
);
string_id!(LeaseId);
string_id!(InstanceId);

/// Live browser instance handed out by the browser-control collaborator.
///
/// The core never looks inside `endpoint` or `meta`; they are carried to the
/// action executor untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub environment: EnvironmentId,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl InstanceHandle {
    pub fn new(environment: EnvironmentId) -> Self {
        Self {
            id: InstanceId::new(),
            environment,
            endpoint: None,
            meta: serde_json::Value::Null,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Lifecycle status of a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Allowed transitions. Monotone except for the retry path
    /// (`Failed -> Pending`, gated by the caller on the retry budget) and
    /// `Running <-> Paused`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running | Cancelled | Failed) => true,
            (Running, Paused | Completed | Failed | Cancelled | Pending) => true,
            (Paused, Running | Cancelled | Failed) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry classification of a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network, proxy, timeout: worth another attempt.
    Transient,
    /// Invalid configuration, user-thrown error, validation failure.
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => f.write_str("transient"),
            ErrorClass::Permanent => f.write_str("permanent"),
        }
    }
}

/// Last-error record carried on a task and in progress events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub class: ErrorClass,
    /// Short machine-readable kind, e.g. `lease_timeout`, `action_failed`.
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub node: Option<NodeId>,
    pub at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(class: ErrorClass, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            kind: kind.into(),
            message: message.into(),
            node: None,
            at: Utc::now(),
        }
    }

    pub fn at_node(mut self, node: Option<NodeId>) -> Self {
        self.node = node;
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.class, self.message)?;
        if let Some(node) = &self.node {
            write!(f, " at node {node}")?;
        }
        Ok(())
    }
}

/// Error taxonomy shared by the runner crates.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RpaError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("lease for environment {0} not acquired in time")]
    LeaseTimeout(EnvironmentId),
    #[error("instance creation failed for environment {environment}: {reason}")]
    InstanceCreationFailed {
        environment: EnvironmentId,
        reason: String,
    },
    #[error("action failed ({class}): {message}")]
    ActionFailed { class: ErrorClass, message: String },
    #[error("break outside of any active loop")]
    NoActiveLoop,
    #[error("flow validation failed: {0}")]
    FlowValidation(String),
    #[error("{0}")]
    Message(String),
}

impl RpaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RpaError::LeaseTimeout(_) | RpaError::InstanceCreationFailed { .. } => {
                ErrorClass::Transient
            }
            RpaError::ActionFailed { class, .. } => *class,
            RpaError::InvalidReference(_)
            | RpaError::NoActiveLoop
            | RpaError::FlowValidation(_)
            | RpaError::Message(_) => ErrorClass::Permanent,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RpaError::InvalidReference(_) => "invalid_reference",
            RpaError::LeaseTimeout(_) => "lease_timeout",
            RpaError::InstanceCreationFailed { .. } => "instance_creation_failed",
            RpaError::ActionFailed { .. } => "action_failed",
            RpaError::NoActiveLoop => "no_active_loop",
            RpaError::FlowValidation(_) => "flow_validation",
            RpaError::Message(_) => "internal",
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.class(), self.kind(), self.to_string())
    }
}
