//! Flow validation and execution error types

use rpa_core_types::{ErrorClass, ErrorInfo, NodeId, RpaError};
use thiserror::Error;

/// Flow errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    /// Flow structure rejected once per version
    #[error("Flow validation failed: {0}")]
    Validation(String),

    /// Node outcome was an error and the node has no error edge
    #[error("Node {node} failed ({class}): {message}")]
    ActionFailed {
        node: NodeId,
        class: ErrorClass,
        message: String,
    },

    /// Break or continue reached with an empty loop-control stack
    #[error("Node {0} is outside of any active loop")]
    NoActiveLoop(NodeId),

    /// Loop body entered more often than the flow allows
    #[error("Loop {node} exceeded maximum iterations: {limit}")]
    LoopLimitExceeded { node: NodeId, limit: u32 },

    /// Pointer references a node missing from the flow
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),
}

impl FlowError {
    /// Only action failures carry their own classification; structural
    /// problems are never worth retrying.
    pub fn class(&self) -> ErrorClass {
        match self {
            FlowError::ActionFailed { class, .. } => *class,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "flow_validation",
            FlowError::ActionFailed { .. } => "action_failed",
            FlowError::NoActiveLoop(_) => "no_active_loop",
            FlowError::LoopLimitExceeded { .. } => "loop_limit_exceeded",
            FlowError::UnknownNode(_) => "unknown_node",
        }
    }

    pub fn node(&self) -> Option<&NodeId> {
        match self {
            FlowError::ActionFailed { node, .. }
            | FlowError::NoActiveLoop(node)
            | FlowError::LoopLimitExceeded { node, .. }
            | FlowError::UnknownNode(node) => Some(node),
            FlowError::Validation(_) => None,
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        let message = match self {
            FlowError::ActionFailed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorInfo::new(self.class(), self.kind(), message).at_node(self.node().cloned())
    }
}

impl From<FlowError> for RpaError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::ActionFailed { class, message, .. } => RpaError::ActionFailed { class, message },
            FlowError::NoActiveLoop(_) => RpaError::NoActiveLoop,
            FlowError::Validation(message) => RpaError::FlowValidation(message),
            other => RpaError::FlowValidation(other.to_string()),
        }
    }
}
