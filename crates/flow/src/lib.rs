//! Flow graphs and their step-at-a-time interpreter
//!
//! A flow is a directed graph of typed nodes with explicit success and error
//! edges. Loops are driven by an explicit loop-control stack carried in the
//! execution state instead of recursion, so a running execution can be paused,
//! serialised and resumed at any node boundary.

pub mod catalog;
pub mod condition;
pub mod errors;
pub mod executor;
pub mod interpreter;
pub mod types;
pub mod validate;
pub mod vars;

pub use catalog::{FlowCatalog, FlowStats};
pub use condition::{CompareOp, Condition, Operand};
pub use errors::FlowError;
pub use executor::{ActionContext, ActionExecutor, ActionFailure, ActionReport};
pub use interpreter::{
    wait_duration, Edge, ExecutionState, FlowInterpreter, LogLevel, LoopFrame, Step, StepEnv, StepLog,
    LAST_ERROR_VAR,
};
pub use types::{ActionSpec, ExtractSource, Flow, FlowSettings, LoopMode, Node, NodeKind, VariableOp};
pub use validate::{validate, ValidatedFlow};
