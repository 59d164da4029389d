//! Step-at-a-time flow interpreter.
//!
//! Execution state is plain data (pointer, variables, loop-control stack) so a
//! task can be paused, persisted and resumed from exactly where it stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng as _;
use regex::Regex;
use rpa_core_types::{ErrorClass, InstanceHandle, NodeId, TaskId, Variables};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::FlowError;
use crate::executor::{ActionContext, ActionExecutor, ActionFailure};
use crate::types::{ActionSpec, ExtractSource, LoopMode, Node, NodeKind, VariableOp};
use crate::validate::ValidatedFlow;
use crate::vars::{as_number, lookup, number_value, render_value, substitute, value_to_string};

/// Variable holding the message of the last error routed along an error edge.
pub const LAST_ERROR_VAR: &str = "_last_error";

/// Kind of transition taken by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Success,
    Error,
    /// Branch condition evaluated false
    False,
    /// Loop header entering its body
    Body,
    /// Loop header leaving along its success edge
    Exit,
    Break,
    Continue,
}

/// Active loop on the loop-control stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFrame {
    pub header: NodeId,
    /// Body entries so far in this activation
    pub iteration: u32,
    /// Snapshot of the iterated array for `for_each` loops
    #[serde(default)]
    pub items: Option<Vec<Value>>,
}

/// Serialisable execution state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Next node to execute; `None` once the flow finished
    pub pointer: Option<NodeId>,
    pub variables: Variables,
    #[serde(default)]
    pub loop_stack: Vec<LoopFrame>,
    #[serde(default)]
    pub steps: u64,
    #[serde(default)]
    pub max_ordinal: usize,
}

impl ExecutionState {
    /// Fresh state at the flow's start node, variables seeded from the flow
    /// defaults and then the per-task overrides.
    pub fn start(flow: &ValidatedFlow, overrides: &Variables) -> Self {
        let mut variables = flow.defaults().clone();
        variables.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            pointer: Some(flow.start().clone()),
            variables,
            loop_stack: Vec::new(),
            steps: 0,
            max_ordinal: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.pointer.is_none()
    }
}

/// Outcome of executing one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Advanced { from: NodeId, to: NodeId, edge: Edge },
    Finished { at: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Log line produced while stepping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub node: Option<NodeId>,
    pub at: DateTime<Utc>,
}

/// Per-task inputs for stepping that are not part of the serialisable state.
#[derive(Debug, Clone)]
pub struct StepEnv {
    pub task: TaskId,
    pub instance: InstanceHandle,
    pub cancel: CancellationToken,
    /// Used when the flow sets no action timeout of its own.
    pub action_timeout: Option<Duration>,
}

pub struct FlowInterpreter {
    flow: Arc<ValidatedFlow>,
    state: ExecutionState,
    logs: Vec<StepLog>,
}

impl FlowInterpreter {
    pub fn new(flow: Arc<ValidatedFlow>, state: ExecutionState) -> Self {
        Self {
            flow,
            state,
            logs: Vec::new(),
        }
    }

    pub fn flow(&self) -> &Arc<ValidatedFlow> {
        &self.flow
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn into_state(self) -> ExecutionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Approximate completion percentage. Never decreases, and stays below
    /// 100 until the flow finished.
    pub fn progress(&self) -> u8 {
        if self.state.is_finished() {
            return 100;
        }
        let total = self.flow.total_nodes().max(1);
        let pct = self.state.max_ordinal.saturating_mul(100) / total;
        pct.min(99) as u8
    }

    pub fn drain_logs(&mut self) -> Vec<StepLog> {
        std::mem::take(&mut self.logs)
    }

    /// Executes exactly one node and moves the pointer along the chosen edge.
    /// Stepping a finished execution is an error.
    pub async fn step(&mut self, executor: &dyn ActionExecutor, env: &StepEnv) -> Result<Step, FlowError> {
        let flow = Arc::clone(&self.flow);
        let Some(node_id) = self.state.pointer.clone() else {
            return Err(FlowError::UnknownNode(NodeId::from("<finished>")));
        };
        let node = flow
            .node(&node_id)
            .ok_or_else(|| FlowError::UnknownNode(node_id.clone()))?;
        self.state.steps += 1;
        debug!(target: "flow", task_id = %env.task, node = %node.id, kind = node.kind.type_name(), "step");

        let step = match &node.kind {
            NodeKind::Action { action } => self.run_action(node, action, executor, env).await,
            NodeKind::Branch { condition, on_false } => match condition.evaluate(&self.state.variables) {
                Ok(true) => self.follow(node, node.on_success.first(), Edge::Success),
                Ok(false) => self.follow(node, on_false.first(), Edge::False),
                Err(err) => self.fail_or_route(node, ErrorClass::Permanent, format!("condition: {err}")),
            },
            NodeKind::Loop { mode, body } => self.enter_loop(&flow, node, mode, body),
            NodeKind::Break => {
                let frame = self
                    .state
                    .loop_stack
                    .pop()
                    .ok_or_else(|| FlowError::NoActiveLoop(node.id.clone()))?;
                self.follow(node, flow.loop_exit(&frame.header), Edge::Break)
            }
            NodeKind::Continue => {
                let header = self
                    .state
                    .loop_stack
                    .last()
                    .map(|frame| frame.header.clone())
                    .ok_or_else(|| FlowError::NoActiveLoop(node.id.clone()))?;
                self.follow(node, Some(&header), Edge::Continue)
            }
            NodeKind::SetVariable { name, op } => match self.apply_variable(name, op) {
                Ok(()) => self.follow(node, node.on_success.first(), Edge::Success),
                Err(message) => self.fail_or_route(node, ErrorClass::Permanent, message),
            },
            NodeKind::Extract { into, from } => match self.extract(from) {
                Ok(value) => {
                    self.state.variables.insert(into.clone(), value);
                    self.follow(node, node.on_success.first(), Edge::Success)
                }
                Err(message) => self.fail_or_route(node, ErrorClass::Permanent, message),
            },
            NodeKind::Fail { message } => {
                let message = substitute(message, &self.state.variables);
                self.fail_or_route(node, ErrorClass::Permanent, message)
            }
        }?;

        if let Some(ordinal) = flow.ordinal(&node.id) {
            self.state.max_ordinal = self.state.max_ordinal.max(ordinal);
        }
        Ok(step)
    }

    async fn run_action(
        &mut self,
        node: &Node,
        action: &ActionSpec,
        executor: &dyn ActionExecutor,
        env: &StepEnv,
    ) -> Result<Step, FlowError> {
        let resolved = action.resolve(&self.state.variables);
        let ctx = ActionContext {
            task: env.task.clone(),
            node: node.id.clone(),
            instance: env.instance.clone(),
            cancel: env.cancel.clone(),
        };
        let timeout = self
            .flow
            .settings()
            .action_timeout_ms
            .map(Duration::from_millis)
            .or(env.action_timeout);

        let call = executor.execute(&resolved, &self.state.variables, &ctx);
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ActionFailure::transient(format!(
                    "{} timed out after {}ms",
                    resolved.name(),
                    limit.as_millis()
                ))),
            },
            None => call.await,
        };

        match outcome {
            Ok(report) => {
                if let Some(message) = &report.message {
                    self.log(LogLevel::Info, Some(&node.id), message.clone());
                }
                self.state.variables.extend(report.variables);
                if let (Some(var), Some(output)) = (resolved.output_var(), report.output) {
                    self.state.variables.insert(var.to_string(), output);
                }
                self.follow(node, node.on_success.first(), Edge::Success)
            }
            Err(failure) => self.fail_or_route(node, failure.class, failure.message),
        }
    }

    fn enter_loop(
        &mut self,
        flow: &ValidatedFlow,
        node: &Node,
        mode: &LoopMode,
        body: &NodeId,
    ) -> Result<Step, FlowError> {
        // Arriving at a header already on the stack discards any inner frames.
        match self.state.loop_stack.iter().rposition(|frame| frame.header == node.id) {
            Some(pos) => self.state.loop_stack.truncate(pos + 1),
            None => {
                let items = match mode {
                    LoopMode::ForEach { source, .. } => match lookup(&self.state.variables, source) {
                        Some(Value::Array(items)) => Some(items.clone()),
                        Some(Value::Null) | None => Some(Vec::new()),
                        Some(other) => {
                            let message = format!("for_each source {source} is not an array: {other}");
                            return self.fail_or_route(node, ErrorClass::Permanent, message);
                        }
                    },
                    _ => None,
                };
                self.state.loop_stack.push(LoopFrame {
                    header: node.id.clone(),
                    iteration: 0,
                    items,
                });
            }
        }

        let Some(frame) = self.state.loop_stack.last().cloned() else {
            return Err(FlowError::NoActiveLoop(node.id.clone()));
        };
        let again = match mode {
            LoopMode::While(condition) => match condition.evaluate(&self.state.variables) {
                Ok(value) => value,
                Err(err) => {
                    self.state.loop_stack.pop();
                    return self.fail_or_route(node, ErrorClass::Permanent, format!("condition: {err}"));
                }
            },
            LoopMode::Count { times, counter } => {
                let again = frame.iteration < *times;
                if let (true, Some(counter)) = (again, counter) {
                    self.state
                        .variables
                        .insert(counter.clone(), Value::from(frame.iteration));
                }
                again
            }
            LoopMode::ForEach { item, index, .. } => {
                let current = frame
                    .items
                    .as_ref()
                    .and_then(|items| items.get(frame.iteration as usize))
                    .cloned();
                match current {
                    Some(value) => {
                        self.state.variables.insert(item.clone(), value);
                        if let Some(index) = index {
                            self.state
                                .variables
                                .insert(index.clone(), Value::from(frame.iteration));
                        }
                        true
                    }
                    None => false,
                }
            }
        };

        if !again {
            self.state.loop_stack.pop();
            return self.follow(node, flow.loop_exit(&node.id), Edge::Exit);
        }

        let limit = flow.settings().max_loop_iterations;
        if frame.iteration >= limit {
            warn!(target: "flow", node = %node.id, limit, "loop iteration limit reached");
            return Err(FlowError::LoopLimitExceeded {
                node: node.id.clone(),
                limit,
            });
        }
        if let Some(top) = self.state.loop_stack.last_mut() {
            top.iteration += 1;
        }
        self.follow(node, Some(body), Edge::Body)
    }

    fn apply_variable(&mut self, name: &str, op: &VariableOp) -> Result<(), String> {
        let vars = &mut self.state.variables;
        match op {
            VariableOp::Set { value } => {
                let value = render_value(value, vars);
                vars.insert(name.to_string(), value);
            }
            VariableOp::Increment { by } => {
                let current = match vars.get(name) {
                    None | Some(Value::Null) => 0.0,
                    Some(value) => as_number(value)
                        .ok_or_else(|| format!("variable {name} is not numeric: {value}"))?,
                };
                vars.insert(name.to_string(), number_value(current + by));
            }
            VariableOp::Append { value } => {
                let value = render_value(value, vars);
                match vars.get_mut(name) {
                    None | Some(Value::Null) => {
                        vars.insert(name.to_string(), Value::Array(vec![value]));
                    }
                    Some(Value::Array(items)) => items.push(value),
                    Some(Value::String(text)) => text.push_str(&value_to_string(&value)),
                    Some(other) => return Err(format!("cannot append to {name}: {other}")),
                }
            }
        }
        Ok(())
    }

    fn extract(&self, from: &ExtractSource) -> Result<Value, String> {
        let vars = &self.state.variables;
        match from {
            ExtractSource::Field { source, field } => {
                Ok(lookup(vars, &format!("{source}.{field}")).cloned().unwrap_or(Value::Null))
            }
            ExtractSource::Pattern { text, pattern, group } => {
                let text = substitute(text, vars);
                let regex = Regex::new(pattern).map_err(|err| format!("invalid pattern: {err}"))?;
                let Some(caps) = regex.captures(&text) else {
                    return Ok(Value::Null);
                };
                let group = group.unwrap_or(if caps.len() > 1 { 1 } else { 0 });
                Ok(caps
                    .get(group)
                    .map(|m| Value::String(m.as_str().to_string()))
                    .unwrap_or(Value::Null))
            }
            ExtractSource::Json { source } => {
                let raw = match lookup(vars, source) {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => return Ok(other.clone()),
                    None => substitute(source, vars),
                };
                serde_json::from_str(&raw).map_err(|err| format!("invalid JSON: {err}"))
            }
        }
    }

    fn follow(&mut self, node: &Node, target: Option<&NodeId>, edge: Edge) -> Result<Step, FlowError> {
        match target {
            Some(next) => {
                self.state.pointer = Some(next.clone());
                Ok(Step::Advanced {
                    from: node.id.clone(),
                    to: next.clone(),
                    edge,
                })
            }
            None => {
                self.state.pointer = None;
                self.state.loop_stack.clear();
                Ok(Step::Finished { at: node.id.clone() })
            }
        }
    }

    /// Routes a node failure along its error edge, or fails the execution.
    fn fail_or_route(&mut self, node: &Node, class: ErrorClass, message: String) -> Result<Step, FlowError> {
        match node.on_error.first() {
            Some(target) => {
                self.log(
                    LogLevel::Warn,
                    Some(&node.id),
                    format!("{message}; continuing at {target}"),
                );
                self.state
                    .variables
                    .insert(LAST_ERROR_VAR.to_string(), Value::String(message));
                self.follow(node, Some(target), Edge::Error)
            }
            None => {
                self.log(LogLevel::Error, Some(&node.id), message.clone());
                Err(FlowError::ActionFailed {
                    node: node.id.clone(),
                    class,
                    message,
                })
            }
        }
    }

    fn log(&mut self, level: LogLevel, node: Option<&NodeId>, message: String) {
        self.logs.push(StepLog {
            level,
            message,
            node: node.cloned(),
            at: Utc::now(),
        });
    }
}

/// Random pause length for a `wait` action with a `min_ms..=max_ms` range.
pub fn wait_duration(action: &ActionSpec) -> Option<Duration> {
    match action {
        ActionSpec::Wait { ms: Some(ms), .. } => Some(Duration::from_millis(*ms)),
        ActionSpec::Wait {
            min_ms: Some(min),
            max_ms: Some(max),
            ..
        } => {
            let (low, high) = if min <= max { (*min, *max) } else { (*max, *min) };
            Some(Duration::from_millis(rand::thread_rng().gen_range(low..=high)))
        }
        _ => None,
    }
}
