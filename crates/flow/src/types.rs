//! Core types for flow graphs

use rpa_core_types::{FlowId, NodeId, Variables};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;
use crate::vars::{render_value, substitute};

/// Flow definition: a directed graph of nodes, immutable per version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Flow identifier
    pub id: FlowId,

    /// Flow name
    #[serde(default)]
    pub name: String,

    /// Bumped on every saved change
    #[serde(default = "default_version")]
    pub version: u32,

    /// Inactive flows are refused at submission
    #[serde(default = "default_active")]
    pub active: bool,

    /// Node executed first
    pub start: NodeId,

    /// Nodes addressed by id
    pub nodes: Vec<Node>,

    /// Default variables, overridden per task
    #[serde(default)]
    pub defaults: Variables,

    /// Execution settings
    #[serde(default)]
    pub settings: FlowSettings,
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

impl Flow {
    /// Create a new flow
    pub fn new(id: impl Into<FlowId>, start: impl Into<NodeId>, nodes: Vec<Node>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            version: default_version(),
            active: true,
            start: start.into(),
            nodes,
            defaults: Variables::new(),
            settings: FlowSettings::default(),
        }
    }

    /// Add a default variable
    pub fn with_default(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(name.into(), value.into());
        self
    }

    /// Replace settings
    pub fn with_settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// Execution settings of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSettings {
    /// Upper bound on tasks of this flow running at once
    #[serde(default)]
    pub max_concurrent_instances: Option<usize>,

    /// Body entries allowed per loop activation
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Per-action timeout; absent means the executor call is awaited unbounded
    #[serde(default)]
    pub action_timeout_ms: Option<u64>,
}

fn default_max_loop_iterations() -> u32 {
    100
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_concurrent_instances: None,
            max_loop_iterations: default_max_loop_iterations(),
            action_timeout_ms: None,
        }
    }
}

/// One step of a flow with its outgoing edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable node identifier
    pub id: NodeId,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Typed configuration
    #[serde(flatten)]
    pub kind: NodeKind,

    /// Followed when the node succeeds
    #[serde(default)]
    pub on_success: Vec<NodeId>,

    /// Followed when the node fails
    #[serde(default)]
    pub on_error: Vec<NodeId>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            kind,
            on_success: Vec::new(),
            on_error: Vec::new(),
        }
    }

    pub fn then(mut self, target: impl Into<NodeId>) -> Self {
        self.on_success.push(target.into());
        self
    }

    pub fn or_else(mut self, target: impl Into<NodeId>) -> Self {
        self.on_error.push(target.into());
        self
    }
}

/// Closed set of node types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Leaf dispatched to the action executor
    Action { action: ActionSpec },

    /// If/else: true follows `on_success`, false follows `on_false`
    Branch {
        condition: Condition,
        #[serde(default)]
        on_false: Vec<NodeId>,
    },

    /// Loop header; exits along `on_success`
    Loop { mode: LoopMode, body: NodeId },

    /// Leave the innermost loop
    Break,

    /// Jump back to the innermost loop header
    Continue,

    /// Assign or update a variable
    SetVariable { name: String, op: VariableOp },

    /// Derive a variable from existing data
    Extract { into: String, from: ExtractSource },

    /// Forces an error outcome with a user-supplied message
    Fail { message: String },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Action { action } => action.name(),
            NodeKind::Branch { .. } => "branch",
            NodeKind::Loop { .. } => "loop",
            NodeKind::Break => "break",
            NodeKind::Continue => "continue",
            NodeKind::SetVariable { .. } => "set_variable",
            NodeKind::Extract { .. } => "extract",
            NodeKind::Fail { .. } => "fail",
        }
    }
}

/// Loop flavours
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Re-enter the body while the condition holds
    While(Condition),

    /// Run the body a fixed number of times, exposing the 0-based index
    Count {
        times: u32,
        #[serde(default)]
        counter: Option<String>,
    },

    /// Run the body once per element of an array variable
    ForEach {
        source: String,
        item: String,
        #[serde(default)]
        index: Option<String>,
    },
}

/// Variable mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableOp {
    Set { value: Value },
    Increment {
        #[serde(default = "default_increment")]
        by: f64,
    },
    Append { value: Value },
}

fn default_increment() -> f64 {
    1.0
}

/// Data-extraction sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractSource {
    /// Field of an object variable, e.g. source `row`, field `email`
    Field { source: String, field: String },

    /// First regex match over a template
    Pattern {
        text: String,
        pattern: String,
        #[serde(default)]
        group: Option<usize>,
    },

    /// Parse JSON text
    Json { source: String },
}

/// Action types understood by the action executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionSpec {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Input {
        selector: String,
        text: String,
    },
    Select {
        selector: String,
        value: String,
    },
    Scroll {
        #[serde(default)]
        distance: Option<i64>,
        #[serde(default)]
        selector: Option<String>,
    },
    /// Fixed `ms` or a random duration in `min_ms..=max_ms`
    Wait {
        #[serde(default)]
        ms: Option<u64>,
        #[serde(default)]
        min_ms: Option<u64>,
        #[serde(default)]
        max_ms: Option<u64>,
    },
    Screenshot {
        path: String,
    },
    EvalScript {
        code: String,
        #[serde(default)]
        into: Option<String>,
    },
    ExternalCall {
        service: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        into: Option<String>,
    },
    Custom {
        name: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        into: Option<String>,
    },
}

impl ActionSpec {
    pub fn name(&self) -> &'static str {
        match self {
            ActionSpec::Navigate { .. } => "navigate",
            ActionSpec::Click { .. } => "click",
            ActionSpec::Input { .. } => "input",
            ActionSpec::Select { .. } => "select",
            ActionSpec::Scroll { .. } => "scroll",
            ActionSpec::Wait { .. } => "wait",
            ActionSpec::Screenshot { .. } => "screenshot",
            ActionSpec::EvalScript { .. } => "eval_script",
            ActionSpec::ExternalCall { .. } => "external_call",
            ActionSpec::Custom { .. } => "custom",
        }
    }

    /// Variable receiving the action's output, if any.
    pub fn output_var(&self) -> Option<&str> {
        match self {
            ActionSpec::EvalScript { into, .. }
            | ActionSpec::ExternalCall { into, .. }
            | ActionSpec::Custom { into, .. } => into.as_deref(),
            _ => None,
        }
    }

    /// Copy with every string field `${}`-substituted.
    pub fn resolve(&self, variables: &Variables) -> ActionSpec {
        let s = |text: &String| substitute(text, variables);
        match self {
            ActionSpec::Navigate { url } => ActionSpec::Navigate { url: s(url) },
            ActionSpec::Click { selector } => ActionSpec::Click { selector: s(selector) },
            ActionSpec::Input { selector, text } => ActionSpec::Input {
                selector: s(selector),
                text: s(text),
            },
            ActionSpec::Select { selector, value } => ActionSpec::Select {
                selector: s(selector),
                value: s(value),
            },
            ActionSpec::Scroll { distance, selector } => ActionSpec::Scroll {
                distance: *distance,
                selector: selector.as_ref().map(s),
            },
            ActionSpec::Wait { .. } => self.clone(),
            ActionSpec::Screenshot { path } => ActionSpec::Screenshot { path: s(path) },
            ActionSpec::EvalScript { code, into } => ActionSpec::EvalScript {
                code: s(code),
                into: into.clone(),
            },
            ActionSpec::ExternalCall {
                service,
                params,
                into,
            } => ActionSpec::ExternalCall {
                service: s(service),
                params: render_value(params, variables),
                into: into.clone(),
            },
            ActionSpec::Custom { name, params, into } => ActionSpec::Custom {
                name: name.clone(),
                params: render_value(params, variables),
                into: into.clone(),
            },
        }
    }
}
