//! Flow validation, run once per flow version.

use std::collections::{HashMap, HashSet, VecDeque};

use regex::Regex;
use rpa_core_types::{FlowId, NodeId, Variables};

use crate::errors::FlowError;
use crate::interpreter::Edge;
use crate::types::{ActionSpec, ExtractSource, Flow, FlowSettings, LoopMode, Node, NodeKind, VariableOp};

/// A flow that passed validation, with conditions compiled and node ordinals
/// precomputed for progress reporting.
#[derive(Debug, Clone)]
pub struct ValidatedFlow {
    flow: Flow,
    index: HashMap<NodeId, usize>,
    ordinals: HashMap<NodeId, usize>,
}

impl ValidatedFlow {
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn id(&self) -> &FlowId {
        &self.flow.id
    }

    pub fn version(&self) -> u32 {
        self.flow.version
    }

    pub fn start(&self) -> &NodeId {
        &self.flow.start
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.flow.settings
    }

    pub fn defaults(&self) -> &Variables {
        &self.flow.defaults
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).and_then(|pos| self.flow.nodes.get(*pos))
    }

    /// Number of nodes reachable from the start node.
    pub fn total_nodes(&self) -> usize {
        self.ordinals.len()
    }

    /// 1-based breadth-first position of a node, used for progress.
    pub fn ordinal(&self, id: &NodeId) -> Option<usize> {
        self.ordinals.get(id).copied()
    }

    /// Exit target of a loop header.
    pub fn loop_exit(&self, header: &NodeId) -> Option<&NodeId> {
        self.node(header).and_then(|node| node.on_success.first())
    }

    /// Whether moving `from -> to` along `edge` is permitted by the graph.
    pub fn allows(&self, from: &NodeId, to: &NodeId, edge: Edge) -> bool {
        let Some(node) = self.node(from) else {
            return false;
        };
        match (edge, &node.kind) {
            (Edge::Success, _) => node.on_success.contains(to),
            (Edge::Error, _) => node.on_error.contains(to),
            (Edge::False, NodeKind::Branch { on_false, .. }) => on_false.contains(to),
            (Edge::Body, NodeKind::Loop { body, .. }) => body == to,
            (Edge::Exit, NodeKind::Loop { .. }) => node.on_success.contains(to),
            (Edge::Continue, NodeKind::Continue) => {
                matches!(self.node(to).map(|n| &n.kind), Some(NodeKind::Loop { .. }))
            }
            (Edge::Break, NodeKind::Break) => self.flow.nodes.iter().any(|candidate| {
                matches!(candidate.kind, NodeKind::Loop { .. }) && candidate.on_success.first() == Some(to)
            }),
            _ => false,
        }
    }
}

/// Structural successors in the order used for ordinals.
fn successors(node: &Node) -> impl Iterator<Item = &NodeId> {
    let body = match &node.kind {
        NodeKind::Loop { body, .. } => Some(body),
        _ => None,
    };
    let on_false: &[NodeId] = match &node.kind {
        NodeKind::Branch { on_false, .. } => on_false,
        _ => &[],
    };
    body.into_iter()
        .chain(node.on_success.iter())
        .chain(on_false.iter())
        .chain(node.on_error.iter())
}

fn bfs<'a>(start: &'a NodeId, index: &HashMap<NodeId, usize>, nodes: &'a [Node]) -> Vec<&'a NodeId> {
    let mut seen: HashSet<&NodeId> = HashSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([start]);
    seen.insert(start);
    while let Some(id) = queue.pop_front() {
        order.push(id);
        let Some(node) = index.get(id).and_then(|pos| nodes.get(*pos)) else {
            continue;
        };
        for next in successors(node) {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    order
}

pub fn validate(flow: &Flow) -> Result<ValidatedFlow, FlowError> {
    let mut problems = Vec::new();

    if flow.nodes.is_empty() {
        return Err(FlowError::Validation(format!("flow {} has no nodes", flow.id)));
    }
    if flow.settings.max_loop_iterations == 0 {
        problems.push("settings.max_loop_iterations must be positive".to_string());
    }
    if flow.settings.max_concurrent_instances == Some(0) {
        problems.push("settings.max_concurrent_instances must be positive".to_string());
    }

    let mut index = HashMap::new();
    for (pos, node) in flow.nodes.iter().enumerate() {
        if index.insert(node.id.clone(), pos).is_some() {
            problems.push(format!("duplicate node id {}", node.id));
        }
    }
    if !index.contains_key(&flow.start) {
        problems.push(format!("start node {} does not exist", flow.start));
    }

    let mut compiled = flow.clone();
    for node in compiled.nodes.iter_mut() {
        check_node(node, &index, &mut problems);
    }

    if problems.is_empty() {
        let reachable: HashSet<&NodeId> = bfs(&compiled.start, &index, &compiled.nodes).into_iter().collect();
        for node in &compiled.nodes {
            if !reachable.contains(&node.id) {
                problems.push(format!("node {} is unreachable from {}", node.id, compiled.start));
            }
        }
        for node in &compiled.nodes {
            if let NodeKind::Loop { body, .. } = &node.kind {
                if !body_returns(&node.id, body, &index, &compiled.nodes) {
                    problems.push(format!(
                        "loop {} body never leads back to the loop header or a break",
                        node.id
                    ));
                }
            }
        }
    }

    if !problems.is_empty() {
        return Err(FlowError::Validation(format!("flow {}: {}", flow.id, problems.join("; "))));
    }

    let ordinals = bfs(&compiled.start, &index, &compiled.nodes)
        .into_iter()
        .enumerate()
        .map(|(pos, id)| (id.clone(), pos + 1))
        .collect();

    Ok(ValidatedFlow {
        flow: compiled,
        index,
        ordinals,
    })
}

fn body_returns(header: &NodeId, body: &NodeId, index: &HashMap<NodeId, usize>, nodes: &[Node]) -> bool {
    bfs(body, index, nodes).into_iter().any(|id| {
        id == header
            || matches!(
                index.get(id).and_then(|pos| nodes.get(*pos)).map(|n| &n.kind),
                Some(NodeKind::Break | NodeKind::Continue)
            )
    })
}

fn check_node(node: &mut Node, index: &HashMap<NodeId, usize>, problems: &mut Vec<String>) {
    let id = node.id.clone();
    let edge = |label: &str, targets: &[NodeId], problems: &mut Vec<String>| {
        if targets.len() > 1 {
            problems.push(format!(
                "node {id} has {} {label} targets but does not support fan-out",
                targets.len()
            ));
        }
        for target in targets {
            if !index.contains_key(target) {
                problems.push(format!("node {id} {label} edge points to unknown node {target}"));
            }
        }
    };
    edge("on_success", &node.on_success, problems);
    edge("on_error", &node.on_error, problems);

    match &mut node.kind {
        NodeKind::Action { action } => check_action(&id, action, problems),
        NodeKind::Branch { condition, on_false } => {
            edge("on_false", on_false, problems);
            match condition.compile() {
                Ok(parsed) => *condition = parsed,
                Err(err) => problems.push(format!("node {id}: invalid condition: {err}")),
            }
        }
        NodeKind::Loop { mode, body } => {
            edge("body", std::slice::from_ref(body), problems);
            if body == &id {
                problems.push(format!("loop {id} uses itself as body"));
            }
            match mode {
                LoopMode::While(condition) => match condition.compile() {
                    Ok(parsed) => *condition = parsed,
                    Err(err) => problems.push(format!("loop {id}: invalid condition: {err}")),
                },
                LoopMode::Count { times, .. } if *times == 0 => {
                    problems.push(format!("loop {id}: times must be positive"))
                }
                LoopMode::ForEach { source, item, .. } if source.is_empty() || item.is_empty() => {
                    problems.push(format!("loop {id}: for_each needs source and item"))
                }
                _ => {}
            }
        }
        NodeKind::Break | NodeKind::Continue => {
            if !node.on_success.is_empty() || !node.on_error.is_empty() {
                problems.push(format!("node {id}: break/continue must not declare edges"));
            }
        }
        NodeKind::SetVariable { name, op } => {
            if name.trim().is_empty() {
                problems.push(format!("node {id}: variable name is empty"));
            }
            if let VariableOp::Increment { by } = op {
                if !by.is_finite() {
                    problems.push(format!("node {id}: increment must be finite"));
                }
            }
        }
        NodeKind::Extract { into, from } => {
            if into.trim().is_empty() {
                problems.push(format!("node {id}: extract target is empty"));
            }
            if let ExtractSource::Pattern { pattern, .. } = from {
                if let Err(err) = Regex::new(pattern) {
                    problems.push(format!("node {id}: invalid pattern: {err}"));
                }
            }
        }
        NodeKind::Fail { .. } => {}
    }
}

fn check_action(id: &NodeId, action: &ActionSpec, problems: &mut Vec<String>) {
    let blank = |text: &str| text.trim().is_empty();
    match action {
        ActionSpec::Navigate { url } if blank(url) => problems.push(format!("node {id}: navigate url is empty")),
        ActionSpec::Click { selector }
        | ActionSpec::Input { selector, .. }
        | ActionSpec::Select { selector, .. }
            if blank(selector) =>
        {
            problems.push(format!("node {id}: selector is empty"))
        }
        ActionSpec::Wait { ms, min_ms, max_ms } => match (ms, min_ms, max_ms) {
            (Some(_), None, None) => {}
            (None, Some(min), Some(max)) if min <= max => {}
            _ => problems.push(format!("node {id}: wait needs ms, or min_ms <= max_ms")),
        },
        ActionSpec::Screenshot { path } if blank(path) => {
            problems.push(format!("node {id}: screenshot path is empty"))
        }
        ActionSpec::ExternalCall { service, .. } if blank(service) => {
            problems.push(format!("node {id}: external call service is empty"))
        }
        ActionSpec::Custom { name, .. } if blank(name) => problems.push(format!("node {id}: custom action name is empty")),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::types::{ActionSpec, NodeKind};

    fn nav(id: &str) -> Node {
        Node::new(
            id,
            NodeKind::Action {
                action: ActionSpec::Navigate {
                    url: "https://example.com".into(),
                },
            },
        )
    }

    #[test]
    fn accepts_linear_flow_and_assigns_ordinals() {
        let flow = Flow::new("f", "a", vec![nav("a").then("b"), nav("b").then("c"), nav("c")]);
        let validated = validate(&flow).unwrap();
        assert_eq!(validated.total_nodes(), 3);
        assert_eq!(validated.ordinal(&NodeId::from("a")), Some(1));
        assert_eq!(validated.ordinal(&NodeId::from("c")), Some(3));
    }

    #[test]
    fn rejects_fan_out_and_dangling_edges() {
        let flow = Flow::new("f", "a", vec![nav("a").then("b").then("c"), nav("b"), nav("c").or_else("zz")]);
        let err = validate(&flow).unwrap_err().to_string();
        assert!(err.contains("fan-out"), "{err}");
        assert!(err.contains("unknown node zz"), "{err}");
    }

    #[test]
    fn rejects_unreachable_and_duplicates() {
        let flow = Flow::new("f", "a", vec![nav("a"), nav("orphan")]);
        assert!(validate(&flow).unwrap_err().to_string().contains("unreachable"));

        let dup = Flow::new("f", "a", vec![nav("a"), nav("a")]);
        assert!(validate(&dup).unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn compiles_expressions_and_rejects_bad_ones() {
        let ok = Flow::new(
            "f",
            "check",
            vec![
                Node::new(
                    "check",
                    NodeKind::Branch {
                        condition: Condition::Expr("n >= 2".into()),
                        on_false: vec![NodeId::from("b")],
                    },
                )
                .then("a"),
                nav("a"),
                nav("b"),
            ],
        );
        let validated = validate(&ok).unwrap();
        let node = validated.node(&NodeId::from("check")).unwrap();
        assert!(matches!(
            &node.kind,
            NodeKind::Branch { condition: Condition::Compare { .. }, .. }
        ));

        let mut bad = ok.clone();
        bad.nodes[0].kind = NodeKind::Branch {
            condition: Condition::Expr("n >=".into()),
            on_false: vec![],
        };
        assert!(validate(&bad).unwrap_err().to_string().contains("invalid condition"));
    }

    #[test]
    fn loop_body_must_return_to_header() {
        let open_loop = Flow::new(
            "f",
            "loop",
            vec![
                Node::new(
                    "loop",
                    NodeKind::Loop {
                        mode: LoopMode::Count { times: 2, counter: None },
                        body: NodeId::from("work"),
                    },
                )
                .then("done"),
                nav("work"),
                nav("done"),
            ],
        );
        assert!(validate(&open_loop).unwrap_err().to_string().contains("never leads back"));

        let mut closed = open_loop.clone();
        closed.nodes[1].on_success.push(NodeId::from("loop"));
        assert!(validate(&closed).is_ok());
    }

    #[test]
    fn rejects_malformed_configs() {
        let flow = Flow::new(
            "f",
            "a",
            vec![
                Node::new("a", NodeKind::Action { action: ActionSpec::Click { selector: " ".into() } }).then("b"),
                Node::new(
                    "b",
                    NodeKind::Extract {
                        into: "x".into(),
                        from: ExtractSource::Pattern {
                            text: "${page}".into(),
                            pattern: "(unclosed".into(),
                            group: None,
                        },
                    },
                ),
            ],
        );
        let err = validate(&flow).unwrap_err().to_string();
        assert!(err.contains("selector is empty"), "{err}");
        assert!(err.contains("invalid pattern"), "{err}");
    }
}
