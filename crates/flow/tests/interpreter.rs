use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rpa_core_types::{EnvironmentId, ErrorClass, InstanceHandle, NodeId, TaskId, Variables};
use rpa_flow::{
    validate, ActionContext, ActionExecutor, ActionFailure, ActionReport, ActionSpec, Condition, Edge,
    ExecutionState, ExtractSource, Flow, FlowError, FlowInterpreter, FlowSettings, LoopMode, Node, NodeKind,
    Step, StepEnv, ValidatedFlow, VariableOp, LAST_ERROR_VAR,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(NodeId, ActionSpec)>>,
    scripted: Mutex<HashMap<NodeId, VecDeque<ActionFailure>>>,
    chaos: Option<Mutex<StdRng>>,
    delay: Option<Duration>,
}

impl Recorder {
    fn chaotic(seed: u64) -> Self {
        Self {
            chaos: Some(Mutex::new(StdRng::seed_from_u64(seed))),
            ..Self::default()
        }
    }

    fn fail_next(&self, node: &str, failure: ActionFailure) {
        self.scripted
            .lock()
            .unwrap()
            .entry(NodeId::from(node))
            .or_default()
            .push_back(failure);
    }

    fn calls_to(&self, node: &str) -> Vec<ActionSpec> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == node)
            .map(|(_, action)| action.clone())
            .collect()
    }
}

#[async_trait]
impl ActionExecutor for Recorder {
    async fn execute(
        &self,
        action: &ActionSpec,
        _variables: &Variables,
        ctx: &ActionContext,
    ) -> Result<ActionReport, ActionFailure> {
        self.calls.lock().unwrap().push((ctx.node.clone(), action.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&ctx.node)
            .and_then(|queue| queue.pop_front())
        {
            return Err(failure);
        }
        if let (Some(chaos), ActionSpec::ExternalCall { .. }) = (&self.chaos, action) {
            if chaos.lock().unwrap().gen_bool(0.3) {
                return Err(ActionFailure::transient("proxy reset"));
            }
        }
        Ok(ActionReport::ok().with_output(json!({"ok": true})))
    }
}

fn env() -> StepEnv {
    StepEnv {
        task: TaskId::from("task-1"),
        instance: InstanceHandle::new(EnvironmentId::from("env-1")),
        cancel: CancellationToken::new(),
        action_timeout: None,
    }
}

fn action(id: &str, action: ActionSpec) -> Node {
    Node::new(id, NodeKind::Action { action })
}

fn click(id: &str, selector: &str) -> Node {
    action(
        id,
        ActionSpec::Click {
            selector: selector.into(),
        },
    )
}

fn set(id: &str, name: &str, op: VariableOp) -> Node {
    Node::new(id, NodeKind::SetVariable { name: name.into(), op })
}

fn increment(id: &str, name: &str) -> Node {
    set(id, name, VariableOp::Increment { by: 1.0 })
}

fn compiled(flow: Flow) -> Arc<ValidatedFlow> {
    Arc::new(validate(&flow).expect("valid flow"))
}

struct Run {
    interpreter: FlowInterpreter,
    steps: Vec<Step>,
    progress: Vec<u8>,
    outcome: Result<(), FlowError>,
}

async fn run(flow: &Arc<ValidatedFlow>, executor: &dyn ActionExecutor, overrides: Variables) -> Run {
    let state = ExecutionState::start(flow, &overrides);
    let mut interpreter = FlowInterpreter::new(flow.clone(), state);
    let env = env();
    let mut steps = Vec::new();
    let mut progress = vec![interpreter.progress()];
    let mut outcome = Ok(());
    for _ in 0..10_000 {
        match interpreter.step(executor, &env).await {
            Ok(step) => {
                progress.push(interpreter.progress());
                let done = matches!(step, Step::Finished { .. });
                steps.push(step);
                if done {
                    break;
                }
            }
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }
    Run {
        interpreter,
        steps,
        progress,
        outcome,
    }
}

fn counter_loop_flow() -> Flow {
    Flow::new(
        "counter",
        "init",
        vec![
            set("init", "i", VariableOp::Set { value: json!(0) }).then("loop"),
            Node::new(
                "loop",
                NodeKind::Loop {
                    mode: LoopMode::While(Condition::Expr("i < 3".into())),
                    body: NodeId::from("work"),
                },
            )
            .then("done"),
            click("work", "#row-${i}").then("inc"),
            increment("inc", "i").then("loop"),
            action(
                "done",
                ActionSpec::Navigate {
                    url: "https://example.com/done".into(),
                },
            ),
        ],
    )
}

#[tokio::test]
async fn while_loop_runs_body_three_times_then_exits() {
    let flow = compiled(counter_loop_flow());
    let executor = Recorder::default();
    let run = run(&flow, &executor, Variables::new()).await;

    assert!(run.outcome.is_ok());
    let selectors: Vec<_> = executor
        .calls_to("work")
        .into_iter()
        .map(|action| match action {
            ActionSpec::Click { selector } => selector,
            other => panic!("unexpected action {other:?}"),
        })
        .collect();
    assert_eq!(selectors, vec!["#row-0", "#row-1", "#row-2"]);
    assert_eq!(executor.calls_to("done").len(), 1);
    assert_eq!(run.interpreter.state().variables.get("i"), Some(&json!(3)));
    assert!(run.steps.contains(&Step::Advanced {
        from: NodeId::from("loop"),
        to: NodeId::from("done"),
        edge: Edge::Exit,
    }));
    assert_eq!(run.steps.last(), Some(&Step::Finished { at: NodeId::from("done") }));
    assert!(run.interpreter.state().loop_stack.is_empty());
}

/// Outer counted loop whose body branches, calls an external service with an
/// error edge, and may continue or break.
fn tangled_flow() -> Flow {
    Flow::new(
        "tangled",
        "start",
        vec![
            set("start", "n", VariableOp::Set { value: json!(0) }).then("outer"),
            Node::new(
                "outer",
                NodeKind::Loop {
                    mode: LoopMode::Count {
                        times: 4,
                        counter: Some("k".into()),
                    },
                    body: NodeId::from("pick"),
                },
            )
            .then("finish"),
            Node::new(
                "pick",
                NodeKind::Branch {
                    condition: Condition::Expr("k == 1".into()),
                    on_false: vec![NodeId::from("fetch")],
                },
            )
            .then("skip"),
            Node::new("skip", NodeKind::Continue),
            action(
                "fetch",
                ActionSpec::ExternalCall {
                    service: "inventory".into(),
                    params: json!({"page": "${k}"}),
                    into: Some("reply".into()),
                },
            )
            .then("tally")
            .or_else("recover"),
            increment("recover", "errors").then("tally"),
            increment("tally", "n").then("check"),
            Node::new(
                "check",
                NodeKind::Branch {
                    condition: Condition::Expr("n >= limit".into()),
                    on_false: vec![NodeId::from("outer")],
                },
            )
            .then("stop"),
            Node::new("stop", NodeKind::Break),
            action(
                "finish",
                ActionSpec::Navigate {
                    url: "https://example.com".into(),
                },
            ),
        ],
    )
}

#[tokio::test]
async fn every_transition_follows_an_edge_and_progress_never_drops() {
    let flow = compiled(tangled_flow());
    for seed in 0..32u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut overrides = Variables::new();
        overrides.insert("limit".into(), json!(rng.gen_range(1..6)));
        let executor = Recorder::chaotic(seed);

        let run = run(&flow, &executor, overrides).await;
        assert!(run.outcome.is_ok(), "seed {seed}: {:?}", run.outcome);

        for step in &run.steps {
            if let Step::Advanced { from, to, edge } = step {
                assert!(flow.allows(from, to, *edge), "seed {seed}: {from} -> {to} via {edge:?}");
            }
        }
        assert!(
            run.progress.windows(2).all(|pair| pair[0] <= pair[1]),
            "seed {seed}: {:?}",
            run.progress
        );
        assert_eq!(run.progress.last(), Some(&100));
        assert_eq!(run.steps.last(), Some(&Step::Finished { at: NodeId::from("finish") }));
    }
}

#[tokio::test]
async fn break_outside_loop_fails_with_no_active_loop() {
    let flow = compiled(Flow::new("f", "stop", vec![Node::new("stop", NodeKind::Break)]));
    let run = run(&flow, &Recorder::default(), Variables::new()).await;
    let err = run.outcome.unwrap_err();
    assert_eq!(err, FlowError::NoActiveLoop(NodeId::from("stop")));
    assert_eq!(err.class(), ErrorClass::Permanent);
}

#[tokio::test]
async fn failure_follows_error_edge_when_present() {
    let flow = compiled(Flow::new(
        "f",
        "submit",
        vec![
            click("submit", "#go").then("done").or_else("fallback"),
            click("fallback", "#retry-link"),
            click("done", "#ok"),
        ],
    ));
    let executor = Recorder::default();
    executor.fail_next("submit", ActionFailure::permanent("button missing"));
    let run = run(&flow, &executor, Variables::new()).await;

    assert!(run.outcome.is_ok());
    assert_eq!(
        run.steps[0],
        Step::Advanced {
            from: NodeId::from("submit"),
            to: NodeId::from("fallback"),
            edge: Edge::Error,
        }
    );
    assert_eq!(
        run.interpreter.state().variables.get(LAST_ERROR_VAR),
        Some(&json!("button missing"))
    );
    assert!(executor.calls_to("done").is_empty());
}

#[tokio::test]
async fn unhandled_failure_keeps_its_classification() {
    let flow = compiled(Flow::new("f", "open", vec![click("open", "#a")]));
    let executor = Recorder::default();
    executor.fail_next("open", ActionFailure::transient("connection reset"));
    let run = run(&flow, &executor, Variables::new()).await;
    match run.outcome {
        Err(FlowError::ActionFailed { node, class, message }) => {
            assert_eq!(node, NodeId::from("open"));
            assert_eq!(class, ErrorClass::Transient);
            assert_eq!(message, "connection reset");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // The pointer stays on the failed node for diagnosis.
    assert_eq!(run.interpreter.state().pointer, Some(NodeId::from("open")));
}

#[tokio::test]
async fn fail_node_is_a_permanent_user_error() {
    let flow = compiled(
        Flow::new(
            "f",
            "guard",
            vec![Node::new(
                "guard",
                NodeKind::Fail {
                    message: "account ${user} is locked".into(),
                },
            )],
        )
        .with_default("user", "ada"),
    );
    let run = run(&flow, &Recorder::default(), Variables::new()).await;
    let err = run.outcome.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Permanent);
    assert!(err.to_string().contains("account ada is locked"));
}

#[tokio::test]
async fn runaway_loop_hits_iteration_limit() {
    let flow = compiled(
        Flow::new(
            "f",
            "loop",
            vec![
                Node::new(
                    "loop",
                    NodeKind::Loop {
                        mode: LoopMode::While(Condition::Exists("forever".into())),
                        body: NodeId::from("inc"),
                    },
                ),
                increment("inc", "n").then("loop"),
            ],
        )
        .with_default("forever", true)
        .with_settings(FlowSettings {
            max_loop_iterations: 5,
            ..FlowSettings::default()
        }),
    );
    let run = run(&flow, &Recorder::default(), Variables::new()).await;
    assert_eq!(
        run.outcome.unwrap_err(),
        FlowError::LoopLimitExceeded {
            node: NodeId::from("loop"),
            limit: 5,
        }
    );
    assert_eq!(run.interpreter.state().variables.get("n"), Some(&json!(5)));
}

#[tokio::test(start_paused = true)]
async fn slow_action_times_out_as_transient() {
    let flow = compiled(
        Flow::new("f", "open", vec![click("open", "#slow")]).with_settings(FlowSettings {
            action_timeout_ms: Some(100),
            ..FlowSettings::default()
        }),
    );
    let executor = Recorder {
        delay: Some(Duration::from_secs(10)),
        ..Recorder::default()
    };
    let run = run(&flow, &executor, Variables::new()).await;
    let err = run.outcome.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
    assert!(err.to_string().contains("timed out"), "{err}");
}

#[tokio::test]
async fn for_each_collects_extracted_fields() {
    let flow = compiled(Flow::new(
        "f",
        "each",
        vec![
            Node::new(
                "each",
                NodeKind::Loop {
                    mode: LoopMode::ForEach {
                        source: "rows".into(),
                        item: "row".into(),
                        index: Some("idx".into()),
                    },
                    body: NodeId::from("pluck"),
                },
            ),
            Node::new(
                "pluck",
                NodeKind::Extract {
                    into: "email".into(),
                    from: ExtractSource::Field {
                        source: "row".into(),
                        field: "email".into(),
                    },
                },
            )
            .then("collect"),
            set("collect", "emails", VariableOp::Append { value: json!("${email}") }).then("each"),
        ],
    ));
    let mut overrides = Variables::new();
    overrides.insert(
        "rows".into(),
        json!([{"email": "a@example.com"}, {"email": "b@example.com"}]),
    );
    let run = run(&flow, &Recorder::default(), overrides).await;
    assert!(run.outcome.is_ok());
    let vars = &run.interpreter.state().variables;
    assert_eq!(vars.get("emails"), Some(&json!(["a@example.com", "b@example.com"])));
    assert_eq!(vars.get("idx"), Some(&json!(1)));
}

#[tokio::test]
async fn pattern_and_json_extraction() {
    let flow = compiled(
        Flow::new(
            "f",
            "price",
            vec![
                Node::new(
                    "price",
                    NodeKind::Extract {
                        into: "price".into(),
                        from: ExtractSource::Pattern {
                            text: "${page}".into(),
                            pattern: r"Total: \$(\d+\.\d+)".into(),
                            group: None,
                        },
                    },
                )
                .then("parse"),
                Node::new(
                    "parse",
                    NodeKind::Extract {
                        into: "payload".into(),
                        from: ExtractSource::Json { source: "body".into() },
                    },
                ),
            ],
        )
        .with_default("page", "Items: 3, Total: $41.50")
        .with_default("body", r#"{"status":"ok","count":2}"#),
    );
    let run = run(&flow, &Recorder::default(), Variables::new()).await;
    assert!(run.outcome.is_ok());
    let vars = &run.interpreter.state().variables;
    assert_eq!(vars.get("price"), Some(&json!("41.50")));
    assert_eq!(vars.get("payload"), Some(&json!({"status": "ok", "count": 2})));
}

#[tokio::test]
async fn saved_state_resumes_mid_loop() {
    let flow = compiled(counter_loop_flow());
    let executor = Recorder::default();
    let env = env();
    let mut first = FlowInterpreter::new(flow.clone(), ExecutionState::start(&flow, &Variables::new()));
    for _ in 0..5 {
        first.step(&executor, &env).await.unwrap();
    }
    let progress_before = first.progress();
    let saved: Value = serde_json::to_value(first.into_state()).unwrap();
    let restored: ExecutionState = serde_json::from_value(saved).unwrap();
    assert_eq!(restored.loop_stack.len(), 1);

    let mut resumed = FlowInterpreter::new(flow.clone(), restored);
    assert_eq!(resumed.progress(), progress_before);
    while !resumed.is_finished() {
        resumed.step(&executor, &env).await.unwrap();
    }
    assert_eq!(executor.calls_to("work").len(), 3);
    assert_eq!(resumed.progress(), 100);
}

#[test]
fn flow_definitions_load_from_yaml() {
    let yaml = r##"
id: login
name: Log in
version: 2
start: open
defaults:
  host: shop.example
settings:
  max_concurrent_instances: 2
nodes:
  - id: open
    type: action
    action: { kind: navigate, url: "https://${host}/login" }
    on_success: [user]
  - id: user
    type: action
    action: { kind: input, selector: "#user", text: "${username}" }
    on_success: [pause]
  - id: pause
    type: action
    action: { kind: wait, min_ms: 200, max_ms: 800 }
"##;
    let flow: Flow = serde_yaml::from_str(yaml).unwrap();
    let validated = validate(&flow).unwrap();
    assert_eq!(validated.version(), 2);
    assert_eq!(validated.settings().max_concurrent_instances, Some(2));
    assert_eq!(validated.total_nodes(), 3);
}
