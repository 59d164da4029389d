use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rpa_core_types::{TaskId, TaskStatus};
use rpa_runner::{load_flows, load_tasks, App, DryRunExecutor, LocalBrowserControl, RunnerConfig, StateSnapshot};

fn demo(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(path)
}

fn quick_config() -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.jitter_ms = 0;
    config.scheduler.idle_poll_ms = 20;
    config
}

async fn demo_app(config: &RunnerConfig) -> (App, Arc<LocalBrowserControl>, Vec<rpa_scheduler::TaskSpec>) {
    let control = LocalBrowserControl::new();
    let app = App::build(config, control.clone(), Arc::new(DryRunExecutor::new()));
    let flows = load_flows(&[demo("flows")]).await.unwrap();
    assert_eq!(app.register_flows(flows).unwrap(), 3);
    let tasks = load_tasks(&demo("tasks.yaml")).await.unwrap();
    app.register_environments(tasks.environments);
    (app, control, tasks.tasks)
}

#[tokio::test]
async fn loader_reads_single_and_list_documents() {
    let flows = load_flows(&[demo("flows")]).await.unwrap();
    let ids: Vec<String> = flows.iter().map(|(_, flow)| flow.id.to_string()).collect();
    assert_eq!(ids, ["login-report", "warmup", "check-inbox"]);

    let tasks = load_tasks(&demo("tasks.yaml")).await.unwrap();
    assert_eq!(tasks.environments.len(), 2);
    assert_eq!(tasks.tasks.len(), 4);
    assert_eq!(tasks.tasks[0].priority, 8);
}

#[tokio::test]
async fn loader_rejects_unknown_extensions() {
    let file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
    assert!(load_flows(&[file.path().to_path_buf()]).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn demo_batch_completes() {
    let config = quick_config();
    let (mut app, control, specs) = demo_app(&config).await;
    let report = app.submit_all(specs).unwrap();
    assert_eq!(report.submitted.len(), 4);

    app.start().await;
    app.scheduler.wait_idle().await;

    let summary = app.summary();
    assert_eq!(summary.completed, 4, "{:?}", summary.tasks);
    assert!(!summary.has_failures());
    assert_eq!(
        app.events.status_trail(&TaskId::from("sales-report")),
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
    );
    let inbox = app.scheduler.task(&TaskId::from("ops-inbox")).unwrap();
    assert_eq!(inbox.variables().get("unread"), Some(&serde_json::json!("12")));

    assert_eq!(app.stop(Duration::from_secs(1)).await, 0);
    assert_eq!(control.created(), control.destroyed());
}

#[tokio::test(start_paused = true)]
async fn interrupted_run_resumes_from_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let config = quick_config();

    let (mut first, _, specs) = demo_app(&config).await;
    first.submit_all(specs.clone()).unwrap();
    first.start().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.stop(Duration::from_secs(5)).await;

    let saved = first.scheduler.export_recoverable();
    assert!(!saved.is_empty());
    assert!(saved
        .iter()
        .all(|record| matches!(record.status, TaskStatus::Pending | TaskStatus::Paused)));
    StateSnapshot::new(saved.clone()).save(&state_path).unwrap();

    let (mut second, _, specs) = demo_app(&config).await;
    let snapshot = StateSnapshot::load(&state_path).unwrap().unwrap();
    let recovered = second.scheduler.recover(snapshot.tasks);
    assert_eq!(recovered.recovered.len(), saved.len());
    assert!(recovered.rejected.is_empty());

    // Replaying the task file skips the recovered ids.
    let report = second.submit_all(specs).unwrap();
    assert_eq!(report.skipped.len(), saved.len());

    second.start().await;
    second.scheduler.wait_idle().await;
    for record in &saved {
        let task = second.scheduler.task(&record.id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "{}", record.id);
        let trail = second.events.recent_task(&record.id);
        assert!(trail.first().unwrap().seq > record.last_event_seq);
    }
    second.stop(Duration::from_secs(1)).await;
}

#[test]
fn missing_state_file_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(StateSnapshot::load(&dir.path().join("none.json")).unwrap().is_none());
}
