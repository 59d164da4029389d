use std::path::PathBuf;

use assert_cmd::Command;

fn demos() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos")
}

fn runner() -> Command {
    let mut cmd = Command::cargo_bin("rpa-runner").unwrap();
    cmd.current_dir(env!("CARGO_MANIFEST_DIR")).env_remove("RUST_LOG");
    cmd
}

#[test]
fn validate_accepts_the_demo_flows() {
    let output = runner()
        .arg("validate")
        .arg(demos().join("flows"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ok      login-report"));
    assert!(stdout.contains("ok      check-inbox"));
}

#[test]
fn validate_reports_broken_flows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(
        &path,
        "id: broken\nstart: a\nnodes:\n  - id: a\n    type: action\n    action: { kind: click, selector: '#x' }\n    on_success: [missing]\n",
    )
    .unwrap();

    let output = runner().arg("validate").arg(&path).output().unwrap();
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("invalid broken"));
    assert!(stdout.contains("unknown node missing"));
}

#[test]
fn run_drains_the_demo_batch_and_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let events = dir.path().join("events.json");
    let metrics = dir.path().join("metrics.prom");

    let output = runner()
        .args(["--log-level", "warn", "--output", "json", "run", "--quiet"])
        .arg("--flows")
        .arg(demos().join("flows"))
        .arg("--tasks")
        .arg(demos().join("tasks.yaml"))
        .arg("--state-file")
        .arg(&state)
        .arg("--events")
        .arg(&events)
        .arg("--metrics")
        .arg(&metrics)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["completed"], 4);
    assert_eq!(summary["failed"], 0);

    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&state).unwrap()).unwrap();
    assert_eq!(saved["tasks"].as_array().map(Vec::len), Some(0));
    assert!(std::fs::metadata(&events).unwrap().len() > 0);
    assert!(std::fs::read_to_string(&metrics)
        .unwrap()
        .contains("rpa_scheduler_submitted_total 4"));

    let inspect = runner()
        .args(["inspect", "--state-file"])
        .arg(&state)
        .output()
        .unwrap();
    assert!(inspect.status.success());
    assert!(String::from_utf8_lossy(&inspect.stdout).contains("0 task(s)"));
}
