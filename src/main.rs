//! RPA runner command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rpa_progress::{to_mpsc, EventKind};
use rpa_runner::{
    load_flows, load_tasks, logging, metrics, App, DryRunExecutor, LocalBrowserControl, RunSummary, RunnerConfig,
    StateSnapshot,
};
use serde::Serialize;
use tracing::{info, warn};

/// Schedules RPA flows across isolated automation environments
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Output format
    #[arg(short, long, default_value = "human")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// Check flow files without running anything
    Validate {
        /// Flow files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Run a batch of tasks until the queue drains or Ctrl-C
    Run(RunArgs),

    /// Show the tasks saved in a state file
    Inspect {
        #[arg(long, value_name = "FILE")]
        state_file: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Flow files or directories
    #[arg(long = "flows", required = true, num_args = 1..)]
    flows: Vec<PathBuf>,

    /// Task file with the environments and tasks to submit
    #[arg(long, value_name = "FILE")]
    tasks: PathBuf,

    /// Recover unfinished tasks from this file and save them back on exit
    #[arg(long, value_name = "FILE")]
    state_file: Option<PathBuf>,

    #[arg(long)]
    max_concurrent: Option<usize>,

    /// How long a task waits for its environment, e.g. `30s`
    #[arg(long, value_parser = humantime::parse_duration)]
    lease_timeout: Option<Duration>,

    /// How long running tasks get to reach a node boundary on shutdown
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    shutdown_grace: Duration,

    /// Write the recorded progress events here on exit
    #[arg(long, value_name = "FILE")]
    events: Option<PathBuf>,

    /// Write Prometheus metrics here on exit
    #[arg(long, value_name = "FILE")]
    metrics: Option<PathBuf>,

    /// Do not print live status changes
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RunnerConfig::load(cli.config.as_deref()).await?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    logging::init_logging(&config.logging, cli.debug)?;
    metrics::register_metrics();

    match cli.command {
        Commands::Validate { paths } => cmd_validate(&paths, cli.output).await,
        Commands::Run(args) => cmd_run(config, args, cli.output).await,
        Commands::Inspect { state_file } => cmd_inspect(&state_file, cli.output),
    }
}

async fn cmd_validate(paths: &[PathBuf], output: OutputFormat) -> Result<()> {
    #[derive(Serialize)]
    struct Checked {
        file: PathBuf,
        flow: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    }

    let flows = load_flows(paths).await?;
    if flows.is_empty() {
        bail!("no flow files found");
    }
    let checked: Vec<Checked> = flows
        .into_iter()
        .map(|(file, flow)| Checked {
            file,
            flow: flow.id.to_string(),
            error: rpa_flow::validate(&flow).err().map(|err| err.to_string()),
        })
        .collect();

    match output {
        OutputFormat::Human => {
            for item in &checked {
                match &item.error {
                    None => println!("ok      {} ({})", item.flow, item.file.display()),
                    Some(err) => println!("invalid {} ({}): {err}", item.flow, item.file.display()),
                }
            }
        }
        format => print_structured(&checked, format)?,
    }

    let invalid = checked.iter().filter(|item| item.error.is_some()).count();
    if invalid > 0 {
        bail!("{invalid} of {} flows are invalid", checked.len());
    }
    Ok(())
}

async fn cmd_run(mut config: RunnerConfig, args: RunArgs, output: OutputFormat) -> Result<()> {
    if let Some(max) = args.max_concurrent {
        config.scheduler.max_concurrent = max;
    }
    if let Some(timeout) = args.lease_timeout {
        config.scheduler.lease_timeout_ms = timeout.as_millis() as u64;
    }

    let control = LocalBrowserControl::new();
    let mut app = App::build(&config, control.clone(), Arc::new(DryRunExecutor::new()));

    let flows = load_flows(&args.flows).await?;
    let registered = app.register_flows(flows)?;
    let task_file = load_tasks(&args.tasks).await?;
    app.register_environments(task_file.environments);
    info!(flows = registered, tasks = task_file.tasks.len(), "definitions loaded");

    if let Some(path) = &args.state_file {
        if let Some(snapshot) = StateSnapshot::load(path)? {
            let report = app.scheduler.recover(snapshot.tasks);
            info!(
                recovered = report.recovered.len(),
                rejected = report.rejected.len(),
                "state file replayed"
            );
        }
    }
    let submitted = app.submit_all(task_file.tasks)?;
    info!(
        submitted = submitted.submitted.len(),
        skipped = submitted.skipped.len(),
        "tasks queued"
    );

    let printer = (!args.quiet).then(|| {
        let mut rx = to_mpsc(app.bus.clone(), 256);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.kind != EventKind::Status {
                    continue;
                }
                let node = event.current_node.map(|node| node.to_string()).unwrap_or_default();
                match &event.error {
                    Some(err) => eprintln!(
                        "[{}#{}] {} {}% {node} {}: {}",
                        event.task_id,
                        event.seq,
                        event.status.as_str(),
                        event.progress,
                        err.kind,
                        err.message
                    ),
                    None => eprintln!(
                        "[{}#{}] {} {}% {node}",
                        event.task_id,
                        event.seq,
                        event.status.as_str(),
                        event.progress
                    ),
                }
            }
        })
    });

    app.start().await;
    tokio::select! {
        _ = app.scheduler.wait_idle() => info!("queue drained"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            warn!("interrupted, pausing running tasks");
        }
    }
    let still_running = app.stop(args.shutdown_grace).await;
    if still_running > 0 {
        warn!(still_running, "tasks did not reach a node boundary before the grace period ended");
    }
    if let Some(printer) = printer {
        printer.abort();
    }

    if let Some(path) = &args.state_file {
        StateSnapshot::new(app.scheduler.export_recoverable()).save(path)?;
    }
    if let Some(path) = &args.events {
        app.events
            .write_snapshot(path)
            .with_context(|| format!("writing events to {}", path.display()))?;
    }
    if let Some(path) = &args.metrics {
        write_metrics(path)?;
    }

    let summary = app.summary();
    print_summary(&summary, output)?;
    info!(
        instances_created = control.created(),
        instances_destroyed = control.destroyed(),
        "run finished"
    );
    if summary.has_failures() {
        bail!("{} task(s) failed", summary.failed);
    }
    Ok(())
}

fn cmd_inspect(path: &Path, output: OutputFormat) -> Result<()> {
    let Some(snapshot) = StateSnapshot::load(path)? else {
        bail!("no state file at {}", path.display());
    };
    match output {
        OutputFormat::Human => {
            println!(
                "{} task(s) saved at {}",
                snapshot.tasks.len(),
                snapshot.saved_at.to_rfc3339()
            );
            for record in &snapshot.tasks {
                let node = record
                    .execution
                    .pointer
                    .as_ref()
                    .map(|node| node.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<8} flow={} env={} node={} progress={}% retries={}/{}",
                    record.id.to_string(),
                    record.status.as_str(),
                    record.flow,
                    record.environment,
                    node,
                    record.progress,
                    record.retry_count,
                    record.max_retries
                );
            }
        }
        format => print_structured(&snapshot, format)?,
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Human => {
            for task in &summary.tasks {
                let label = task.name.as_deref().unwrap_or("");
                match &task.error {
                    Some(err) => println!(
                        "{:<38} {:<10} {:>3}% retries={} {label} ({err})",
                        task.id.to_string(),
                        task.status.as_str(),
                        task.progress,
                        task.retries
                    ),
                    None => println!(
                        "{:<38} {:<10} {:>3}% retries={} {label}",
                        task.id.to_string(),
                        task.status.as_str(),
                        task.progress,
                        task.retries
                    ),
                }
            }
            println!(
                "completed={} failed={} cancelled={} paused={} pending={}",
                summary.completed, summary.failed, summary.cancelled, summary.paused, summary.pending
            );
            Ok(())
        }
        format => print_structured(summary, format),
    }
}

fn print_structured<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let text = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        _ => serde_json::to_string_pretty(value)?,
    };
    println!("{text}");
    Ok(())
}

fn write_metrics(path: &Path) -> Result<()> {
    let text = metrics::encode_text()?;
    std::fs::write(path, text).with_context(|| format!("writing metrics to {}", path.display()))
}
