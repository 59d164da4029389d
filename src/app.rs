//! Wires the flow catalog, lease pool, progress sinks and scheduler together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rpa_core_types::{TaskId, TaskStatus};
use rpa_flow::{ActionExecutor, Flow, FlowCatalog};
use rpa_lease_pool::{BrowserControl, EnvironmentConfig, LeasePool};
use rpa_progress::{BroadcastProgressReporter, FanoutReporter, InMemoryProgressReporter};
use rpa_scheduler::{Scheduler, SchedulerError, TaskSpec};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RunnerConfig;

const BUS_CAPACITY: usize = 1024;
const MEMORY_CAPACITY: usize = 10_000;

pub struct App {
    pub flows: Arc<FlowCatalog>,
    pub pool: Arc<LeasePool>,
    pub scheduler: Scheduler,
    /// Recent events per task, for summaries and the events snapshot
    pub events: Arc<InMemoryProgressReporter>,
    /// Live stream for console subscribers
    pub bus: Arc<BroadcastProgressReporter>,
    crash_listener: Option<JoinHandle<()>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub submitted: Vec<TaskId>,
    /// Ids already known to the scheduler, typically recovered tasks
    pub skipped: Vec<TaskId>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskLine {
    pub id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: TaskStatus,
    pub progress: u8,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
    pub pending: usize,
    pub running: usize,
    pub tasks: Vec<TaskLine>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl App {
    pub fn build(
        config: &RunnerConfig,
        control: Arc<dyn BrowserControl>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let flows = Arc::new(FlowCatalog::new());
        let pool = Arc::new(LeasePool::new(control, config.pool.clone()));
        let events = Arc::new(InMemoryProgressReporter::new(MEMORY_CAPACITY));
        let bus = BroadcastProgressReporter::new(BUS_CAPACITY);
        let reporter = FanoutReporter::new()
            .with_sink(events.clone())
            .with_sink(bus.clone());

        let scheduler = Scheduler::builder(flows.clone(), pool.clone(), executor)
            .config(config.scheduler.clone())
            .retry_policy(config.retry.clone())
            .reporter(Arc::new(reporter))
            .build();

        let app = Self {
            flows,
            pool,
            scheduler,
            events,
            bus,
            crash_listener: None,
        };
        app.register_environments(config.environments.iter().cloned());
        app
    }

    pub fn register_environments(&self, environments: impl IntoIterator<Item = EnvironmentConfig>) {
        for environment in environments {
            let id = environment.id.clone();
            if self.pool.register_environment(environment).is_some() {
                warn!(environment = %id, "environment registered twice, keeping the latest definition");
            }
        }
    }

    pub fn register_flows(&self, flows: Vec<(PathBuf, Flow)>) -> Result<usize> {
        let count = flows.len();
        for (path, flow) in flows {
            let id = flow.id.clone();
            let validated = self
                .flows
                .register(flow)
                .with_context(|| format!("flow {id} from {}", path.display()))?;
            info!(flow = %id, version = validated.version(), nodes = validated.total_nodes(), "flow registered");
        }
        Ok(count)
    }

    /// Submits every spec. Ids the scheduler already holds are skipped so a
    /// task file can be replayed on top of recovered state.
    pub fn submit_all(&self, specs: Vec<TaskSpec>) -> Result<SubmitReport> {
        let mut report = SubmitReport::default();
        for spec in specs {
            let label = spec.name.clone().unwrap_or_else(|| spec.flow.to_string());
            match self.scheduler.submit(spec) {
                Ok(id) => report.submitted.push(id),
                Err(SchedulerError::DuplicateTask(id)) => {
                    info!(task_id = %id, "task already known, not resubmitted");
                    report.skipped.push(id);
                }
                Err(err) => return Err(err).with_context(|| format!("submitting task {label:?}")),
            }
        }
        Ok(report)
    }

    /// Starts the scheduler and, when the collaborator publishes crash
    /// notifications, the lease pool's crash listener.
    pub async fn start(&mut self) {
        self.scheduler.start().await;
        if self.crash_listener.is_none() {
            self.crash_listener = self.pool.spawn_crash_listener();
        }
    }

    pub async fn stop(&mut self, grace: std::time::Duration) -> usize {
        let still_running = self.scheduler.shutdown(grace).await;
        if let Some(listener) = self.crash_listener.take() {
            listener.abort();
        }
        still_running
    }

    pub fn summary(&self) -> RunSummary {
        let stats = self.scheduler.stats();
        let mut tasks: Vec<TaskLine> = self
            .scheduler
            .tasks()
            .into_iter()
            .map(|task| TaskLine {
                id: task.id,
                name: task.name,
                status: task.status,
                progress: task.progress,
                retries: task.retry_count,
                error: task.last_error.map(|err| format!("{}: {}", err.kind, err.message)),
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        RunSummary {
            completed: stats.completed,
            failed: stats.failed,
            cancelled: stats.cancelled,
            paused: stats.paused,
            pending: stats.pending,
            running: stats.running,
            tasks,
        }
    }
}
