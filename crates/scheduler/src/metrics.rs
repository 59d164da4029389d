use once_cell::sync::Lazy;
use prometheus::{core::Collector, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::error;

static TASKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rpa_scheduler_tasks_total", "Tasks that reached a terminal status"),
        &["outcome"],
    )
    .unwrap()
});
static TASKS_RUNNING: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("rpa_scheduler_running", "Tasks currently holding a worker slot").unwrap());
static TASKS_QUEUED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("rpa_scheduler_queued", "Pending tasks in the ready queue").unwrap());
static RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("rpa_scheduler_retries_total", "Failed attempts re-queued for retry").unwrap()
});
static SUBMITTED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("rpa_scheduler_submitted_total", "Tasks accepted by submit or recover").unwrap());

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register scheduler metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, TASKS_TOTAL.clone());
    register(registry, TASKS_RUNNING.clone());
    register(registry, TASKS_QUEUED.clone());
    register(registry, RETRIES_TOTAL.clone());
    register(registry, SUBMITTED_TOTAL.clone());
}

pub(crate) fn record_submitted() {
    SUBMITTED_TOTAL.inc();
}

pub(crate) fn record_outcome(outcome: &str) {
    TASKS_TOTAL.with_label_values(&[outcome]).inc();
}

pub(crate) fn record_retry() {
    RETRIES_TOTAL.inc();
}

pub(crate) fn set_gauges(running: usize, queued: usize) {
    TASKS_RUNNING.set(running as i64);
    TASKS_QUEUED.set(queued as i64);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerMetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub running: i64,
    pub queued: i64,
}

pub fn snapshot() -> SchedulerMetricsSnapshot {
    let outcome = |label: &str| TASKS_TOTAL.with_label_values(&[label]).get();
    SchedulerMetricsSnapshot {
        submitted: SUBMITTED_TOTAL.get(),
        completed: outcome("completed"),
        failed: outcome("failed"),
        cancelled: outcome("cancelled"),
        retries: RETRIES_TOTAL.get(),
        running: TASKS_RUNNING.get(),
        queued: TASKS_QUEUED.get(),
    }
}
