use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntGauge, Registry};
use tracing::error;

lazy_static! {
    static ref POOL_LEASES_ACTIVE: IntGauge =
        IntGauge::new("rpa_pool_leases_active", "Leases currently held").unwrap();
    static ref POOL_INSTANCES_IDLE: IntGauge =
        IntGauge::new("rpa_pool_instances_idle", "Warm instances parked in the idle pool").unwrap();
    static ref POOL_INSTANCES_CREATED: IntCounter = IntCounter::new(
        "rpa_pool_instances_created_total",
        "Browser instances created through the collaborator",
    )
    .unwrap();
    static ref POOL_INSTANCES_DESTROYED: IntCounter = IntCounter::new(
        "rpa_pool_instances_destroyed_total",
        "Browser instances torn down",
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register lease pool metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, POOL_LEASES_ACTIVE.clone());
    register(registry, POOL_INSTANCES_IDLE.clone());
    register(registry, POOL_INSTANCES_CREATED.clone());
    register(registry, POOL_INSTANCES_DESTROYED.clone());
}

pub(crate) fn set_gauges(active: usize, idle: usize) {
    POOL_LEASES_ACTIVE.set(active as i64);
    POOL_INSTANCES_IDLE.set(idle as i64);
}

pub(crate) fn record_created() {
    POOL_INSTANCES_CREATED.inc();
}

pub(crate) fn record_destroyed(count: usize) {
    POOL_INSTANCES_DESTROYED.inc_by(count as u64);
}

/// Plain view of the process-wide pool collectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub leases_active: i64,
    pub instances_idle: i64,
    pub instances_created: u64,
    pub instances_destroyed: u64,
}

pub fn snapshot() -> PoolMetricsSnapshot {
    PoolMetricsSnapshot {
        leases_active: POOL_LEASES_ACTIVE.get(),
        instances_idle: POOL_INSTANCES_IDLE.get(),
        instances_created: POOL_INSTANCES_CREATED.get(),
        instances_destroyed: POOL_INSTANCES_DESTROYED.get(),
    }
}
