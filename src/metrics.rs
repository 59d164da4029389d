use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Encoder, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTERED: OnceCell<()> = OnceCell::new();

pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Registers scheduler and lease pool collectors with the process registry.
/// Safe to call more than once.
pub fn register_metrics() {
    REGISTERED.get_or_init(|| {
        rpa_scheduler::metrics::register_metrics(&REGISTRY);
        rpa_lease_pool::metrics::register_metrics(&REGISTRY);
    });
}

/// Prometheus text exposition of everything registered so far.
pub fn encode_text() -> anyhow::Result<String> {
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
