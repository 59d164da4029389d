use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rpa_core_types::FlowId;
use serde::Serialize;
use tracing::info;

use crate::errors::FlowError;
use crate::types::Flow;
use crate::validate::{validate, ValidatedFlow};

/// Execution counters kept per flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// Registered, validated flows keyed by id.
#[derive(Default)]
pub struct FlowCatalog {
    flows: DashMap<FlowId, Arc<ValidatedFlow>>,
    stats: DashMap<FlowId, FlowStats>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a flow. A registered flow is only replaced by the
    /// same or a newer version.
    pub fn register(&self, flow: Flow) -> Result<Arc<ValidatedFlow>, FlowError> {
        if let Some(existing) = self.flows.get(&flow.id) {
            if existing.version() > flow.version {
                return Err(FlowError::Validation(format!(
                    "flow {} version {} is older than registered version {}",
                    flow.id,
                    flow.version,
                    existing.version()
                )));
            }
        }
        let validated = Arc::new(validate(&flow)?);
        info!(target: "flow", flow = %flow.id, version = flow.version, nodes = flow.nodes.len(), "flow registered");
        self.flows.insert(flow.id.clone(), validated.clone());
        Ok(validated)
    }

    pub fn get(&self, id: &FlowId) -> Option<Arc<ValidatedFlow>> {
        self.flows.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &FlowId) -> bool {
        self.flows.contains_key(id)
    }

    pub fn remove(&self, id: &FlowId) -> Option<Arc<ValidatedFlow>> {
        self.stats.remove(id);
        self.flows.remove(id).map(|(_, flow)| flow)
    }

    pub fn ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<_> = self.flows.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn record_execution(&self, id: &FlowId, success: bool) {
        let mut stats = self.stats.entry(id.clone()).or_default();
        stats.executions += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.last_executed_at = Some(Utc::now());
    }

    pub fn stats(&self, id: &FlowId) -> FlowStats {
        self.stats.get(id).map(|entry| entry.value().clone()).unwrap_or_default()
    }
}
