use chrono::{DateTime, Utc};
use rpa_core_types::{EnvironmentId, InstanceHandle, LeaseId, TaskId};
use serde::{Deserialize, Serialize};

/// An automation environment (isolated browser profile) known to the pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub id: EnvironmentId,
    #[serde(default)]
    pub name: String,
    /// Launch parameters handed verbatim to the browser-control collaborator.
    #[serde(default)]
    pub launch: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl EnvironmentConfig {
    pub fn new(id: impl Into<EnvironmentId>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            launch: serde_json::Value::Null,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Exclusive binding between an environment and a running task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Lease {
    pub id: LeaseId,
    pub environment: EnvironmentId,
    pub task: TaskId,
    pub instance: InstanceHandle,
    pub acquired_at: DateTime<Utc>,
    /// True when the instance came from the idle pool.
    pub reused: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle_per_environment")]
    pub max_idle_per_environment: usize,
    #[serde(default = "default_max_idle_total")]
    pub max_idle_total: usize,
}

fn default_max_idle_per_environment() -> usize {
    1
}

fn default_max_idle_total() -> usize {
    16
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_environment: default_max_idle_per_environment(),
            max_idle_total: default_max_idle_total(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub environments: usize,
    pub active: usize,
    pub idle: usize,
    pub created: u64,
    pub destroyed: u64,
}
