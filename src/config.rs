//! Runner configuration.
//!
//! Values are layered: built-in defaults, then a YAML file, then
//! `RPA_RUNNER__SECTION__KEY` environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rpa_lease_pool::{EnvironmentConfig, PoolConfig};
use rpa_scheduler::{RetryPolicy, SchedulerConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const ENV_PREFIX: &str = "RPA_RUNNER__";
const LOCAL_CONFIG: &str = "config/rpa-runner.yaml";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Environments registered with the lease pool at startup
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

impl RunnerConfig {
    /// Loads the layered configuration. An explicit `path` must exist; the
    /// fallback locations are optional.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Some(Self::read_file(path).await?),
            None => match Self::discover() {
                Some(found) => Some(Self::read_file(&found).await?),
                None => None,
            },
        };
        let config = base.unwrap_or_default();
        config.apply_env_overrides(std::env::vars())
    }

    async fn read_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        debug!(path = %path.display(), "configuration file loaded");
        Ok(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.is_file() {
            return Some(local);
        }
        let user = dirs::config_dir()?.join("rpa-runner").join("config.yaml");
        user.is_file().then_some(user)
    }

    /// Applies `RPA_RUNNER__SECTION__KEY=value` overrides. Values are parsed
    /// as JSON first and fall back to a plain string.
    pub fn apply_env_overrides<I>(self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides: BTreeMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| key.strip_prefix(ENV_PREFIX).map(|rest| (rest.to_string(), value)))
            .collect();
        if overrides.is_empty() {
            return Ok(self);
        }

        let mut tree = serde_json::to_value(&self).context("serialising configuration")?;
        for (key, raw) in overrides {
            let path: Vec<String> = key.split("__").map(|part| part.to_ascii_lowercase()).collect();
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            set_path(&mut tree, &path, value).with_context(|| format!("applying {ENV_PREFIX}{key}"))?;
            debug!(key = %key, "configuration override applied");
        }
        serde_json::from_value(tree).context("configuration overrides do not fit the schema")
    }
}

fn set_path(tree: &mut Value, path: &[String], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        bail!("empty override key");
    };
    let mut cursor = tree;
    for part in parents {
        let Value::Object(map) = cursor else {
            bail!("{part} is not a section");
        };
        cursor = map
            .entry(part.clone())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    match cursor {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        _ => bail!("{last} has no parent section"),
    }
}
