//! Flow and task definition files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rpa_flow::Flow;
use rpa_lease_pool::EnvironmentConfig;
use rpa_scheduler::TaskSpec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// A flow file holds either one flow or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FlowDocument {
    Many(Vec<Flow>),
    One(Box<Flow>),
}

/// Batch of tasks to submit, with the environments they need.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// Reads every flow under `paths`. Directories are scanned one level deep in
/// name order; only `.yaml`, `.yml` and `.json` files are considered.
pub async fn load_flows(paths: &[PathBuf]) -> Result<Vec<(PathBuf, Flow)>> {
    let mut flows = Vec::new();
    for path in paths {
        for file in expand(path).await? {
            let document: FlowDocument = parse_file(&file).await?;
            let parsed = match document {
                FlowDocument::Many(list) => list,
                FlowDocument::One(flow) => vec![*flow],
            };
            debug!(path = %file.display(), flows = parsed.len(), "flow file loaded");
            flows.extend(parsed.into_iter().map(|flow| (file.clone(), flow)));
        }
    }
    Ok(flows)
}

pub async fn load_tasks(path: &Path) -> Result<TaskFile> {
    parse_file(path).await
}

async fn expand(path: &Path) -> Result<Vec<PathBuf>> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if metadata.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("listing {}", path.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file = entry.path();
        if file.is_file() && has_known_extension(&file) {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

fn has_known_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

async fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !has_known_extension(path) {
        bail!("{} is not a yaml or json file", path.display());
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
