//! Persisted scheduler state for crash-and-restart recovery.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rpa_scheduler::TaskRecord;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const STATE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

impl StateSnapshot {
    pub fn new(tasks: Vec<TaskRecord>) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            tasks,
        }
    }

    /// Writes the snapshot through a temporary file in the same directory so a
    /// crash mid-write never leaves a truncated state file behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let mut file = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temporary file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut file, self).context("serialising state snapshot")?;
        file.flush()?;
        file.persist(path)
            .with_context(|| format!("replacing {}", path.display()))?;
        info!(path = %path.display(), tasks = self.tasks.len(), "state saved");
        Ok(())
    }

    /// `Ok(None)` when there is no state file yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let snapshot: Self =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if snapshot.version != STATE_VERSION {
            bail!(
                "{} has state version {}, expected {}",
                path.display(),
                snapshot.version,
                STATE_VERSION
            );
        }
        Ok(Some(snapshot))
    }
}
