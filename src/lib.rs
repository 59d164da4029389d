//! RPA runner: loads flow and task definitions, then drives them through the
//! scheduler against a pool of automation environments.

pub mod app;
pub mod config;
pub mod dryrun;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod state;

pub use app::{App, RunSummary, SubmitReport, TaskLine};
pub use config::{LoggingConfig, RunnerConfig};
pub use dryrun::{DryRunExecutor, LocalBrowserControl};
pub use loader::{load_flows, load_tasks, TaskFile};
pub use state::StateSnapshot;
