//! Resource lease pool: one exclusive lease per automation environment, with
//! warm instance reuse and forced teardown on crash.

pub mod api;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod pool;

pub use api::{BrowserControl, CrashEvent};
pub use errors::LeaseError;
pub use model::{EnvironmentConfig, Lease, PoolConfig, PoolStats};
pub use pool::LeasePool;
