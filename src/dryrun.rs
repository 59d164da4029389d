//! Local stand-ins for the browser-control product, used by the `run` command
//! and the end-to-end tests. Nothing here touches a real browser.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rpa_core_types::{InstanceHandle, Variables};
use rpa_flow::{wait_duration, ActionContext, ActionExecutor, ActionFailure, ActionReport, ActionSpec};
use rpa_lease_pool::{BrowserControl, CrashEvent, EnvironmentConfig};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Logs every action instead of performing it. Waits are honoured and stop
/// early on cancellation; actions with an `into` variable receive a
/// placeholder describing the call.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    executed: AtomicU64,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ActionExecutor for DryRunExecutor {
    async fn execute(
        &self,
        action: &ActionSpec,
        _variables: &Variables,
        ctx: &ActionContext,
    ) -> Result<ActionReport, ActionFailure> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "dry_run",
            task_id = %ctx.task,
            node_id = %ctx.node,
            instance = %ctx.instance.id,
            action = action.name(),
            "action"
        );

        if let Some(duration) = wait_duration(action) {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(ActionFailure::transient("wait interrupted by cancellation"));
                }
                _ = tokio::time::sleep(duration) => {}
            }
            return Ok(ActionReport::ok().with_message(format!("waited {}ms", duration.as_millis())));
        }

        let mut report = ActionReport::ok();
        if action.output_var().is_some() {
            report = report.with_output(json!({
                "dry_run": true,
                "action": action.name(),
                "node": ctx.node.to_string(),
            }));
        }
        Ok(report)
    }
}

/// Hands out in-process instance handles and counts their lifecycle.
pub struct LocalBrowserControl {
    created: AtomicU64,
    destroyed: AtomicU64,
    crashes: broadcast::Sender<CrashEvent>,
}

impl LocalBrowserControl {
    pub fn new() -> Arc<Self> {
        let (crashes, _) = broadcast::channel(64);
        Arc::new(Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            crashes,
        })
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Publishes a crash notification for `handle`. Returns false when no
    /// listener is attached.
    pub fn simulate_crash(&self, handle: &InstanceHandle, reason: impl Into<String>) -> bool {
        self.crashes
            .send(CrashEvent {
                environment: handle.environment.clone(),
                instance: handle.id.clone(),
                reason: reason.into(),
            })
            .is_ok()
    }
}

#[async_trait]
impl BrowserControl for LocalBrowserControl {
    async fn create_instance(&self, environment: &EnvironmentConfig) -> Result<InstanceHandle, String> {
        let n = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = InstanceHandle::new(environment.id.clone()).with_endpoint(format!("local://{}/{n}", environment.id));
        debug!(target: "dry_run", environment = %environment.id, instance = %handle.id, "instance created");
        Ok(handle)
    }

    async fn destroy_instance(&self, handle: &InstanceHandle) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(target: "dry_run", environment = %handle.environment, instance = %handle.id, "instance destroyed");
    }

    fn crash_events(&self) -> Option<broadcast::Receiver<CrashEvent>> {
        Some(self.crashes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rpa_core_types::{NodeId, TaskId};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> ActionContext {
        ActionContext {
            task: TaskId::from("t1"),
            node: NodeId::from("n1"),
            instance: InstanceHandle::new("env-a".into()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn outputs_are_placeholders() {
        let executor = DryRunExecutor::new();
        let action = ActionSpec::ExternalCall {
            service: "crm".into(),
            params: serde_json::Value::Null,
            into: Some("reply".into()),
        };
        let report = executor.execute(&action, &Variables::new(), &ctx()).await.unwrap();
        assert_eq!(report.output.unwrap()["action"], "external_call");
        assert_eq!(executor.executed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_stop_on_cancel() {
        let executor = DryRunExecutor::new();
        let ctx = ctx();
        ctx.cancel.cancel();
        let action = ActionSpec::Wait {
            ms: Some(60_000),
            min_ms: None,
            max_ms: None,
        };
        let started = tokio::time::Instant::now();
        let failure = executor.execute(&action, &Variables::new(), &ctx).await.unwrap_err();
        assert!(failure.class.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn control_counts_lifecycle() {
        let control = LocalBrowserControl::new();
        let handle = control.create_instance(&EnvironmentConfig::new("env-a")).await.unwrap();
        assert_eq!(handle.endpoint.as_deref(), Some("local://env-a/1"));
        let mut crashes = control.crash_events().unwrap();
        assert!(control.simulate_crash(&handle, "gone"));
        assert_eq!(crashes.recv().await.unwrap().instance, handle.id);
        control.destroy_instance(&handle).await;
        assert_eq!((control.created(), control.destroyed()), (1, 1));
    }
}
