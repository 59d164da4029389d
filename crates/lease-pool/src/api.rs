use std::sync::Arc;

use async_trait::async_trait;
use rpa_core_types::{EnvironmentId, InstanceHandle, InstanceId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::EnvironmentConfig;

/// Asynchronous crash or disconnect notification for a live instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrashEvent {
    pub environment: EnvironmentId,
    pub instance: InstanceId,
    #[serde(default)]
    pub reason: String,
}

/// The browser-control product, seen only through instance lifecycle calls.
#[async_trait]
pub trait BrowserControl: Send + Sync {
    async fn create_instance(&self, environment: &EnvironmentConfig) -> Result<InstanceHandle, String>;

    async fn destroy_instance(&self, handle: &InstanceHandle);

    /// Stream of crash notifications, if the collaborator publishes any.
    fn crash_events(&self) -> Option<broadcast::Receiver<CrashEvent>> {
        None
    }
}

#[async_trait]
impl<C> BrowserControl for Arc<C>
where
    C: BrowserControl + ?Sized,
{
    async fn create_instance(&self, environment: &EnvironmentConfig) -> Result<InstanceHandle, String> {
        (**self).create_instance(environment).await
    }

    async fn destroy_instance(&self, handle: &InstanceHandle) {
        (**self).destroy_instance(handle).await
    }

    fn crash_events(&self) -> Option<broadcast::Receiver<CrashEvent>> {
        (**self).crash_events()
    }
}
