use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rpa_core_types::{EnvironmentId, InstanceHandle, InstanceId, LeaseId, TaskId};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{BrowserControl, CrashEvent};
use crate::errors::LeaseError;
use crate::metrics;
use crate::model::{EnvironmentConfig, Lease, PoolConfig, PoolStats};

struct LeaseEntry {
    id: LeaseId,
    task: TaskId,
    /// `None` while the instance is still being created.
    instance: Option<InstanceHandle>,
    acquired_at: DateTime<Utc>,
    reused: bool,
    crashed: bool,
}

impl LeaseEntry {
    fn lease(&self, environment: &EnvironmentId) -> Option<Lease> {
        self.instance.as_ref().map(|instance| Lease {
            id: self.id.clone(),
            environment: environment.clone(),
            task: self.task.clone(),
            instance: instance.clone(),
            acquired_at: self.acquired_at,
            reused: self.reused,
        })
    }
}

struct IdleInstance {
    handle: InstanceHandle,
    parked: u64,
}

#[derive(Default)]
struct EnvSlot {
    lease: Option<LeaseEntry>,
    idle: Vec<IdleInstance>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<EnvironmentId, EnvSlot>,
    idle_total: usize,
    park_seq: u64,
    created: u64,
    destroyed: u64,
}

impl PoolState {
    fn active(&self) -> usize {
        self.slots.values().filter(|slot| slot.lease.is_some()).count()
    }

    fn publish_gauges(&self) {
        metrics::set_gauges(self.active(), self.idle_total);
    }

    fn evict_oldest_idle(&mut self) -> Option<InstanceHandle> {
        let (environment, index) = self
            .slots
            .iter()
            .flat_map(|(env, slot)| {
                slot.idle
                    .iter()
                    .enumerate()
                    .map(move |(index, idle)| (idle.parked, env, index))
            })
            .min_by_key(|(parked, _, _)| *parked)
            .map(|(_, env, index)| (env.clone(), index))?;
        let slot = self.slots.get_mut(&environment)?;
        let evicted = slot.idle.remove(index);
        self.idle_total = self.idle_total.saturating_sub(1);
        Some(evicted.handle)
    }
}

enum Claim {
    Held(Lease),
    Reserved(LeaseId),
    Busy,
}

/// Clears a pending reservation if instance creation does not complete,
/// including when the acquiring future is dropped mid-creation.
struct Reservation<'a> {
    pool: &'a LeasePool,
    environment: EnvironmentId,
    lease_id: LeaseId,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.clear_reservation(&self.environment, &self.lease_id);
        }
    }
}

/// Grants at most one lease per environment and keeps warm instances around
/// between leases.
pub struct LeasePool {
    control: Arc<dyn BrowserControl>,
    config: PoolConfig,
    environments: DashMap<EnvironmentId, EnvironmentConfig>,
    state: Mutex<PoolState>,
    waiters: DashMap<EnvironmentId, Arc<Notify>>,
}

impl LeasePool {
    pub fn new(control: Arc<dyn BrowserControl>, config: PoolConfig) -> Self {
        Self {
            control,
            config,
            environments: DashMap::new(),
            state: Mutex::new(PoolState::default()),
            waiters: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn register_environment(&self, environment: EnvironmentConfig) -> Option<EnvironmentConfig> {
        debug!(target: "lease_pool", environment = %environment.id, "environment registered");
        self.environments.insert(environment.id.clone(), environment)
    }

    pub fn remove_environment(&self, id: &EnvironmentId) -> Option<EnvironmentConfig> {
        self.environments.remove(id).map(|(_, config)| config)
    }

    pub fn contains(&self, id: &EnvironmentId) -> bool {
        self.environments.contains_key(id)
    }

    pub fn environment(&self, id: &EnvironmentId) -> Option<EnvironmentConfig> {
        self.environments.get(id).map(|entry| entry.value().clone())
    }

    pub fn environments(&self) -> Vec<EnvironmentConfig> {
        let mut list: Vec<_> = self
            .environments
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Fails unless the environment is registered and enabled.
    pub fn check_available(&self, id: &EnvironmentId) -> Result<EnvironmentConfig, LeaseError> {
        let config = self
            .environment(id)
            .ok_or_else(|| LeaseError::UnknownEnvironment(id.clone()))?;
        if !config.enabled {
            return Err(LeaseError::EnvironmentDisabled(id.clone()));
        }
        Ok(config)
    }

    /// Waits until no other task holds `environment`, then binds it to `task`
    /// with a pooled idle instance or a freshly created one.
    ///
    /// Calling again with the task that already holds the lease returns the
    /// existing lease.
    pub async fn acquire(
        &self,
        environment: &EnvironmentId,
        task: &TaskId,
        timeout: Duration,
    ) -> Result<Lease, LeaseError> {
        let config = self.check_available(environment)?;
        let deadline = Instant::now() + timeout;
        let notify = self.waiter(environment);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_claim(environment, task) {
                Claim::Held(lease) => {
                    debug!(
                        target: "lease_pool",
                        environment = %environment,
                        task_id = %task,
                        instance = %lease.instance.id,
                        reused = lease.reused,
                        "lease granted"
                    );
                    return Ok(lease);
                }
                Claim::Reserved(lease_id) => return self.create_for(config, task, lease_id).await,
                Claim::Busy => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(target: "lease_pool", environment = %environment, task_id = %task, "lease wait timed out");
                return Err(LeaseError::LeaseTimeout(environment.clone()));
            }
        }
    }

    fn try_claim(&self, environment: &EnvironmentId, task: &TaskId) -> Claim {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slot = state.slots.entry(environment.clone()).or_default();

        if let Some(entry) = &slot.lease {
            if &entry.task == task {
                if let Some(lease) = entry.lease(environment) {
                    return Claim::Held(lease);
                }
            }
            return Claim::Busy;
        }

        let lease_id = LeaseId::new();
        let reused = slot.idle.pop();
        let claim = match reused {
            Some(idle) => {
                state.idle_total = state.idle_total.saturating_sub(1);
                let entry = LeaseEntry {
                    id: lease_id,
                    task: task.clone(),
                    instance: Some(idle.handle),
                    acquired_at: Utc::now(),
                    reused: true,
                    crashed: false,
                };
                let lease = entry.lease(environment);
                slot.lease = Some(entry);
                match lease {
                    Some(lease) => Claim::Held(lease),
                    None => Claim::Busy,
                }
            }
            None => {
                slot.lease = Some(LeaseEntry {
                    id: lease_id.clone(),
                    task: task.clone(),
                    instance: None,
                    acquired_at: Utc::now(),
                    reused: false,
                    crashed: false,
                });
                Claim::Reserved(lease_id)
            }
        };
        state.publish_gauges();
        claim
    }

    async fn create_for(
        &self,
        config: EnvironmentConfig,
        task: &TaskId,
        lease_id: LeaseId,
    ) -> Result<Lease, LeaseError> {
        let mut reservation = Reservation {
            pool: self,
            environment: config.id.clone(),
            lease_id: lease_id.clone(),
            armed: true,
        };

        let handle = match self.control.create_instance(&config).await {
            Ok(handle) => handle,
            Err(reason) => {
                warn!(
                    target: "lease_pool",
                    environment = %config.id,
                    task_id = %task,
                    "instance creation failed: {reason}"
                );
                drop(reservation);
                return Err(LeaseError::InstanceCreationFailed {
                    environment: config.id,
                    reason,
                });
            }
        };
        metrics::record_created();

        let committed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.created += 1;
            let lease = state.slots.get_mut(&config.id).and_then(|slot| {
                let entry = slot.lease.as_mut()?;
                if entry.id != lease_id || entry.instance.is_some() {
                    return None;
                }
                entry.instance = Some(handle.clone());
                entry.lease(&config.id)
            });
            state.publish_gauges();
            lease
        };
        reservation.armed = false;

        match committed {
            Some(lease) => {
                info!(
                    target: "lease_pool",
                    environment = %config.id,
                    task_id = %task,
                    instance = %lease.instance.id,
                    "instance created for lease"
                );
                Ok(lease)
            }
            None => {
                // The reservation was invalidated while the collaborator was working.
                self.destroy(vec![handle]).await;
                Err(LeaseError::InstanceCreationFailed {
                    environment: config.id,
                    reason: "lease invalidated during instance creation".to_string(),
                })
            }
        }
    }

    fn clear_reservation(&self, environment: &EnvironmentId, lease_id: &LeaseId) {
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(environment) {
                let pending = matches!(
                    &slot.lease,
                    Some(entry) if &entry.id == lease_id && entry.instance.is_none()
                );
                if pending {
                    slot.lease = None;
                }
            }
            state.publish_gauges();
        }
        self.wake(environment);
    }

    /// Ends the lease held by `task`. The instance goes back to the idle pool
    /// unless it was marked crashed. Returns false when `task` held no lease,
    /// e.g. after an `invalidate`.
    pub async fn release(&self, environment: &EnvironmentId, task: &TaskId) -> bool {
        let to_destroy = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(slot) = state.slots.get_mut(environment) else {
                return false;
            };
            let holds = matches!(
                &slot.lease,
                Some(entry) if &entry.task == task && entry.instance.is_some()
            );
            if !holds {
                return false;
            }
            let Some(entry) = slot.lease.take() else {
                return false;
            };

            let mut to_destroy = Vec::new();
            if let Some(instance) = entry.instance {
                if entry.crashed {
                    to_destroy.push(instance);
                } else {
                    state.park_seq += 1;
                    slot.idle.push(IdleInstance {
                        handle: instance,
                        parked: state.park_seq,
                    });
                    state.idle_total += 1;
                    while slot.idle.len() > self.config.max_idle_per_environment {
                        let oldest = slot.idle.remove(0);
                        state.idle_total = state.idle_total.saturating_sub(1);
                        to_destroy.push(oldest.handle);
                    }
                }
            }
            while state.idle_total > self.config.max_idle_total {
                match state.evict_oldest_idle() {
                    Some(handle) => to_destroy.push(handle),
                    None => break,
                }
            }
            state.publish_gauges();
            to_destroy
        };

        debug!(
            target: "lease_pool",
            environment = %environment,
            task_id = %task,
            destroyed = to_destroy.len(),
            "lease released"
        );
        self.destroy(to_destroy).await;
        self.wake(environment);
        true
    }

    /// Tears down the leased and idle instances of `environment` and clears
    /// its lease so the next `acquire` starts fresh.
    pub async fn invalidate(&self, environment: &EnvironmentId) -> usize {
        let handles = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut handles = Vec::new();
            if let Some(slot) = state.slots.get_mut(environment) {
                if let Some(entry) = slot.lease.take() {
                    if let Some(instance) = entry.instance {
                        handles.push(instance);
                    }
                }
                let idle = slot.idle.len();
                handles.extend(slot.idle.drain(..).map(|idle| idle.handle));
                state.idle_total = state.idle_total.saturating_sub(idle);
            }
            state.publish_gauges();
            handles
        };

        let count = handles.len();
        warn!(target: "lease_pool", environment = %environment, destroyed = count, "environment invalidated");
        self.destroy(handles).await;
        self.wake(environment);
        count
    }

    /// Flags an instance as crashed. A leased instance is destroyed on release
    /// instead of being pooled; an idle one is destroyed right away.
    pub async fn mark_crashed(&self, instance: &InstanceId) -> bool {
        let idle_handle = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut found = None;
            for slot in state.slots.values_mut() {
                if let Some(entry) = slot.lease.as_mut() {
                    if entry.instance.as_ref().map(|h| &h.id) == Some(instance) {
                        entry.crashed = true;
                        return true;
                    }
                }
                if let Some(pos) = slot.idle.iter().position(|idle| &idle.handle.id == instance) {
                    found = Some(slot.idle.remove(pos).handle);
                    break;
                }
            }
            if found.is_some() {
                state.idle_total = state.idle_total.saturating_sub(1);
                state.publish_gauges();
            }
            found
        };

        match idle_handle {
            Some(handle) => {
                self.destroy(vec![handle]).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle_crash(&self, event: &CrashEvent) {
        let leased = self
            .lease_of(&event.environment)
            .map(|lease| lease.instance.id == event.instance)
            .unwrap_or(false);
        warn!(
            target: "lease_pool",
            environment = %event.environment,
            instance = %event.instance,
            leased,
            "instance crash reported: {}",
            event.reason
        );
        if leased {
            self.invalidate(&event.environment).await;
        } else {
            self.mark_crashed(&event.instance).await;
        }
    }

    /// Subscribes to the collaborator's crash notifications. Returns `None`
    /// when the collaborator publishes none.
    pub fn spawn_crash_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.control.crash_events()?;
        let pool: Weak<LeasePool> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(pool) = pool.upgrade() else {
                            break;
                        };
                        pool.handle_crash(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "lease_pool", skipped, "crash listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Destroys every idle instance. Active leases are left to their holders.
    pub async fn shutdown(&self) -> usize {
        let handles = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let handles: Vec<_> = state
                .slots
                .values_mut()
                .flat_map(|slot| slot.idle.drain(..).map(|idle| idle.handle).collect::<Vec<_>>())
                .collect();
            state.idle_total = 0;
            state.publish_gauges();
            handles
        };
        let count = handles.len();
        info!(target: "lease_pool", destroyed = count, "lease pool shut down");
        self.destroy(handles).await;
        count
    }

    pub fn lease_of(&self, environment: &EnvironmentId) -> Option<Lease> {
        let state = self.state.lock();
        state
            .slots
            .get(environment)
            .and_then(|slot| slot.lease.as_ref())
            .and_then(|entry| entry.lease(environment))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            environments: self.environments.len(),
            active: state.active(),
            idle: state.idle_total,
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    async fn destroy(&self, handles: Vec<InstanceHandle>) {
        if handles.is_empty() {
            return;
        }
        for handle in &handles {
            self.control.destroy_instance(handle).await;
        }
        self.state.lock().destroyed += handles.len() as u64;
        metrics::record_destroyed(handles.len());
    }

    fn waiter(&self, environment: &EnvironmentId) -> Arc<Notify> {
        self.waiters
            .entry(environment.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, environment: &EnvironmentId) {
        if let Some(notify) = self.waiters.get(environment) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeControl {
        created: AtomicUsize,
        destroyed: parking_lot::Mutex<Vec<InstanceId>>,
        fail: AtomicBool,
        crashes: broadcast::Sender<CrashEvent>,
    }

    impl FakeControl {
        fn new() -> Arc<Self> {
            let (crashes, _) = broadcast::channel(8);
            Arc::new(Self {
                created: AtomicUsize::new(0),
                destroyed: parking_lot::Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                crashes,
            })
        }
    }

    #[async_trait]
    impl BrowserControl for FakeControl {
        async fn create_instance(&self, environment: &EnvironmentConfig) -> Result<InstanceHandle, String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("profile locked".to_string());
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(InstanceHandle::new(environment.id.clone()))
        }

        async fn destroy_instance(&self, handle: &InstanceHandle) {
            self.destroyed.lock().push(handle.id.clone());
        }

        fn crash_events(&self) -> Option<broadcast::Receiver<CrashEvent>> {
            Some(self.crashes.subscribe())
        }
    }

    fn pool_with(control: Arc<FakeControl>, config: PoolConfig) -> Arc<LeasePool> {
        let pool = LeasePool::new(control, config);
        pool.register_environment(EnvironmentConfig::new("env-a"));
        pool.register_environment(EnvironmentConfig::new("env-b"));
        pool.register_environment(EnvironmentConfig::new("env-off").disabled());
        Arc::new(pool)
    }

    fn env(id: &str) -> EnvironmentId {
        EnvironmentId::from(id)
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn released_instance_is_reused() {
        let control = FakeControl::new();
        let pool = pool_with(control.clone(), PoolConfig::default());
        let first = pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap();
        assert!(!first.reused);
        assert!(pool.release(&env("env-a"), &TaskId::from("t1")).await);

        let second = pool.acquire(&env("env-a"), &TaskId::from("t2"), WAIT).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.instance.id, first.instance.id);
        assert_eq!(control.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_is_idempotent_for_holder() {
        let pool = pool_with(FakeControl::new(), PoolConfig::default());
        let task = TaskId::from("t1");
        let first = pool.acquire(&env("env-a"), &task, WAIT).await.unwrap();
        let again = pool.acquire(&env("env-a"), &task, WAIT).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_environment_times_out() {
        let pool = pool_with(FakeControl::new(), PoolConfig::default());
        pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap();
        let err = pool
            .acquire(&env("env-a"), &TaskId::from("t2"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, LeaseError::LeaseTimeout(env("env-a")));
        assert_eq!(err.class(), rpa_core_types::ErrorClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_proceeds_after_release() {
        let pool = pool_with(FakeControl::new(), PoolConfig::default());
        pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&env("env-a"), &TaskId::from("t2"), WAIT).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(&env("env-a"), &TaskId::from("t1")).await;
        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.task, TaskId::from("t2"));
    }

    #[tokio::test]
    async fn creation_failure_leaves_environment_free() {
        let control = FakeControl::new();
        control.fail.store(true, Ordering::SeqCst);
        let pool = pool_with(control.clone(), PoolConfig::default());
        let err = pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap_err();
        assert!(matches!(err, LeaseError::InstanceCreationFailed { .. }));
        assert!(pool.lease_of(&env("env-a")).is_none());
        assert_eq!(pool.stats().active, 0);

        control.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire(&env("env-a"), &TaskId::from("t2"), WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_instance() {
        let control = FakeControl::new();
        let pool = pool_with(control.clone(), PoolConfig::default());
        let first = pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap();
        assert_eq!(pool.invalidate(&env("env-a")).await, 1);
        assert!(!pool.release(&env("env-a"), &TaskId::from("t1")).await);
        assert_eq!(control.destroyed.lock().as_slice(), &[first.instance.id.clone()]);

        let second = pool.acquire(&env("env-a"), &TaskId::from("t2"), WAIT).await.unwrap();
        assert!(!second.reused);
        assert_ne!(second.instance.id, first.instance.id);
    }

    #[tokio::test]
    async fn idle_pool_is_bounded_globally() {
        let control = FakeControl::new();
        let config = PoolConfig {
            max_idle_per_environment: 1,
            max_idle_total: 1,
        };
        let pool = pool_with(control.clone(), config);
        let a = pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap();
        pool.release(&env("env-a"), &TaskId::from("t1")).await;
        pool.acquire(&env("env-b"), &TaskId::from("t2"), WAIT).await.unwrap();
        pool.release(&env("env-b"), &TaskId::from("t2")).await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(control.destroyed.lock().as_slice(), &[a.instance.id]);
    }

    #[tokio::test]
    async fn crashed_instance_is_not_pooled() {
        let control = FakeControl::new();
        let pool = pool_with(control.clone(), PoolConfig::default());
        let lease = pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap();
        assert!(pool.mark_crashed(&lease.instance.id).await);
        assert!(pool.release(&env("env-a"), &TaskId::from("t1")).await);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(control.destroyed.lock().len(), 1);
    }

    #[tokio::test]
    async fn crash_listener_invalidates_lease() {
        let control = FakeControl::new();
        let pool = pool_with(control.clone(), PoolConfig::default());
        let listener = pool.spawn_crash_listener().expect("listener");
        let lease = pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap();

        control
            .crashes
            .send(CrashEvent {
                environment: env("env-a"),
                instance: lease.instance.id.clone(),
                reason: "renderer gone".into(),
            })
            .unwrap();

        for _ in 0..100 {
            if pool.lease_of(&env("env-a")).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pool.lease_of(&env("env-a")).is_none());
        listener.abort();
    }

    #[tokio::test]
    async fn unknown_and_disabled_environments_rejected() {
        let pool = pool_with(FakeControl::new(), PoolConfig::default());
        let task = TaskId::from("t1");
        assert_eq!(
            pool.acquire(&env("nope"), &task, WAIT).await.unwrap_err(),
            LeaseError::UnknownEnvironment(env("nope"))
        );
        assert_eq!(
            pool.acquire(&env("env-off"), &task, WAIT).await.unwrap_err(),
            LeaseError::EnvironmentDisabled(env("env-off"))
        );
    }

    #[tokio::test]
    async fn shutdown_destroys_idle_instances() {
        let pool = pool_with(FakeControl::new(), PoolConfig::default());
        pool.acquire(&env("env-a"), &TaskId::from("t1"), WAIT).await.unwrap();
        pool.release(&env("env-a"), &TaskId::from("t1")).await;
        assert_eq!(pool.shutdown().await, 1);
        assert_eq!(pool.stats().idle, 0);
    }
}
