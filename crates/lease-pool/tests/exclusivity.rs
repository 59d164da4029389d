use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rpa_core_types::{EnvironmentId, InstanceHandle, InstanceId, TaskId};
use rpa_lease_pool::{BrowserControl, EnvironmentConfig, LeasePool, PoolConfig};

struct SlowControl;

#[async_trait]
impl BrowserControl for SlowControl {
    async fn create_instance(&self, environment: &EnvironmentConfig) -> Result<InstanceHandle, String> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(InstanceHandle::new(environment.id.clone()))
    }

    async fn destroy_instance(&self, _handle: &InstanceHandle) {}
}

#[derive(Default)]
struct Observed {
    holders: HashMap<EnvironmentId, TaskId>,
    instances: HashSet<InstanceId>,
    violations: Vec<String>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_lease_per_environment_under_random_contention() {
    for seed in 0..4u64 {
        let pool = Arc::new(LeasePool::new(
            Arc::new(SlowControl),
            PoolConfig {
                max_idle_per_environment: 1,
                max_idle_total: 2,
            },
        ));
        let environments: Vec<EnvironmentId> = (0..3)
            .map(|i| EnvironmentId::from(format!("env-{i}")))
            .collect();
        for env in &environments {
            pool.register_environment(EnvironmentConfig::new(env.clone()));
        }

        let observed = Arc::new(Mutex::new(Observed::default()));
        let mut rng = StdRng::seed_from_u64(seed);
        let mut handles = Vec::new();
        for n in 0..24 {
            let env = environments[rng.gen_range(0..environments.len())].clone();
            let hold = Duration::from_micros(rng.gen_range(0..3_000));
            let crash = rng.gen_bool(0.1);
            let pool = pool.clone();
            let observed = observed.clone();
            let task = TaskId::from(format!("seed{seed}-task{n}"));
            handles.push(tokio::spawn(async move {
                let lease = pool
                    .acquire(&env, &task, Duration::from_secs(30))
                    .await
                    .expect("lease");
                {
                    let mut seen = observed.lock();
                    if let Some(other) = seen.holders.insert(env.clone(), task.clone()) {
                        seen.violations.push(format!("{env} held by {other} and {task}"));
                    }
                    if !seen.instances.insert(lease.instance.id.clone()) {
                        seen.violations.push(format!("instance {} shared", lease.instance.id));
                    }
                }
                tokio::time::sleep(hold).await;
                {
                    let mut seen = observed.lock();
                    seen.holders.remove(&env);
                    seen.instances.remove(&lease.instance.id);
                }
                if crash {
                    pool.invalidate(&env).await;
                } else {
                    pool.release(&env, &task).await;
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let seen = observed.lock();
        assert!(seen.violations.is_empty(), "seed {seed}: {:?}", seen.violations);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert!(stats.idle <= 2);
    }
}
