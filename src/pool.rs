//! Per-plugin instance pool.
//!
//! A pool owns the authoritative id → instance map plus a small scheduler:
//! an idle deque of ready instances and a queue of blocked acquirers.
//! Returned instances are handed straight to the first live waiter, so a
//! blocked caller never loses a race against the idle queue. Growth is
//! elastic up to the configured ceiling; slots are reserved before spawning
//! so the ceiling holds even while spawns are in flight.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::PluginConfig;
use crate::error::{HostError, Result};
use crate::instance::{InstanceStatus, PluginInstance};
use crate::transport::Transport;

/// How long an acquirer blocks once the pool is at its ceiling.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

struct SchedState {
    idle: VecDeque<Arc<PluginInstance>>,
    waiters: VecDeque<oneshot::Sender<Arc<PluginInstance>>>,
    /// Live instances plus reserved (spawning) slots.
    total: usize,
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub plugin_name: String,
    pub running: bool,
    pub total_instances: usize,
    pub max_instances: usize,
    pub available: usize,
    pub instances: HashMap<String, InstanceStatus>,
}

pub struct PluginPool {
    name: String,
    config: PluginConfig,
    transport: Arc<dyn Transport>,
    instances: DashMap<String, Arc<PluginInstance>>,
    sched: Mutex<SchedState>,
    running: AtomicBool,
}

impl PluginPool {
    pub fn new(name: &str, config: PluginConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.to_string(),
            config,
            transport,
            instances: DashMap::new(),
            sched: Mutex::new(SchedState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                total: 0,
            }),
            running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Create the initial instances sequentially. Individual failures are
    /// logged and skipped; a pool with zero instances fails to start.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(HostError::AlreadyRunning(format!("pool '{}'", self.name)));
        }

        let mut started = 0usize;
        for _ in 0..self.config.pool_size {
            self.sched.lock().await.total += 1;
            match self.create_instance().await {
                Ok(instance) => {
                    self.sched.lock().await.idle.push_back(instance);
                    started += 1;
                }
                Err(e) => {
                    self.sched.lock().await.total -= 1;
                    tracing::warn!(pool = %self.name, error = %e, "failed to start instance");
                }
            }
        }

        if started == 0 {
            return Err(HostError::StartFailed(format!(
                "pool '{}': could not start any instance",
                self.name
            )));
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!(pool = %self.name, instances = started, "pool started");
        Ok(())
    }

    /// Get a ready instance: pop an idle one, grow below the ceiling, or
    /// block until a returned instance is handed over (5 s limit).
    ///
    /// The creator of a fresh instance uses it first; it enters the idle
    /// queue when returned.
    pub async fn acquire(&self) -> Result<Arc<PluginInstance>> {
        if !self.is_running() {
            return Err(HostError::PoolNotRunning(self.name.clone()));
        }

        let waiter = {
            let mut sched = self.sched.lock().await;
            if let Some(instance) = sched.idle.pop_front() {
                return Ok(instance);
            }
            if sched.total < self.config.max_instances {
                sched.total += 1;
                drop(sched);
                return match self.create_instance().await {
                    Ok(instance) => Ok(instance),
                    Err(e) => {
                        self.sched.lock().await.total -= 1;
                        Err(e)
                    }
                };
            }
            let (tx, rx) = oneshot::channel();
            sched.waiters.push_back(tx);
            rx
        };

        match timeout(ACQUIRE_TIMEOUT, waiter).await {
            Ok(Ok(instance)) => Ok(instance),
            // The pool shut down and dropped its waiters.
            Ok(Err(_)) => Err(HostError::PoolNotRunning(self.name.clone())),
            Err(_) => Err(HostError::PoolExhausted),
        }
    }

    /// Put an instance back into circulation. Preference order: first live
    /// waiter, then the idle queue. After shutdown the instance is dropped;
    /// pool stop owns the teardown.
    pub async fn return_instance(&self, instance: Arc<PluginInstance>) {
        if !self.is_running() {
            return;
        }
        if !self.instances.contains_key(instance.id()) {
            return;
        }

        let mut sched = self.sched.lock().await;
        let mut instance = instance;
        while let Some(waiter) = sched.waiters.pop_front() {
            match waiter.send(instance) {
                Ok(()) => return,
                // That acquirer timed out; try the next one.
                Err(returned) => instance = returned,
            }
        }
        sched.idle.push_back(instance);
    }

    /// Acquire, call, return. The return always runs: an instance that
    /// errored goes back into the pool, and the next acquirer discovers a
    /// truly dead one through its own call.
    pub async fn call(&self, function: &str, params: Map<String, Value>) -> Result<Value> {
        let instance = self.acquire().await?;
        let result = instance.call(function, params).await;
        self.return_instance(instance).await;
        result
    }

    async fn create_instance(&self) -> Result<Arc<PluginInstance>> {
        let instance_id = format!("{}{}", self.name, Uuid::new_v4().simple());
        let instance = Arc::new(PluginInstance::new(
            &self.name,
            self.config.clone(),
            instance_id,
            self.transport.clone(),
        ));
        instance.start().await?;
        self.instances
            .insert(instance.id().to_string(), instance.clone());
        tracing::debug!(pool = %self.name, instance = %instance.id(), "instance created");
        Ok(instance)
    }

    /// Stop every instance in parallel and clear the pool. Blocked
    /// acquirers are woken with an error. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        {
            let mut sched = self.sched.lock().await;
            sched.waiters.clear();
            sched.idle.clear();
            sched.total = 0;
        }

        let instances: Vec<Arc<PluginInstance>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        self.instances.clear();

        let stops = instances.iter().map(|instance| instance.stop());
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result {
                tracing::warn!(pool = %self.name, error = %e, "instance stop failed");
            }
        }
        tracing::info!(pool = %self.name, "pool stopped");
    }

    pub async fn status(&self) -> PoolStatus {
        let snapshot: Vec<Arc<PluginInstance>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        let mut instances = HashMap::with_capacity(snapshot.len());
        for instance in snapshot {
            instances.insert(instance.id().to_string(), instance.status().await);
        }
        let available = self.sched.lock().await.idle.len();
        PoolStatus {
            plugin_name: self.name.clone(),
            running: self.is_running(),
            total_instances: self.instances.len(),
            max_instances: self.config.max_instances,
            available,
            instances,
        }
    }

    #[cfg(test)]
    pub(crate) async fn inject_for_test(&self, instance: Arc<PluginInstance>) {
        self.instances
            .insert(instance.id().to_string(), instance.clone());
        let mut sched = self.sched.lock().await;
        sched.total += 1;
        sched.idle.push_back(instance);
        self.running.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginKind;
    use crate::transport::platform_transport;

    fn pool_with_ceiling(max_instances: usize) -> PluginPool {
        let config = PluginConfig {
            kind: PluginKind::Binary,
            path: Some("/nonexistent/worker".into()),
            interpreter: None,
            script_path: None,
            pool_size: 1,
            max_instances,
            functions: vec!["add".into()],
            env: Default::default(),
            args: vec![],
        };
        PluginPool::new("math", config, platform_transport(None))
    }

    fn bare_instance(pool: &PluginPool, id: &str) -> Arc<PluginInstance> {
        Arc::new(PluginInstance::new(
            pool.name(),
            pool.config.clone(),
            id.to_string(),
            pool.transport.clone(),
        ))
    }

    #[tokio::test]
    async fn acquire_pops_idle_first() {
        let pool = pool_with_ceiling(1);
        let instance = bare_instance(&pool, "mathidle");
        pool.inject_for_test(instance.clone()).await;

        let acquired = pool.acquire().await.unwrap();
        assert_eq!(acquired.id(), instance.id());
    }

    #[tokio::test]
    async fn returned_instance_goes_to_blocked_acquirer() {
        let pool = Arc::new(pool_with_ceiling(1));
        let instance = bare_instance(&pool, "mathbusy");
        pool.inject_for_test(instance.clone()).await;

        let held = pool.acquire().await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });

        // Give the waiter time to park before the return.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.return_instance(held).await;

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired.id(), instance.id());
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_times_out_with_pool_exhausted() {
        let pool = pool_with_ceiling(1);
        let instance = bare_instance(&pool, "mathheld");
        pool.inject_for_test(instance).await;

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, HostError::PoolExhausted));
    }

    #[tokio::test]
    async fn acquire_fails_on_stopped_pool() {
        let pool = pool_with_ceiling(1);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, HostError::PoolNotRunning(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_drops_returns() {
        let pool = pool_with_ceiling(1);
        let instance = bare_instance(&pool, "mathstop");
        pool.inject_for_test(instance).await;

        let held = pool.acquire().await.unwrap();
        pool.stop().await;
        pool.stop().await;

        // Returned after shutdown: dropped, not requeued.
        pool.return_instance(held).await;
        assert_eq!(pool.sched.lock().await.idle.len(), 0);
    }

    #[tokio::test]
    async fn stop_wakes_blocked_acquirers() {
        let pool = Arc::new(pool_with_ceiling(1));
        let instance = bare_instance(&pool, "mathwake");
        pool.inject_for_test(instance).await;

        let _held = pool.acquire().await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.stop().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, HostError::PoolNotRunning(_)));
    }
}
