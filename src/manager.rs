//! Plugin registry: one pool per configured plugin.
//!
//! The manager is a thin layer over the pools: it validates configuration,
//! routes calls by plugin name, and supports adding, removing and
//! restarting plugins while the host is live. The full system config is
//! retained so `restart_plugin` can re-consult the original parameters.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{PluginConfig, SystemConfig};
use crate::error::{HostError, Result};
use crate::pool::{PluginPool, PoolStatus};
use crate::transport::{platform_transport, Transport};

/// Aggregate view of the whole host.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub total_plugins: usize,
    pub plugins: HashMap<String, PoolStatus>,
}

pub struct PluginManager {
    config: RwLock<SystemConfig>,
    pools: DashMap<String, Arc<PluginPool>>,
    transport: Arc<dyn Transport>,
    running: AtomicBool,
}

impl PluginManager {
    pub fn new(config: SystemConfig) -> Self {
        let transport = platform_transport(config.socket_dir.as_deref());
        Self {
            config: RwLock::new(config),
            pools: DashMap::new(),
            transport,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate the configuration and start every pool. Plugins that fail
    /// to start are skipped; the manager only fails when none starts.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(HostError::AlreadyRunning("plugin manager".into()));
        }

        let config = self.config.read().await.clone();
        config.validate()?;

        for (name, plugin_config) in &config.plugins {
            let pool = Arc::new(PluginPool::new(
                name,
                plugin_config.clone(),
                self.transport.clone(),
            ));
            match pool.start().await {
                Ok(()) => {
                    self.pools.insert(name.clone(), pool);
                }
                Err(e) => {
                    tracing::error!(plugin = %name, error = %e, "pool failed to start");
                }
            }
        }

        if self.pools.is_empty() {
            return Err(HostError::StartFailed(
                "no plugin pool could be started".into(),
            ));
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!(plugins = self.pools.len(), "plugin manager started");
        Ok(())
    }

    /// Call one function on one plugin. Blocks while the pool is saturated
    /// (bounded) and while the worker computes (bounded).
    pub async fn call(
        &self,
        plugin: &str,
        function: &str,
        params: Map<String, Value>,
    ) -> Result<Value> {
        if !self.is_running() {
            return Err(HostError::NotRunning);
        }
        let pool = self
            .pools
            .get(plugin)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HostError::PluginNotFound(plugin.to_string()))?;
        pool.call(function, params).await
    }

    /// Stop every pool in parallel and clear the registry. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let pools: Vec<Arc<PluginPool>> =
            self.pools.iter().map(|e| e.value().clone()).collect();
        self.pools.clear();

        futures::future::join_all(pools.iter().map(|pool| pool.stop())).await;
        tracing::info!("plugin manager stopped");
    }

    /// Tear the plugin's pool down and rebuild it from the retained config.
    /// In-flight calls on the old pool may fail; calls issued after this
    /// returns land on fresh instances.
    pub async fn restart_plugin(&self, name: &str) -> Result<()> {
        if !self.is_running() {
            return Err(HostError::NotRunning);
        }

        let plugin_config = {
            let config = self.config.read().await;
            config
                .plugins
                .get(name)
                .cloned()
                .ok_or_else(|| HostError::PluginNotFound(name.to_string()))?
        };

        let old_pool = self
            .pools
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))?;
        old_pool.stop().await;

        let new_pool = Arc::new(PluginPool::new(
            name,
            plugin_config,
            self.transport.clone(),
        ));
        new_pool.start().await?;
        self.pools.insert(name.to_string(), new_pool);

        tracing::info!(plugin = %name, "plugin restarted");
        Ok(())
    }

    /// Register and start a new plugin at runtime.
    pub async fn add_plugin(&self, name: &str, plugin_config: PluginConfig) -> Result<()> {
        if !self.is_running() {
            return Err(HostError::NotRunning);
        }
        if self.pools.contains_key(name) {
            return Err(HostError::PluginExists(name.to_string()));
        }
        plugin_config.validate(name)?;

        let pool = Arc::new(PluginPool::new(
            name,
            plugin_config.clone(),
            self.transport.clone(),
        ));
        pool.start().await?;

        self.config
            .write()
            .await
            .plugins
            .insert(name.to_string(), plugin_config);
        self.pools.insert(name.to_string(), pool);

        tracing::info!(plugin = %name, "plugin added");
        Ok(())
    }

    /// Stop and unregister a plugin at runtime.
    pub async fn remove_plugin(&self, name: &str) -> Result<()> {
        if !self.is_running() {
            return Err(HostError::NotRunning);
        }

        let (_, pool) = self
            .pools
            .remove(name)
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))?;
        pool.stop().await;
        self.config.write().await.plugins.remove(name);

        tracing::info!(plugin = %name, "plugin removed");
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Result<PoolStatus> {
        let pool = self
            .pools
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))?;
        Ok(pool.status().await)
    }

    pub async fn all_status(&self) -> ManagerStatus {
        let pools: Vec<Arc<PluginPool>> =
            self.pools.iter().map(|e| e.value().clone()).collect();
        let mut plugins = HashMap::with_capacity(pools.len());
        for pool in pools {
            plugins.insert(pool.name().to_string(), pool.status().await);
        }
        ManagerStatus {
            running: self.is_running(),
            total_plugins: plugins.len(),
            plugins,
        }
    }
}
