//! Construction and lifecycle of the shared resource managers.
//!
//! One [`ManagerFactory`] per process: every `create_*` call returns the same
//! shared instance, built on first use from one [`AppConfig`].

use std::sync::{Arc, OnceLock};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use csx_core::memory::{ProcessProbe, UsageProbe};
use csx_core::{AppConfig, CacheManager, CacheStats, Error, MemoryManager, MemoryStats, WorkerPool, WorkerPoolStats};

use crate::fetch::{NetworkConfig, NetworkManager, NetworkStats, Transport};
use crate::pipeline::Extractor;

/// Metrics from every component, keyed by component name.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResourceStats {
    /// `None` when caching is disabled.
    pub cache: Option<CacheStats>,
    pub memory: MemoryStats,
    pub network: NetworkStats,
    pub workers: WorkerPoolStats,
}

pub struct ManagerFactory {
    config: AppConfig,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn UsageProbe>>,
    pool: OnceLock<Arc<WorkerPool>>,
    memory: OnceLock<Arc<MemoryManager>>,
    network: OnceLock<Arc<NetworkManager>>,
    cache: OnceCell<Option<CacheManager>>,
    extractor: OnceCell<Extractor>,
}

impl ManagerFactory {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            transport: None,
            probe: None,
            pool: OnceLock::new(),
            memory: OnceLock::new(),
            network: OnceLock::new(),
            cache: OnceCell::new(),
            extractor: OnceCell::new(),
        }
    }

    /// Use `transport` instead of HTTP for the network manager.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Measure memory with `probe` instead of the process RSS.
    pub fn with_probe(mut self, probe: Arc<dyn UsageProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn create_worker_pool(&self) -> Arc<WorkerPool> {
        self.pool.get_or_init(|| Arc::new(WorkerPool::new(self.config.worker_pool_config()))).clone()
    }

    pub fn create_memory_manager(&self) -> Arc<MemoryManager> {
        self.memory
            .get_or_init(|| {
                let probe = self.probe.clone().unwrap_or_else(|| Arc::new(ProcessProbe::new()));
                Arc::new(MemoryManager::new(self.config.memory_config(), probe, self.create_worker_pool()))
            })
            .clone()
    }

    pub fn create_network_manager(&self) -> Arc<NetworkManager> {
        self.network
            .get_or_init(|| {
                let config = NetworkConfig::from(&self.config);
                let memory = Some(self.create_memory_manager());
                let network = match &self.transport {
                    Some(transport) => NetworkManager::with_transport(config, transport.clone(), memory),
                    None => NetworkManager::new(config, memory),
                };
                Arc::new(network)
            })
            .clone()
    }

    /// The cache, or `None` when caching is disabled.
    ///
    /// Expired entries are purged whenever the memory manager runs cleanup.
    pub async fn create_cache_manager(&self) -> Result<Option<CacheManager>, Error> {
        self.cache
            .get_or_try_init(|| async {
                if !self.config.cache_enabled {
                    tracing::info!("cache disabled by configuration");
                    return Ok::<_, Error>(None);
                }

                let memory = self.create_memory_manager();
                let cache =
                    CacheManager::open(self.config.cache_config(), self.create_worker_pool(), Some(memory.clone())).await?;

                let weak = cache.downgrade();
                memory.register_cleanup("cache.purge_expired", move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(cache) => cache.purge_expired().await.map(|_| ()),
                            None => Ok(()),
                        }
                    }
                });

                Ok(Some(cache))
            })
            .await
            .cloned()
    }

    pub async fn create_extractor(&self) -> Result<Extractor, Error> {
        self.extractor
            .get_or_try_init(|| async {
                let cache = self.create_cache_manager().await?;
                Ok::<_, Error>(Extractor::new(
                    self.create_network_manager(),
                    cache,
                    self.create_memory_manager(),
                    self.create_worker_pool(),
                    self.config.max_files,
                ))
            })
            .await
            .cloned()
    }

    pub async fn get_all_stats(&self) -> Result<ResourceStats, Error> {
        let cache = self.create_cache_manager().await?;
        Ok(ResourceStats {
            cache: cache.map(|c| c.stats()),
            memory: self.create_memory_manager().stats(),
            network: self.create_network_manager().stats(),
            workers: self.create_worker_pool().stats(),
        })
    }

    /// Settle the cache, close idle connections, take a final memory
    /// checkpoint and drain the worker pool. Only components that were
    /// created are touched.
    pub async fn shutdown(&self) {
        if let Some(Some(cache)) = self.cache.get() {
            cache.settle().await;
        }

        if let Some(network) = self.network.get() {
            let closed = network.close_idle();
            tracing::debug!(closed, "closed idle connections");
        }

        if let Some(memory) = self.memory.get() {
            match memory.checkpoint() {
                Ok(sample) => tracing::info!(usage_bytes = sample.usage_bytes, "final memory checkpoint"),
                Err(e) => tracing::warn!(error = %e, "final memory checkpoint failed"),
            }
        }

        if let Some(pool) = self.pool.get() {
            pool.shutdown().await;
        }
    }
}
