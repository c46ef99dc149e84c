//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (CSX_*)
//! 2. TOML config file (if CSX_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::memory::MemoryConfig;
use crate::workers::WorkerPoolConfig;

mod validation;

pub use validation::ConfigError;

/// Decision for hosts that match neither the allow nor the block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

/// What to do when every pooled connection for a host is leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolOverflow {
    /// Wait for a lease to be returned (bounded by the request timeout).
    Queue,
    /// Open a one-off connection that is closed after use.
    Unpooled,
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (CSX_*)
/// 2. TOML config file (if CSX_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding cache artifacts, sidecars and lock files.
    ///
    /// Set via CSX_CACHE_DIR environment variable.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Whether extraction results are cached at all.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Upper bound on the summed size of live cache payloads.
    ///
    /// Set via CSX_CACHE_SIZE_LIMIT_BYTES environment variable.
    #[serde(default = "default_cache_size_limit_bytes")]
    pub cache_size_limit_bytes: u64,

    /// Lifetime of a cache entry.
    ///
    /// Set via CSX_CACHE_TTL_SECONDS environment variable.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// How long cache operations wait for a per-key file lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Usage above which cleanup callbacks run and checks become advisory warnings.
    ///
    /// Set via CSX_MEMORY_SOFT_LIMIT_BYTES environment variable.
    #[serde(default = "default_memory_soft_limit_bytes")]
    pub memory_soft_limit_bytes: u64,

    /// Usage above which large allocations are refused.
    ///
    /// Set via CSX_MEMORY_HARD_LIMIT_BYTES environment variable.
    #[serde(default = "default_memory_hard_limit_bytes")]
    pub memory_hard_limit_bytes: u64,

    /// Number of samples kept in the rolling memory window.
    #[serde(default = "default_memory_window_size")]
    pub memory_window_size: usize,

    /// Consecutive checkpoints above the soft limit before a growing window counts as a leak.
    #[serde(default = "default_leak_consecutive_checkpoints")]
    pub leak_consecutive_checkpoints: usize,

    /// Buffers at least this large must pass a memory check first.
    #[serde(default = "default_large_allocation_bytes")]
    pub large_allocation_bytes: u64,

    /// Per-attempt network timeout.
    ///
    /// Set via CSX_NETWORK_TIMEOUT_SECONDS environment variable.
    #[serde(default = "default_network_timeout_seconds")]
    pub network_timeout_seconds: u64,

    /// Retries for transient network failures.
    ///
    /// Set via CSX_MAX_RETRIES environment variable.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling before jitter.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Token refill rate for outbound requests.
    ///
    /// Set via CSX_RATE_LIMIT_PER_SECOND environment variable.
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: f64,

    /// Token bucket capacity (burst size).
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Maximum bytes buffered per response.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,

    /// Maximum pooled connections per (scheme, host, port).
    #[serde(default = "default_pool_max_per_host")]
    pub pool_max_per_host: usize,

    /// Idle pooled connections older than this are closed.
    #[serde(default = "default_pool_idle_ttl_seconds")]
    pub pool_idle_ttl_seconds: u64,

    /// Behaviour when a host's pool is fully leased.
    #[serde(default = "default_pool_overflow")]
    pub pool_overflow: PoolOverflow,

    /// Domain allowlist for fetch operations.
    ///
    /// Set via CSX_ALLOWED_DOMAINS environment variable.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Domain blocklist for fetch operations; wins over the allowlist.
    ///
    /// Set via CSX_BLOCKED_DOMAINS environment variable.
    #[serde(default)]
    pub blocked_domains: Vec<String>,

    /// Decision for hosts on neither list.
    #[serde(default = "default_domain_policy")]
    pub default_domain_policy: DefaultPolicy,

    /// Verify TLS certificates. Disabling is logged at startup.
    ///
    /// Set via CSX_VERIFY_SSL environment variable.
    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Number of worker tasks.
    ///
    /// Set via CSX_WORKER_COUNT environment variable.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Submissions allowed to wait beyond the busy workers.
    #[serde(default = "default_worker_queue_limit")]
    pub worker_queue_limit: usize,

    /// How long in-flight tasks may run after shutdown starts.
    #[serde(default = "default_worker_shutdown_grace_ms")]
    pub worker_shutdown_grace_ms: u64,

    /// Maximum HTML files picked up from one directory.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./.css_cache")
}

fn default_cache_size_limit_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_cache_ttl_seconds() -> u64 {
    3600
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_memory_soft_limit_bytes() -> u64 {
    768 * 1024 * 1024
}

fn default_memory_hard_limit_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_memory_window_size() -> usize {
    32
}

fn default_leak_consecutive_checkpoints() -> usize {
    8
}

fn default_large_allocation_bytes() -> u64 {
    256 * 1024
}

fn default_network_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_rate_limit_per_second() -> f64 {
    10.0
}

fn default_rate_limit_burst() -> u32 {
    10
}

fn default_max_response_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_pool_max_per_host() -> usize {
    4
}

fn default_pool_idle_ttl_seconds() -> u64 {
    90
}

fn default_pool_overflow() -> PoolOverflow {
    PoolOverflow::Queue
}

fn default_domain_policy() -> DefaultPolicy {
    DefaultPolicy::Allow
}

fn default_user_agent() -> String {
    "css-extract/0.1".into()
}

fn default_worker_count() -> usize {
    4
}

fn default_worker_queue_limit() -> usize {
    64
}

fn default_worker_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_max_files() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_enabled: true,
            cache_size_limit_bytes: default_cache_size_limit_bytes(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            lock_timeout_ms: default_lock_timeout_ms(),
            memory_soft_limit_bytes: default_memory_soft_limit_bytes(),
            memory_hard_limit_bytes: default_memory_hard_limit_bytes(),
            memory_window_size: default_memory_window_size(),
            leak_consecutive_checkpoints: default_leak_consecutive_checkpoints(),
            large_allocation_bytes: default_large_allocation_bytes(),
            network_timeout_seconds: default_network_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            rate_limit_per_second: default_rate_limit_per_second(),
            rate_limit_burst: default_rate_limit_burst(),
            max_response_bytes: default_max_response_bytes(),
            pool_max_per_host: default_pool_max_per_host(),
            pool_idle_ttl_seconds: default_pool_idle_ttl_seconds(),
            pool_overflow: default_pool_overflow(),
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            default_domain_policy: default_domain_policy(),
            verify_ssl: true,
            user_agent: default_user_agent(),
            worker_count: default_worker_count(),
            worker_queue_limit: default_worker_queue_limit(),
            worker_shutdown_grace_ms: default_worker_shutdown_grace_ms(),
            max_files: default_max_files(),
        }
    }
}

impl AppConfig {
    /// Per-attempt network timeout as Duration for use with reqwest/tokio.
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_seconds)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `CSX_`
    /// 2. TOML file from `CSX_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("CSX_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("CSX_")
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Settings for the on-disk cache.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            dir: self.cache_dir.clone(),
            size_limit_bytes: self.cache_size_limit_bytes,
            ttl: Duration::from_secs(self.cache_ttl_seconds),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            large_payload_bytes: self.large_allocation_bytes,
        }
    }

    /// Settings for memory accounting.
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            soft_limit_bytes: self.memory_soft_limit_bytes,
            hard_limit_bytes: self.memory_hard_limit_bytes,
            window_size: self.memory_window_size,
            leak_consecutive: self.leak_consecutive_checkpoints,
        }
    }

    /// Settings for the worker pool.
    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.worker_count,
            queue_limit: self.worker_queue_limit,
            shutdown_grace: Duration::from_millis(self.worker_shutdown_grace_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("./.css_cache"));
        assert_eq!(config.cache_size_limit_bytes, 100 * 1024 * 1024);
        assert_eq!(config.cache_ttl_seconds, 3600);
        assert_eq!(config.network_timeout_seconds, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.rate_limit_per_second, 10.0);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.pool_overflow, PoolOverflow::Queue);
        assert_eq!(config.default_domain_policy, DefaultPolicy::Allow);
        assert!(config.verify_ssl);
        assert!(config.cache_enabled);
        assert!(config.allowed_domains.is_empty());
        assert!(config.blocked_domains.is_empty());
    }

    #[test]
    fn test_network_timeout_duration() {
        let config = AppConfig::default();
        assert_eq!(config.network_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_component_configs() {
        let config = AppConfig { cache_ttl_seconds: 60, worker_count: 2, worker_queue_limit: 5, ..Default::default() };

        let cache = config.cache_config();
        assert_eq!(cache.ttl, Duration::from_secs(60));
        assert_eq!(cache.lock_timeout, Duration::from_millis(5_000));

        let workers = config.worker_pool_config();
        assert_eq!(workers.workers, 2);
        assert_eq!(workers.queue_limit, 5);

        let memory = config.memory_config();
        assert_eq!(memory.window_size, 32);
        assert!(memory.soft_limit_bytes < memory.hard_limit_bytes);
    }

    #[test]
    fn test_policy_enums_deserialize_lowercase() {
        let overflow: PoolOverflow = serde_json::from_str("\"unpooled\"").unwrap();
        assert_eq!(overflow, PoolOverflow::Unpooled);
        let policy: DefaultPolicy = serde_json::from_str("\"deny\"").unwrap();
        assert_eq!(policy, DefaultPolicy::Deny);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("csx.toml");
        std::fs::write(
            &path,
            "cache_ttl_seconds = 120\nblocked_domains = [\"ads.example\"]\npool_overflow = \"unpooled\"\n",
        )
        .unwrap();

        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .extract()
            .unwrap();

        assert_eq!(config.cache_ttl_seconds, 120);
        assert_eq!(config.blocked_domains, vec!["ads.example".to_string()]);
        assert_eq!(config.pool_overflow, PoolOverflow::Unpooled);
        assert_eq!(config.worker_count, 4);
    }
}
