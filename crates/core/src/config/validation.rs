//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `cache_size_limit_bytes` or `cache_ttl_seconds` is 0
    /// - the soft memory limit is not below the hard limit
    /// - `network_timeout_seconds` is 0 or exceeds 5 minutes
    /// - `rate_limit_per_second` is not a positive number, or the burst is 0
    /// - `worker_count`, `pool_max_per_host` or `memory_window_size` is 0
    /// - `max_response_bytes` is 0 or exceeds 100MB
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size_limit_bytes == 0 {
            return Err(invalid("cache_size_limit_bytes", "must be greater than 0"));
        }
        if self.cache_ttl_seconds == 0 {
            return Err(invalid("cache_ttl_seconds", "must be greater than 0"));
        }

        if self.memory_soft_limit_bytes == 0 {
            return Err(invalid("memory_soft_limit_bytes", "must be greater than 0"));
        }
        if self.memory_soft_limit_bytes >= self.memory_hard_limit_bytes {
            return Err(invalid("memory_soft_limit_bytes", "must be below memory_hard_limit_bytes"));
        }
        if self.memory_window_size < 2 {
            return Err(invalid("memory_window_size", "must be at least 2"));
        }

        if self.network_timeout_seconds == 0 {
            return Err(invalid("network_timeout_seconds", "must be greater than 0"));
        }
        if self.network_timeout_seconds > 300 {
            return Err(invalid("network_timeout_seconds", "must not exceed 5 minutes (300s)"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(invalid("retry_base_delay_ms", "must not exceed retry_max_delay_ms"));
        }

        if !self.rate_limit_per_second.is_finite() || self.rate_limit_per_second <= 0.0 {
            return Err(invalid("rate_limit_per_second", "must be a positive number"));
        }
        if self.rate_limit_burst == 0 {
            return Err(invalid("rate_limit_burst", "must be greater than 0"));
        }

        if self.max_response_bytes == 0 {
            return Err(invalid("max_response_bytes", "must be greater than 0"));
        }
        if self.max_response_bytes > 100 * 1024 * 1024 {
            return Err(invalid("max_response_bytes", "must not exceed 100MB"));
        }

        if self.pool_max_per_host == 0 {
            return Err(invalid("pool_max_per_host", "must be greater than 0"));
        }
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "must be greater than 0"));
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        if !self.verify_ssl {
            tracing::warn!("verify_ssl is disabled; TLS certificates will not be checked");
        }

        let overlap: Vec<&String> = self.blocked_domains.iter().filter(|d| self.allowed_domains.contains(d)).collect();
        if !overlap.is_empty() {
            tracing::warn!(
                domains = ?overlap,
                "Domains listed in both allowed_domains and blocked_domains; \
                 blocked_domains takes precedence"
            );
        }

        Ok(())
    }
}
