//! cache_purge tool implementation.
//!
//! Removes one entry, all expired entries, or everything.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use csx_client::ManagerFactory;
use csx_core::{CacheKey, Error};

use super::require_cache;
use crate::tools::json_result;

/// Parameters for the cache_purge tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeParams {
    /// Remove the entry with this key.
    #[serde(default)]
    pub key: Option<String>,

    /// Remove every entry.
    #[serde(default)]
    pub all: bool,

    /// Remove entries whose TTL has elapsed.
    #[serde(default)]
    pub expired: bool,
}

/// Output from the cache_purge tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeOutput {
    /// Number of entries deleted.
    pub deleted: usize,
}

/// Implementation of the cache_purge tool.
pub async fn purge_impl(factory: &ManagerFactory, params: CachePurgeParams) -> Result<CallToolResult, McpError> {
    if params.key.is_none() && !params.all && !params.expired {
        return Err(Error::InvalidInput("At least one of key, all, or expired must be specified".to_string()).into());
    }

    let cache = require_cache(factory).await?;
    let mut deleted = 0;

    if params.all {
        deleted += cache.clear().await?;
    } else {
        if let Some(key) = &params.key {
            let key = CacheKey::parse(key.trim())?;
            deleted += usize::from(cache.invalidate(&key).await?);
        }
        if params.expired {
            deleted += cache.purge_expired().await?;
        }
    }

    tracing::info!(deleted, "cache purged");
    json_result(&CachePurgeOutput { deleted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{factory, output};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_purge_by_key() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let cache = require_cache(&factory).await.unwrap();
        let key = CacheKey::for_content(b"page1", "minify=false");
        cache.put(&key, "a{}").await.unwrap();
        cache.put(&CacheKey::for_content(b"page2", "minify=false"), "b{}").await.unwrap();

        let params = CachePurgeParams { key: Some(key.to_string()), ..Default::default() };
        let out: CachePurgeOutput = output(&purge_impl(&factory, params).await.unwrap());
        assert_eq!(out.deleted, 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_purge_all() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let cache = require_cache(&factory).await.unwrap();
        for n in 0..3u8 {
            cache.put(&CacheKey::for_content(&[n], ""), "x{}").await.unwrap();
        }

        let params = CachePurgeParams { all: true, ..Default::default() };
        let out: CachePurgeOutput = output(&purge_impl(&factory, params).await.unwrap());
        assert_eq!(out.deleted, 3);
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_fresh_entries() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let cache = require_cache(&factory).await.unwrap();
        cache.put(&CacheKey::for_content(b"fresh", ""), "x{}").await.unwrap();

        let params = CachePurgeParams { expired: true, ..Default::default() };
        let out: CachePurgeOutput = output(&purge_impl(&factory, params).await.unwrap());
        assert_eq!(out.deleted, 0);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_purge_no_params() {
        let dir = TempDir::new().unwrap();
        let result = purge_impl(&factory(&dir), CachePurgeParams::default()).await;
        assert!(result.is_err());
    }
}
