//! Cache-related MCP tools.
//!
//! This module provides tools for inspecting and purging the extraction cache.

pub mod get;
pub mod purge;

pub use get::{CacheGetParams, get_impl};
pub use purge::{CachePurgeParams, purge_impl};

use csx_client::ManagerFactory;
use csx_core::{CacheManager, Error};

/// The shared cache, or `InvalidInput` when caching is disabled.
pub(crate) async fn require_cache(factory: &ManagerFactory) -> Result<CacheManager, Error> {
    factory
        .create_cache_manager()
        .await?
        .ok_or_else(|| Error::InvalidInput("cache is disabled (cache_enabled = false)".into()))
}
