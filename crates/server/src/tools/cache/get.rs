//! cache_get tool implementation.
//!
//! Retrieves a cached extraction by key.

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use csx_client::ManagerFactory;
use csx_core::{CacheEntry, CacheKey, Error};

use super::require_cache;
use crate::tools::json_result;

/// Parameters for the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetParams {
    /// The 64-character hex key reported by css_extract.
    pub key: String,
}

/// Output from the cache_get tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct CacheGetOutput {
    pub entry: CacheEntry,
}

/// Implementation of the cache_get tool.
pub async fn get_impl(factory: &ManagerFactory, params: CacheGetParams) -> Result<CallToolResult, McpError> {
    let key = CacheKey::parse(params.key.trim())?;
    let cache = require_cache(factory).await?;

    let entry = cache.get(&key).await?.ok_or_else(|| Error::CacheMiss(key.to_string()))?;
    json_result(&CacheGetOutput { entry })
}
