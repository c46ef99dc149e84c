//! MCP tool implementations.
//!
//! This module contains all tools exposed by the mcp-css server.

pub mod cache;
pub mod css_batch_extract;
pub mod css_extract;
pub mod resource_stats;

pub use css_batch_extract::{CssBatchExtractParams, batch_extract_impl};
pub use css_extract::{CssExtractParams, extract_impl};
pub use resource_stats::stats_impl;

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

use csx_core::Error;

/// Pretty JSON text content, the shape every tool returns.
pub(crate) fn json_result<T: Serialize>(output: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(output)
        .map_err(|e| Error::InvalidInput(format!("Failed to serialize output: {e}")))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use csx_client::ManagerFactory;
    use csx_core::AppConfig;
    use csx_core::memory::ManualProbe;
    use rmcp::model::CallToolResult;
    use serde::de::DeserializeOwned;
    use tempfile::TempDir;

    pub fn factory(dir: &TempDir) -> Arc<ManagerFactory> {
        let config = AppConfig { cache_dir: dir.path().join("cache"), ..AppConfig::default() };
        Arc::new(ManagerFactory::new(config).with_probe(Arc::new(ManualProbe::new(0))))
    }

    pub fn output<T: DeserializeOwned>(result: &CallToolResult) -> T {
        let content_val = serde_json::to_value(&result.content[0]).unwrap();
        let text = content_val
            .get("text")
            .and_then(|v| v.as_str())
            .expect("Expected text field in content");
        serde_json::from_str(text).unwrap()
    }

    pub fn page(dir: &TempDir, name: &str, css: &str) -> String {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, format!("<html><head><style>{css}</style></head></html>")).unwrap();
        path.display().to_string()
    }
}
