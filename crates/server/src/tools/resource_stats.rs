//! resource_stats tool implementation.

use rmcp::{ErrorData as McpError, model::CallToolResult};

use csx_client::ManagerFactory;

use super::json_result;

/// Implementation of the resource_stats tool.
pub async fn stats_impl(factory: &ManagerFactory) -> Result<CallToolResult, McpError> {
    let stats = factory.get_all_stats().await?;
    json_result(&stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{factory, output, page};
    use crate::tools::{CssExtractParams, extract_impl};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stats_after_extraction() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let source = page(&dir, "index.html", "a{}");
        let params = CssExtractParams { source, minify: false, force_refresh: false, output_path: None };
        extract_impl(&factory, params).await.unwrap();

        let stats: serde_json::Value = output(&stats_impl(&factory).await.unwrap());
        assert_eq!(stats["cache"]["entries"], 1);
        assert_eq!(stats["memory"]["checkpoints"], 1);
        assert_eq!(stats["network"]["requests"], 0);
        assert!(stats["workers"]["workers"].as_u64().unwrap() > 0);
    }
}
