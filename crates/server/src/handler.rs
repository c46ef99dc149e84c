//! MCP server handler implementation.
//!
//! This module defines the main server handler that
//! routes tool calls to the appropriate implementations.
use std::sync::Arc;

use crate::tools::{
    CssBatchExtractParams, CssExtractParams, batch_extract_impl,
    cache::{CacheGetParams, CachePurgeParams, get_impl, purge_impl},
    extract_impl, stats_impl,
};

use csx_client::ManagerFactory;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};

/// The main MCP server handler for mcp-css.
#[derive(Clone)]
pub struct CssExtractServer {
    factory: Arc<ManagerFactory>,
    tool_router: ToolRouter<Self>,
}

/// Tool router implementation using the #[tool_router] macro.
///
/// This macro generates the routing logic that maps tool names to handler methods.
#[tool_router]
impl CssExtractServer {
    /// Create a new server handler backed by the shared managers.
    pub fn new(factory: Arc<ManagerFactory>) -> Self {
        Self { factory, tool_router: Self::tool_router() }
    }

    /// Extract CSS from one source.
    ///
    /// Pages contribute their `<style>` blocks and stylesheet links; stylesheet
    /// URLs and `.css` files are returned as-is. Results are cached by content.
    #[tool(
        description = "Extract CSS from a URL or local file. Returns the CSS, its rule count and cache key. Optionally minifies and writes it to output_path."
    )]
    async fn css_extract(&self, params: Parameters<CssExtractParams>) -> Result<CallToolResult, McpError> {
        extract_impl(&self.factory, params.0).await
    }

    /// Extract CSS from many sources on the worker pool.
    #[tool(
        description = "Extract CSS from several URLs, files or directories concurrently. Reports a result per source unless fail_fast is set."
    )]
    async fn css_batch_extract(&self, params: Parameters<CssBatchExtractParams>) -> Result<CallToolResult, McpError> {
        batch_extract_impl(&self.factory, params.0).await
    }

    /// Retrieve a cached extraction by key.
    #[tool(description = "Retrieve a cached extraction by its key. Returns CACHE_MISS if absent or expired.")]
    async fn cache_get(&self, params: Parameters<CacheGetParams>) -> Result<CallToolResult, McpError> {
        get_impl(&self.factory, params.0).await
    }

    /// Remove cache entries.
    #[tool(description = "Purge cache entries by key, all expired entries, or everything. Returns the number deleted.")]
    async fn cache_purge(&self, params: Parameters<CachePurgeParams>) -> Result<CallToolResult, McpError> {
        purge_impl(&self.factory, params.0).await
    }

    /// Report cache, memory, network and worker statistics.
    #[tool(description = "Report statistics for the cache, memory, network and worker pool managers.")]
    async fn resource_stats(&self) -> Result<CallToolResult, McpError> {
        stats_impl(&self.factory).await
    }
}

impl ServerHandler for CssExtractServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "mcp-css".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
