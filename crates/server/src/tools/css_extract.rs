//! css_extract tool implementation.
//!
//! Extracts the CSS of one page, stylesheet URL or local file, going through
//! the cache, and optionally writes it to disk.

use std::path::Path;

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use csx_client::{ExtractOptions, Extraction, ManagerFactory};
use csx_core::Error;

use super::json_result;

/// Input parameters for css_extract tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CssExtractParams {
    /// An http(s) URL or a local file path.
    pub source: String,

    /// Strip comments and redundant whitespace.
    #[serde(default)]
    pub minify: bool,

    /// Force a refresh, bypassing the cache.
    #[serde(default)]
    pub force_refresh: bool,

    /// Also write the CSS to this file.
    #[serde(default)]
    pub output_path: Option<String>,
}

/// Output structure for css_extract tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CssExtractOutput {
    #[serde(flatten)]
    pub extraction: Extraction,
    /// Where the CSS was written, if requested.
    pub output_path: Option<String>,
}

/// Implementation of the css_extract tool.
pub async fn extract_impl(factory: &ManagerFactory, params: CssExtractParams) -> Result<CallToolResult, McpError> {
    if params.source.trim().is_empty() {
        return Err(Error::InvalidInput("source cannot be empty".into()).into());
    }

    let extractor = factory.create_extractor().await?;
    let options = ExtractOptions { minify: params.minify, force_refresh: params.force_refresh };
    let extraction = extractor.extract(&params.source, options).await?;

    if let Some(path) = &params.output_path {
        extractor.write_output(&extraction, Path::new(path)).await?;
    }

    json_result(&CssExtractOutput { extraction, output_path: params.output_path })
}
