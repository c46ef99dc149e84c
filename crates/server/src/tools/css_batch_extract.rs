//! css_batch_extract tool implementation.
//!
//! Extracts many sources concurrently on the worker pool. Local directories
//! are expanded to the HTML files they (and their immediate subdirectories)
//! contain.

use std::path::Path;

use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use csx_client::{ExtractOptions, Extraction, ManagerFactory};
use csx_core::Error;

use super::json_result;

/// Input parameters for css_batch_extract tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CssBatchExtractParams {
    /// URLs, file paths or directories.
    pub sources: Vec<String>,

    #[serde(default)]
    pub minify: bool,

    #[serde(default)]
    pub force_refresh: bool,

    /// Return the first failure as an error instead of a per-source report.
    #[serde(default)]
    pub fail_fast: bool,
}

/// Result for one source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchItem {
    pub source: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<Extraction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output structure for css_batch_extract tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CssBatchExtractOutput {
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BatchItem>,
}

/// Implementation of the css_batch_extract tool.
pub async fn batch_extract_impl(
    factory: &ManagerFactory, params: CssBatchExtractParams,
) -> Result<CallToolResult, McpError> {
    if params.sources.is_empty() {
        return Err(Error::InvalidInput("sources cannot be empty".into()).into());
    }

    let extractor = factory.create_extractor().await?;

    let mut sources = Vec::with_capacity(params.sources.len());
    for source in params.sources {
        let path = Path::new(&source);
        if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
            let files = extractor.scan_dir(path).await?;
            sources.extend(files.iter().map(|p| p.display().to_string()));
        } else {
            sources.push(source);
        }
    }

    let options = ExtractOptions { minify: params.minify, force_refresh: params.force_refresh };
    let outcomes = extractor.extract_many(sources.clone(), options).await;

    let mut results = Vec::with_capacity(outcomes.len());
    for (source, outcome) in sources.into_iter().zip(outcomes) {
        match outcome {
            Ok(extraction) => results.push(BatchItem { source, ok: true, extraction: Some(extraction), error: None }),
            Err(e) if params.fail_fast => return Err(e.into()),
            Err(e) => results.push(BatchItem { source, ok: false, extraction: None, error: Some(e.to_string()) }),
        }
    }

    let succeeded = results.iter().filter(|r| r.ok).count();
    let failed = results.len() - succeeded;
    tracing::debug!(succeeded, failed, "batch extraction finished");

    json_result(&CssBatchExtractOutput { succeeded, failed, results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{factory, output, page};
    use tempfile::TempDir;

    fn params(sources: Vec<String>, fail_fast: bool) -> CssBatchExtractParams {
        CssBatchExtractParams { sources, minify: true, force_refresh: false, fail_fast }
    }

    #[tokio::test]
    async fn test_batch_reports_each_source() {
        let dir = TempDir::new().unwrap();
        let a = page(&dir, "a.html", "a { color: red }");
        let missing = dir.path().join("missing.html").display().to_string();
        let b = page(&dir, "b.html", "b { color: blue }");

        let result = batch_extract_impl(&factory(&dir), params(vec![a, missing, b], false)).await.unwrap();
        let out: CssBatchExtractOutput = output(&result);

        assert_eq!((out.succeeded, out.failed), (2, 1));
        assert_eq!(out.results[0].extraction.as_ref().unwrap().css, "a{color:red}");
        assert!(out.results[1].error.as_ref().unwrap().starts_with("IO_FAILURE"));
        assert_eq!(out.results[2].extraction.as_ref().unwrap().css, "b{color:blue}");
    }

    #[tokio::test]
    async fn test_batch_fail_fast() {
        let dir = TempDir::new().unwrap();
        let a = page(&dir, "a.html", "a{}");
        let missing = dir.path().join("missing.html").display().to_string();

        let err = batch_extract_impl(&factory(&dir), params(vec![a, missing], true)).await.unwrap_err();
        assert!(err.message.starts_with("IO_FAILURE"));
    }

    #[tokio::test]
    async fn test_batch_expands_directories() {
        let dir = TempDir::new().unwrap();
        let site = TempDir::new().unwrap();
        page(&site, "index.html", "i{}");
        page(&site, "docs/guide.htm", "g{}");
        page(&site, "docs/api/deep.html", "d{}");

        let source = site.path().display().to_string();
        let out: CssBatchExtractOutput =
            output(&batch_extract_impl(&factory(&dir), params(vec![source], false)).await.unwrap());

        let css: Vec<_> = out.results.iter().map(|r| r.extraction.as_ref().unwrap().css.as_str()).collect();
        assert_eq!(css, vec!["g{}", "i{}"]);
    }

    #[tokio::test]
    async fn test_batch_empty() {
        let dir = TempDir::new().unwrap();
        assert!(batch_extract_impl(&factory(&dir), params(vec![], false)).await.is_err());
    }
}
