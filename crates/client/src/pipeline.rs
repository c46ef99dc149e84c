//! Source → CSS pipeline: fetch or read, parse, minify, cache.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use csx_core::cache::write_atomic;
use csx_core::{CacheKey, CacheManager, Error, MemoryManager, TaskHandle, WorkerPool};

use crate::extract::{CssParser, HtmlStyleParser, count_rules, decode_text, minify};
use crate::fetch::{NetworkManager, NetworkRequest, canonicalize, is_remote};

const HTML_EXTENSIONS: [&str; 2] = ["html", "htm"];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExtractOptions {
    #[serde(default)]
    pub minify: bool,
    /// Skip the cache lookup; the fresh result still replaces the cached one.
    #[serde(default)]
    pub force_refresh: bool,
}

impl ExtractOptions {
    /// Options that change the output, folded into the cache key.
    fn cache_tag(&self) -> String {
        format!("minify={}", self.minify)
    }
}

/// CSS extracted from one source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Extraction {
    pub source: String,
    pub key: String,
    pub css: String,
    /// Top-level rules and at-rule statements in `css`.
    pub rules: usize,
    pub from_cache: bool,
}

/// Extracts CSS from URLs and local files, going through the cache.
#[derive(Clone)]
pub struct Extractor {
    network: Arc<NetworkManager>,
    cache: Option<CacheManager>,
    memory: Arc<MemoryManager>,
    pool: Arc<WorkerPool>,
    parser: Arc<dyn CssParser>,
    max_files: usize,
}

impl Extractor {
    pub fn new(
        network: Arc<NetworkManager>, cache: Option<CacheManager>, memory: Arc<MemoryManager>, pool: Arc<WorkerPool>,
        max_files: usize,
    ) -> Self {
        Self { network, cache, memory, pool, parser: Arc::new(HtmlStyleParser), max_files }
    }

    pub fn with_parser(mut self, parser: Arc<dyn CssParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Extract CSS from a URL or a local file path.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty source or a path that is not a file, any
    /// network error for URLs, `IoFailure`/`TooLarge` for local files, and
    /// `ParseError` for binary input. Cache failures only cost a cache miss.
    pub async fn extract(&self, source: &str, options: ExtractOptions) -> Result<Extraction, Error> {
        let source = source.trim();
        if source.is_empty() {
            return Err(Error::InvalidInput("source cannot be empty".into()));
        }

        let result = if is_remote(source) {
            self.extract_url(source, options).await
        } else {
            self.extract_file(Path::new(source), options).await
        };

        if let Err(e) = self.memory.checkpoint() {
            tracing::warn!(error = %e, "memory checkpoint failed");
        }
        result
    }

    async fn extract_url(&self, source: &str, options: ExtractOptions) -> Result<Extraction, Error> {
        let url = canonicalize(source).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let key = CacheKey::for_url(url.as_str(), &options.cache_tag());

        if !options.force_refresh
            && let Some(css) = self.cached(&key).await
        {
            return Ok(Extraction::new(source, &key, css, true));
        }

        let response = self.network.fetch(NetworkRequest::get(url.as_str())).await?;
        let stylesheet = is_stylesheet(response.content_type.as_deref(), response.url.path());
        let css = self.to_css(&response.body, stylesheet, Some(&response.url), options)?;

        self.store(&key, &css).await;
        Ok(Extraction::new(source, &key, css, false))
    }

    async fn extract_file(&self, path: &Path, options: ExtractOptions) -> Result<Extraction, Error> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| Error::io(format!("stat {}", path.display()), e))?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!("{} is not a file", path.display())));
        }

        let limit = self.network.config().max_response_bytes;
        if metadata.len() > limit {
            return Err(Error::TooLarge(format!("{}: {} bytes exceeds {limit}", path.display(), metadata.len())));
        }

        let bytes = tokio::fs::read(path).await.map_err(|e| Error::io(format!("read {}", path.display()), e))?;
        let source = path.display().to_string();
        let stylesheet = is_stylesheet(None, &source);
        let base = std::path::absolute(path).ok().and_then(|p| Url::from_file_path(p).ok());

        // Pages resolve stylesheet links against their own location.
        let tag = match (&base, stylesheet) {
            (Some(base), false) => format!("{};base={base}", options.cache_tag()),
            _ => options.cache_tag(),
        };
        let key = CacheKey::for_content(&bytes, &tag);

        if !options.force_refresh
            && let Some(css) = self.cached(&key).await
        {
            return Ok(Extraction::new(&source, &key, css, true));
        }

        let css = self.to_css(&bytes, stylesheet, base.as_ref(), options)?;

        self.store(&key, &css).await;
        Ok(Extraction::new(&source, &key, css, false))
    }

    fn to_css(&self, bytes: &[u8], stylesheet: bool, base: Option<&Url>, options: ExtractOptions) -> Result<String, Error> {
        let css = if stylesheet { decode_text(bytes)? } else { self.parser.parse(bytes, base)?.join("\n") };
        Ok(if options.minify { minify(&css) } else { css })
    }

    async fn cached(&self, key: &CacheKey) -> Option<String> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(entry) => entry.map(|e| e.payload),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache lookup failed; treating as a miss");
                None
            }
        }
    }

    async fn store(&self, key: &CacheKey, css: &str) {
        if let Some(cache) = &self.cache
            && let Err(e) = cache.put(key, css).await
        {
            tracing::warn!(key = %key, error = %e, "failed to cache extraction result");
        }
    }

    /// Extract every source on the worker pool. Results are in input order and
    /// fail independently.
    ///
    /// When the pool is saturated, submission waits for this batch's oldest
    /// task before retrying, so batches larger than the pool still complete.
    pub async fn extract_many(&self, sources: Vec<String>, options: ExtractOptions) -> Vec<Result<Extraction, Error>> {
        let mut results: Vec<Option<Result<Extraction, Error>>> = (0..sources.len()).map(|_| None).collect();
        let mut outstanding: VecDeque<(usize, TaskHandle<Extraction>)> = VecDeque::new();

        for (i, source) in sources.into_iter().enumerate() {
            loop {
                let this = self.clone();
                let task_source = source.clone();
                match self.pool.submit(async move { this.extract(&task_source, options).await }) {
                    Ok(handle) => {
                        outstanding.push_back((i, handle));
                        break;
                    }
                    Err(Error::PoolSaturated { .. }) => match outstanding.pop_front() {
                        Some((j, handle)) => results[j] = Some(handle.join().await),
                        None => tokio::time::sleep(Duration::from_millis(10)).await,
                    },
                    Err(e) => {
                        results[i] = Some(Err(e));
                        break;
                    }
                }
            }
        }

        for (j, handle) in outstanding {
            results[j] = Some(handle.join().await);
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::Cancelled("extraction was never scheduled".into()))))
            .collect()
    }

    /// Extract every HTML file found by [`scan_dir`](Self::scan_dir).
    pub async fn extract_dir(
        &self, dir: &Path, options: ExtractOptions,
    ) -> Result<Vec<(PathBuf, Result<Extraction, Error>)>, Error> {
        let files = self.scan_dir(dir).await?;
        let sources = files.iter().map(|p| p.display().to_string()).collect();
        let results = self.extract_many(sources, options).await;
        Ok(files.into_iter().zip(results).collect())
    }

    /// HTML files in `dir` and its immediate subdirectories, sorted, at most `max_files`.
    pub async fn scan_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, Error> {
        let mut subdirs = subdirectories(dir).await?;
        let mut files = html_files(dir).await?;
        subdirs.sort();
        for sub in subdirs {
            files.extend(html_files(&sub).await?);
        }
        files.sort();

        if files.len() > self.max_files {
            tracing::warn!(dir = %dir.display(), found = files.len(), max_files = self.max_files, "too many files; truncating");
            files.truncate(self.max_files);
        }
        Ok(files)
    }

    /// Write the extracted CSS to `path` atomically, creating parent directories.
    pub async fn write_output(&self, extraction: &Extraction, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }
        write_atomic(path, extraction.css.as_bytes()).await?;
        tracing::debug!(path = %path.display(), bytes = extraction.css.len(), "wrote extraction output");
        Ok(())
    }
}

impl Extraction {
    fn new(source: &str, key: &CacheKey, css: String, from_cache: bool) -> Self {
        Self { source: source.to_string(), key: key.to_string(), rules: count_rules(&css), css, from_cache }
    }
}

/// Treat the body as CSS itself rather than HTML.
fn is_stylesheet(content_type: Option<&str>, name: &str) -> bool {
    match content_type {
        Some(ct) => ct.split(';').next().unwrap_or_default().trim().eq_ignore_ascii_case("text/css"),
        None => Path::new(name).extension().is_some_and(|ext| ext.eq_ignore_ascii_case("css")),
    }
}

async fn read_dir(dir: &Path) -> Result<Vec<(PathBuf, std::fs::FileType)>, Error> {
    let mut reader = tokio::fs::read_dir(dir).await.map_err(|e| Error::io(format!("read {}", dir.display()), e))?;
    let mut items = Vec::new();
    while let Some(item) = reader.next_entry().await.map_err(|e| Error::io(format!("read {}", dir.display()), e))? {
        let file_type = item.file_type().await.map_err(|e| Error::io(format!("stat {}", item.path().display()), e))?;
        items.push((item.path(), file_type));
    }
    Ok(items)
}

async fn html_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    Ok(read_dir(dir)
        .await?
        .into_iter()
        .filter(|(path, file_type)| {
            file_type.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| HTML_EXTENSIONS.iter().any(|h| ext.eq_ignore_ascii_case(h)))
        })
        .map(|(path, _)| path)
        .collect())
}

async fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    if !tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
        return Err(Error::InvalidInput(format!("{} is not a directory", dir.display())));
    }
    Ok(read_dir(dir).await?.into_iter().filter(|(_, t)| t.is_dir()).map(|(path, _)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::NetworkConfig;
    use crate::testing::{FakeTransport, Reply};
    use csx_core::AppConfig;
    use csx_core::memory::{ManualProbe, MemoryConfig};
    use csx_core::workers::WorkerPoolConfig;
    use tempfile::TempDir;

    const PAGE: &str = "<html><head><style>body {  margin: 0; }</style></head><body><style>p { color : red }</style></body></html>";

    struct Harness {
        fake: FakeTransport,
        extractor: Extractor,
        _dir: TempDir,
    }

    async fn harness(workers: usize, queue_limit: usize, max_files: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let pool_config = WorkerPoolConfig { workers, queue_limit, ..WorkerPoolConfig::default() };
        let pool = Arc::new(WorkerPool::new(pool_config));
        let memory = Arc::new(MemoryManager::new(MemoryConfig::default(), Arc::new(ManualProbe::new(0)), pool.clone()));

        let app = AppConfig { cache_dir: dir.path().join("cache"), ..AppConfig::default() };
        let cache = CacheManager::open(app.cache_config(), pool.clone(), Some(memory.clone())).await.unwrap();

        let fake = FakeTransport::new();
        let network = NetworkConfig { retry_base_delay: Duration::from_millis(1), ..NetworkConfig::from(&app) };
        let network = Arc::new(NetworkManager::with_transport(network, Arc::new(fake.clone()), Some(memory.clone())));

        let extractor = Extractor::new(network, Some(cache), memory, pool, max_files);
        Harness { fake, extractor, _dir: dir }
    }

    fn options(minify: bool) -> ExtractOptions {
        ExtractOptions { minify, force_refresh: false }
    }

    #[tokio::test]
    async fn test_url_extraction_is_cached() {
        let h = harness(2, 8, 100).await;
        h.fake.reply("https://example.com/", Reply::html(PAGE));

        let first = h.extractor.extract("https://example.com", options(false)).await.unwrap();
        let second = h.extractor.extract("https://EXAMPLE.com/#top", options(false)).await.unwrap();

        assert_eq!(first.css, "body {  margin: 0; }\np { color : red }");
        assert_eq!(first.rules, 2);
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.css, second.css);
        assert_eq!(first.key, second.key);
        assert_eq!(h.fake.sends(), 1);
    }

    #[tokio::test]
    async fn test_minify_uses_its_own_key() {
        let h = harness(2, 8, 100).await;
        h.fake.reply("https://example.com/", Reply::html(PAGE));

        let plain = h.extractor.extract("https://example.com/", options(false)).await.unwrap();
        let minified = h.extractor.extract("https://example.com/", options(true)).await.unwrap();

        assert_ne!(plain.key, minified.key);
        assert_eq!(minified.css, "body{margin:0}p{color :red}");
        assert_eq!(h.fake.sends(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let h = harness(2, 8, 100).await;
        let url = "https://example.com/site.css";
        h.fake.reply(url, Reply::ok(200, "a { color: red }"));
        h.fake.reply(url, Reply::ok(200, "a { color: blue }"));

        h.extractor.extract(url, options(false)).await.unwrap();
        let refreshed = h.extractor.extract(url, ExtractOptions { minify: false, force_refresh: true }).await.unwrap();
        assert_eq!(refreshed.css, "a { color: blue }");
        assert!(!refreshed.from_cache);

        let cached = h.extractor.extract(url, options(false)).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.css, "a { color: blue }");
    }

    #[tokio::test]
    async fn test_stylesheet_response_used_verbatim() {
        let h = harness(2, 8, 100).await;
        h.fake.reply("https://cdn.test/app.css", Reply::ok(200, "<b>{}</b>"));

        let result = h.extractor.extract("https://cdn.test/app.css", options(false)).await.unwrap();
        assert_eq!(result.css, "<b>{}</b>");
    }

    #[tokio::test]
    async fn test_local_file_cached_by_content() {
        let h = harness(2, 8, 100).await;
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("index.html");
        std::fs::write(&page, PAGE).unwrap();

        let first = h.extractor.extract(page.to_str().unwrap(), options(false)).await.unwrap();
        let second = h.extractor.extract(page.to_str().unwrap(), options(false)).await.unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.key, second.key);

        std::fs::write(&page, PAGE.replace("red", "blue")).unwrap();
        let edited = h.extractor.extract(page.to_str().unwrap(), options(false)).await.unwrap();
        assert!(!edited.from_cache);
        assert_ne!(edited.key, first.key);
        assert_eq!(h.fake.sends(), 0);
    }

    #[tokio::test]
    async fn test_identical_pages_resolve_links_against_their_own_location() {
        let h = harness(2, 8, 100).await;
        let dir = TempDir::new().unwrap();
        let html = r#"<html><head><link rel="stylesheet" href="site.css"></head></html>"#;
        for name in ["a", "b"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join("index.html"), html).unwrap();
        }

        let a = h.extractor.extract(dir.path().join("a/index.html").to_str().unwrap(), options(false)).await.unwrap();
        let b = h.extractor.extract(dir.path().join("b/index.html").to_str().unwrap(), options(false)).await.unwrap();

        assert_ne!(a.key, b.key);
        assert!(!b.from_cache);
        assert!(a.css.contains("/a/site.css"), "{}", a.css);
        assert!(b.css.contains("/b/site.css"), "{}", b.css);
    }

    #[tokio::test]
    async fn test_identical_stylesheet_files_share_a_key() {
        let h = harness(2, 8, 100).await;
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("one.css"), "a{}").unwrap();
        std::fs::write(dir.path().join("two.css"), "a{}").unwrap();

        let one = h.extractor.extract(dir.path().join("one.css").to_str().unwrap(), options(false)).await.unwrap();
        let two = h.extractor.extract(dir.path().join("two.css").to_str().unwrap(), options(false)).await.unwrap();

        assert_eq!(one.key, CacheKey::for_content(b"a{}", "minify=false").to_string());
        assert!(two.from_cache);
        assert_eq!(two.css, "a{}");
    }

    #[tokio::test]
    async fn test_bad_sources() {
        let h = harness(2, 8, 100).await;
        assert!(matches!(h.extractor.extract("  ", options(false)).await, Err(Error::InvalidInput(_))));
        assert!(matches!(h.extractor.extract("/no/such/file.html", options(false)).await, Err(Error::IoFailure(_))));

        let dir = TempDir::new().unwrap();
        let result = h.extractor.extract(dir.path().to_str().unwrap(), options(false)).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_extract_many_keeps_order_when_saturated() {
        let h = harness(1, 1, 100).await;
        let sources: Vec<String> = (0..6).map(|i| format!("https://example.com/{i}.css")).collect();
        for (i, url) in sources.iter().enumerate() {
            if i != 3 {
                h.fake.reply(url, Reply::ok(200, format!("a{i}{{}}")));
            }
        }

        let results = h.extractor.extract_many(sources, options(false)).await;
        assert_eq!(results.len(), 6);
        for (i, result) in results.iter().enumerate() {
            if i == 3 {
                assert!(matches!(result, Err(Error::HttpStatus { status: 404, .. })));
            } else {
                assert_eq!(result.as_ref().unwrap().css, format!("a{i}{{}}"));
            }
        }
    }

    #[tokio::test]
    async fn test_extract_dir_scans_one_level() {
        let h = harness(2, 8, 1).await;
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("b.HTML"), PAGE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("sub/a.htm"), PAGE).unwrap();
        std::fs::write(dir.path().join("sub/deeper/c.html"), PAGE).unwrap();

        let results = h.extractor.extract_dir(dir.path(), options(true)).await.unwrap();
        let names: Vec<_> = results.iter().map(|(p, _)| p.strip_prefix(dir.path()).unwrap().to_path_buf()).collect();
        assert_eq!(names, vec![PathBuf::from("b.HTML")]);

        let h = harness(2, 8, 10).await;
        let results = h.extractor.extract_dir(dir.path(), options(true)).await.unwrap();
        let names: Vec<_> = results.iter().map(|(p, _)| p.strip_prefix(dir.path()).unwrap().to_path_buf()).collect();
        assert_eq!(names, vec![PathBuf::from("b.HTML"), PathBuf::from("sub/a.htm")]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(matches!(
            h.extractor.extract_dir(&dir.path().join("notes.txt"), options(true)).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_write_output_creates_parents() {
        let h = harness(2, 8, 100).await;
        let dir = TempDir::new().unwrap();
        let extraction = Extraction::new("inline", &CacheKey::for_content(b"x", ""), "a{}".into(), false);
        let path = dir.path().join("out/nested/site.css");

        h.extractor.write_output(&extraction, &path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a{}");
    }
}
