//! Size- and time-bounded persistent cache.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::Error;
use crate::cache::entry::{CacheEntry, EntryMeta, is_expired};
use crate::cache::key::sha256_hex;
use crate::cache::store::{self, Inspection, Layout, META_SUFFIX, PAYLOAD_SUFFIX, TEMP_SUFFIX, TRASH_PREFIX};
use crate::cache::{CacheConfig, CacheKey, LockMode};
use crate::memory::MemoryManager;
use crate::workers::WorkerPool;

/// Leftover temp files and half-written entries younger than this may belong
/// to a writer in another process and are left alone by `open`.
const STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub size_limit_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub writes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corrupt_entries: u64,
    pub errors: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    size_bytes: u64,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    ttl_seconds: u64,
    version: u64,
}

impl From<&EntryMeta> for IndexEntry {
    fn from(meta: &EntryMeta) -> Self {
        Self {
            size_bytes: meta.size_bytes,
            created_at: meta.created_at,
            last_accessed_at: meta.last_accessed_at,
            ttl_seconds: meta.ttl_seconds,
            version: meta.version,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    corrupt: AtomicU64,
    errors: AtomicU64,
}

/// Entries removed by a background task must still be in the state that
/// justified scheduling the removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// Eviction: remove whatever is there.
    Unconditional,
    /// Expiry or corruption: keep the entry if a writer has since replaced it.
    UnlessValid,
}

struct CacheInner {
    config: CacheConfig,
    layout: Layout,
    /// In-memory view of live entries. `total_bytes` only changes while this is write-locked.
    index: RwLock<HashMap<CacheKey, IndexEntry>>,
    total_bytes: AtomicU64,
    /// `get`/`put`/removals hold the read side; `clear` holds the write side.
    clear_gate: tokio::sync::RwLock<()>,
    /// True while an eviction task is scheduled or running.
    evicting: watch::Sender<bool>,
    memory: Option<Arc<MemoryManager>>,
    counters: Counters,
}

/// Thread- and process-safe persistent key → CSS store.
///
/// Every per-key operation runs under that key's [`FileLock`](crate::cache::FileLock):
/// readers share, writers exclude. The summed payload size is brought back
/// under the limit by a background eviction task scheduled after each write,
/// so the bound holds once [`CacheManager::settle`] returns.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
    pool: Arc<WorkerPool>,
}

/// Non-owning counterpart of [`CacheManager`].
#[derive(Clone)]
pub struct WeakCacheManager {
    inner: Weak<CacheInner>,
    pool: Weak<WorkerPool>,
}

impl WeakCacheManager {
    pub fn upgrade(&self) -> Option<CacheManager> {
        Some(CacheManager { inner: self.inner.upgrade()?, pool: self.pool.upgrade()? })
    }
}

impl CacheManager {
    /// Open (or create) the cache directory and rebuild the index from sidecars.
    ///
    /// Stale temp files, half-written entries and directories left behind by an
    /// interrupted `clear` are removed. Eviction is scheduled if the directory is
    /// already over the limit.
    pub async fn open(config: CacheConfig, pool: Arc<WorkerPool>, memory: Option<Arc<MemoryManager>>) -> Result<Self, Error> {
        let layout = Layout::new(&config.dir);
        layout.create_dirs().await?;

        let (evicting, _) = watch::channel(false);
        let inner = Arc::new(CacheInner {
            config,
            layout,
            index: RwLock::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            clear_gate: tokio::sync::RwLock::new(()),
            evicting,
            memory,
            counters: Counters::default(),
        });
        let manager = Self { inner, pool };

        let (entries, total) = manager.rebuild_index().await?;
        tracing::debug!(
            dir = %manager.inner.config.dir.display(),
            entries,
            total_bytes = total,
            "cache opened"
        );

        manager.remove_trash().await?;
        manager.schedule_eviction();
        Ok(manager)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Handle that does not keep the cache alive, for callbacks registered
    /// with components the cache itself holds.
    pub fn downgrade(&self) -> WeakCacheManager {
        WeakCacheManager { inner: Arc::downgrade(&self.inner), pool: Arc::downgrade(&self.pool) }
    }

    /// Look up `key`. Expired and corrupt entries are misses and are removed in
    /// the background.
    ///
    /// # Errors
    ///
    /// `LockTimeout` if a writer holds the key for longer than the lock timeout,
    /// `IoFailure` if the entry files cannot be read.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, Error> {
        let inner = &self.inner;
        let _gate = inner.clear_gate.read().await;
        let _lock = inner.layout.lock(key).acquire(LockMode::Shared, inner.config.lock_timeout).await?;

        let now = Utc::now();
        let inspection = store::inspect(&inner.layout, key, now).await.inspect_err(|_| {
            inner.counters.errors.fetch_add(1, Ordering::Relaxed);
        })?;

        match inspection {
            Inspection::Valid(meta, payload) => {
                inner.touch(key, &meta, now);
                inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, size_bytes = meta.size_bytes, "cache hit");
                Ok(Some(meta.into_entry(payload, now)))
            }
            Inspection::Missing => {
                inner.forget(key);
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Inspection::Expired(meta) => {
                inner.counters.expirations.fetch_add(1, Ordering::Relaxed);
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, created_at = %meta.created_at, ttl_seconds = meta.ttl_seconds, "cache entry expired");
                self.schedule_removal(key.clone(), "expired entry");
                Ok(None)
            }
            Inspection::Corrupt(reason) => {
                inner.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, reason = %reason, "corrupt cache entry treated as miss");
                self.schedule_removal(key.clone(), "corrupt entry");
                Ok(None)
            }
        }
    }

    /// Store `payload` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// - `CapacityExceeded` if the payload alone is larger than the cache limit
    /// - `MemoryLimitExceeded` if a large payload is refused by the memory manager
    /// - `LockTimeout` if the key stays locked for longer than the lock timeout
    /// - `IoFailure` if the payload or sidecar cannot be written
    pub async fn put(&self, key: &CacheKey, payload: &str) -> Result<CacheEntry, Error> {
        let inner = &self.inner;
        let size_bytes = payload.len() as u64;

        if size_bytes > inner.config.size_limit_bytes {
            return Err(Error::CapacityExceeded { size: size_bytes, limit: inner.config.size_limit_bytes });
        }
        if size_bytes >= inner.config.large_payload_bytes
            && let Some(memory) = &inner.memory
        {
            memory.check_limit(size_bytes)?;
        }

        let entry = {
            let _gate = inner.clear_gate.read().await;
            let _lock = inner.layout.lock(key).acquire(LockMode::Exclusive, inner.config.lock_timeout).await?;

            let previous_version = match store::read_meta(&inner.layout, key).await {
                Some(meta) => meta.version,
                None => inner.index_version(key),
            };

            let now = Utc::now();
            let meta = EntryMeta {
                key: key.to_string(),
                size_bytes,
                checksum: sha256_hex(payload.as_bytes()),
                created_at: now,
                last_accessed_at: now,
                ttl_seconds: inner.config.ttl.as_secs(),
                version: previous_version + 1,
            };

            inner.write_entry(key, payload, &meta).await.inspect_err(|e| {
                inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "cache write failed");
            })?;

            inner.insert(key, IndexEntry::from(&meta));
            inner.counters.writes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, size_bytes, version = meta.version, "cache entry stored");
            meta.into_entry(payload.to_string(), now)
        };

        self.schedule_eviction();
        Ok(entry)
    }

    /// Remove `key`. Returns whether an entry was present.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, Error> {
        let removed = self.inner.remove(key, Removal::Unconditional).await?;
        if removed {
            tracing::debug!(key = %key, "cache entry invalidated");
        }
        Ok(removed)
    }

    /// Drop every entry at once.
    ///
    /// The entry directory is renamed aside and replaced with an empty one, so
    /// concurrent readers see either the old contents or none. The detached
    /// directory is deleted in the background. Returns the number of entries
    /// that were indexed.
    pub async fn clear(&self) -> Result<usize, Error> {
        let inner = &self.inner;
        let _gate = inner.clear_gate.write().await;

        let trash = inner.layout.trash_path();
        let detached = match tokio::fs::rename(&inner.layout.entries, &trash).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(Error::io(format!("detach {}", inner.layout.entries.display()), e));
            }
        };
        inner.layout.create_dirs().await?;

        let removed = {
            let mut index = inner.index.write().unwrap_or_else(|e| e.into_inner());
            let removed = index.len();
            index.clear();
            inner.total_bytes.store(0, Ordering::Release);
            removed
        };

        if detached {
            self.spawn_background("delete cleared entries", move || {
                let trash = trash.clone();
                async move {
                    tokio::fs::remove_dir_all(&trash)
                        .await
                        .map_err(|e| Error::io(format!("remove {}", trash.display()), e))
                }
            });
        }

        tracing::info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, Error> {
        let now = Utc::now();
        let expired: Vec<CacheKey> = {
            let index = self.inner.index.read().unwrap_or_else(|e| e.into_inner());
            index
                .iter()
                .filter(|(_, entry)| is_expired(entry.created_at, entry.ttl_seconds, now))
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut purged = 0;
        for key in expired {
            match self.inner.remove(&key, Removal::UnlessValid).await {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to purge expired entry"),
            }
        }

        self.inner.counters.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        if purged > 0 {
            tracing::info!(purged, "purged expired cache entries");
        }
        Ok(purged)
    }

    /// Wait until no eviction is scheduled or running.
    pub async fn settle(&self) {
        let mut idle = self.inner.evicting.subscribe();
        let _ = idle.wait_for(|busy| !*busy).await;
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            entries: self.inner.index.read().unwrap_or_else(|e| e.into_inner()).len(),
            total_bytes: self.total_bytes(),
            size_limit_bytes: self.inner.config.size_limit_bytes,
            hits,
            misses,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            writes: counters.writes.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            expirations: counters.expirations.load(Ordering::Relaxed),
            corrupt_entries: counters.corrupt.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }

    fn schedule_eviction(&self) {
        if !self.inner.claim_eviction() {
            return;
        }

        if let Err(e) = self.pool.submit(run_eviction(EvictionGuard::new(self.inner.clone()))) {
            // The rejected task released its claim when it was dropped.
            tracing::debug!(error = %e, "worker pool unavailable; evicting on the runtime");
            if self.inner.claim_eviction() {
                tokio::spawn(run_eviction(EvictionGuard::new(self.inner.clone())));
            }
        }
    }

    fn schedule_removal(&self, key: CacheKey, what: &'static str) {
        let inner = self.inner.clone();
        self.spawn_background(what, move || {
            let inner = inner.clone();
            let key = key.clone();
            async move { inner.remove(&key, Removal::UnlessValid).await.map(|_| ()) }
        });
    }

    /// Run a maintenance task on the worker pool, or directly on the runtime if
    /// the pool refuses it.
    fn spawn_background<F, Fut>(&self, what: &'static str, make: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        if let Err(e) = self.pool.submit(logged(what, make())) {
            tracing::debug!(task = what, error = %e, "worker pool unavailable; running cache task on the runtime");
            tokio::spawn(logged(what, make()));
        }
    }

    async fn rebuild_index(&self) -> Result<(usize, u64), Error> {
        let inner = &self.inner;
        let dir = &inner.layout.entries;
        let mut reader = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| Error::io(format!("read {}", dir.display()), e))?;

        let mut sidecars = Vec::new();
        let mut payloads = HashSet::new();
        let mut stale = Vec::new();

        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("read {}", dir.display()), e))?
        {
            let name = item.file_name().to_string_lossy().into_owned();
            if name.ends_with(TEMP_SUFFIX) {
                if is_stale(&item).await {
                    stale.push(item.path());
                }
            } else if let Some(stem) = name.strip_suffix(META_SUFFIX) {
                sidecars.push(stem.to_string());
            } else if let Some(stem) = name.strip_suffix(PAYLOAD_SUFFIX) {
                payloads.insert(stem.to_string());
            }
        }

        let mut index = HashMap::new();
        for stem in sidecars {
            let Ok(key) = CacheKey::parse(&stem) else { continue };
            let meta = store::read_meta(&inner.layout, &key).await;
            let payload_len = tokio::fs::metadata(inner.layout.payload_path(&key)).await.map(|m| m.len()).ok();

            match (meta, payload_len) {
                (Some(meta), Some(len)) if meta.size_bytes == len && meta.key == key.as_str() => {
                    payloads.remove(&stem);
                    index.insert(key, IndexEntry::from(&meta));
                }
                _ => {
                    payloads.remove(&stem);
                    inner.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %key, "dropping unreadable cache entry");
                    store::remove_files(&inner.layout, &key).await?;
                }
            }
        }

        // Payloads with no sidecar: a writer crashed between the two renames.
        for stem in payloads {
            let path = dir.join(format!("{stem}{PAYLOAD_SUFFIX}"));
            if let Ok(metadata) = tokio::fs::metadata(&path).await
                && modified_before(&metadata, STALE_AFTER)
            {
                stale.push(path);
            }
        }

        for path in stale {
            tracing::debug!(path = %path.display(), "removing leftover cache file");
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != ErrorKind::NotFound
            {
                return Err(Error::io(format!("remove {}", path.display()), e));
            }
        }

        let entries = index.len();
        let total: u64 = index.values().map(|e| e.size_bytes).sum();
        *inner.index.write().unwrap_or_else(|e| e.into_inner()) = index;
        inner.total_bytes.store(total, Ordering::Release);
        Ok((entries, total))
    }

    async fn remove_trash(&self) -> Result<(), Error> {
        let root = &self.inner.layout.root;
        let mut reader = tokio::fs::read_dir(root)
            .await
            .map_err(|e| Error::io(format!("read {}", root.display()), e))?;

        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("read {}", root.display()), e))?
        {
            if !item.file_name().to_string_lossy().starts_with(TRASH_PREFIX) {
                continue;
            }
            let path = item.path();
            self.spawn_background("delete leftover cleared entries", move || {
                let path = path.clone();
                async move {
                    tokio::fs::remove_dir_all(&path)
                        .await
                        .map_err(|e| Error::io(format!("remove {}", path.display()), e))
                }
            });
        }
        Ok(())
    }
}

impl CacheInner {
    async fn write_entry(&self, key: &CacheKey, payload: &str, meta: &EntryMeta) -> Result<(), Error> {
        let sidecar = serde_json::to_vec_pretty(meta).map_err(|e| Error::IoFailure(format!("encode sidecar: {e}")))?;
        store::write_atomic(&self.layout.payload_path(key), payload.as_bytes()).await?;
        store::write_atomic(&self.layout.meta_path(key), &sidecar).await
    }

    fn index_version(&self, key: &CacheKey) -> u64 {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.get(key).map_or(0, |e| e.version)
    }

    fn insert(&self, key: &CacheKey, entry: IndexEntry) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        self.total_bytes.fetch_add(entry.size_bytes, Ordering::AcqRel);
        if let Some(old) = index.insert(key.clone(), entry) {
            self.total_bytes.fetch_sub(old.size_bytes, Ordering::AcqRel);
        }
    }

    fn forget(&self, key: &CacheKey) -> bool {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        match index.remove(key) {
            Some(old) => {
                self.total_bytes.fetch_sub(old.size_bytes, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Record an access. Entries written by another process are adopted into the index.
    fn touch(&self, key: &CacheKey, meta: &EntryMeta, now: DateTime<Utc>) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        match index.get_mut(key) {
            Some(entry) if entry.version == meta.version => entry.last_accessed_at = now,
            _ => {
                let mut adopted = IndexEntry::from(meta);
                adopted.last_accessed_at = now;
                self.total_bytes.fetch_add(adopted.size_bytes, Ordering::AcqRel);
                if let Some(old) = index.insert(key.clone(), adopted) {
                    self.total_bytes.fetch_sub(old.size_bytes, Ordering::AcqRel);
                }
            }
        }
    }

    async fn remove(&self, key: &CacheKey, removal: Removal) -> Result<bool, Error> {
        let _gate = self.clear_gate.read().await;
        let _lock = self.layout.lock(key).acquire(LockMode::Exclusive, self.config.lock_timeout).await?;

        if removal == Removal::UnlessValid
            && let Inspection::Valid(..) = store::inspect(&self.layout, key, Utc::now()).await?
        {
            return Ok(false);
        }

        store::remove_files(&self.layout, key).await?;
        Ok(self.forget(key))
    }

    fn over_limit(&self) -> bool {
        self.total_bytes.load(Ordering::Acquire) > self.config.size_limit_bytes
    }

    /// Mark eviction as scheduled if it is needed and not already scheduled.
    fn claim_eviction(&self) -> bool {
        self.evicting.send_if_modified(|busy| {
            if *busy || !self.over_limit() {
                return false;
            }
            *busy = true;
            true
        })
    }

    /// Called at the end of a pass. Releases the claim unless another pass is
    /// needed; the size check and the release are atomic with respect to
    /// `claim_eviction`, so a write racing with the end of a pass is never
    /// left unevicted.
    fn finish_eviction_pass(&self, evicted: usize) -> bool {
        self.evicting.send_if_modified(|busy| {
            if self.over_limit() && evicted > 0 {
                return false;
            }
            *busy = false;
            true
        })
    }

    /// Remove least-recently-accessed entries until the total is within the limit.
    async fn evict_pass(&self) -> usize {
        let mut candidates: Vec<(CacheKey, DateTime<Utc>, DateTime<Utc>)> = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            index.iter().map(|(key, e)| (key.clone(), e.last_accessed_at, e.created_at)).collect()
        };
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let mut evicted = 0;
        for (key, ..) in candidates {
            if !self.over_limit() {
                break;
            }
            match self.remove(&key, Removal::Unconditional).await {
                Ok(true) => {
                    evicted += 1;
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, "evicted cache entry");
                }
                Ok(false) => {}
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %key, error = %e, "failed to evict cache entry");
                }
            }
        }
        evicted
    }
}

/// Releases the eviction claim if the task is dropped without finishing
/// (rejected by the pool, or cancelled at shutdown).
struct EvictionGuard {
    inner: Arc<CacheInner>,
    released: bool,
}

impl EvictionGuard {
    fn new(inner: Arc<CacheInner>) -> Self {
        Self { inner, released: false }
    }
}

impl Drop for EvictionGuard {
    fn drop(&mut self) {
        if !self.released {
            self.inner.evicting.send_replace(false);
        }
    }
}

async fn run_eviction(mut guard: EvictionGuard) -> Result<(), Error> {
    let mut total_evicted = 0;
    loop {
        let evicted = guard.inner.evict_pass().await;
        total_evicted += evicted;
        if guard.inner.finish_eviction_pass(evicted) {
            guard.released = true;
            break;
        }
    }

    let inner = &guard.inner;
    if inner.over_limit() {
        tracing::warn!(
            total_bytes = inner.total_bytes.load(Ordering::Acquire),
            limit_bytes = inner.config.size_limit_bytes,
            "cache still over its size limit after eviction"
        );
    } else if total_evicted > 0 {
        tracing::info!(evicted = total_evicted, "cache eviction finished");
    }
    Ok(())
}

async fn logged<F>(what: &'static str, task: F) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    if let Err(e) = task.await {
        tracing::warn!(task = what, error = %e, "background cache task failed");
    }
    Ok(())
}

async fn is_stale(item: &tokio::fs::DirEntry) -> bool {
    item.metadata().await.is_ok_and(|m| modified_before(&m, STALE_AFTER))
}

fn modified_before(metadata: &std::fs::Metadata, age: Duration) -> bool {
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|elapsed| elapsed >= age)
}
