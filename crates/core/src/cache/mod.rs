//! Persistent, size- and time-bounded cache of extraction results.
//!
//! Entries live as plain files under the cache directory (payload plus a JSON
//! sidecar) and are guarded by per-key advisory file locks, so several
//! processes on one host can share a cache directory.
//!
//! - Content-addressed keys using SHA-256 hashing
//! - Atomic writes (temp file, fsync, rename; sidecar last)
//! - Checksum verification on every read
//! - Background LRU eviction and TTL expiry

mod entry;
mod key;
mod lock;
mod manager;
mod store;

use std::path::PathBuf;
use std::time::Duration;

pub use entry::CacheEntry;
pub use key::{CacheKey, sha256_hex};
pub use lock::{FileLock, LockGuard, LockMode};
pub use manager::{CacheManager, CacheStats, WeakCacheManager};
pub use store::write_atomic;

/// Cache location and bounds.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Upper bound on the summed payload size once eviction has run.
    pub size_limit_bytes: u64,
    pub ttl: Duration,
    /// How long `get`/`put` wait for a per-key lock.
    pub lock_timeout: Duration,
    /// Payloads at least this large are checked against the memory manager before writing.
    pub large_payload_bytes: u64,
}
