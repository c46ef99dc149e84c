//! On-disk layout of the cache directory.
//!
//! ```text
//! <root>/entries/<key>.css        payload
//! <root>/entries/<key>.meta.json  sidecar, written after the payload
//! <root>/locks/<key>.lock         advisory lock file
//! <root>/trash-*/                 entry directories detached by clear()
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::Error;
use crate::cache::entry::EntryMeta;
use crate::cache::key::sha256_hex;
use crate::cache::{CacheKey, FileLock};

pub(crate) const PAYLOAD_SUFFIX: &str = ".css";
pub(crate) const META_SUFFIX: &str = ".meta.json";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";
pub(crate) const TRASH_PREFIX: &str = "trash-";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    pub root: PathBuf,
    pub entries: PathBuf,
    pub locks: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf(), entries: root.join("entries"), locks: root.join("locks") }
    }

    pub fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.entries.join(format!("{key}{PAYLOAD_SUFFIX}"))
    }

    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.entries.join(format!("{key}{META_SUFFIX}"))
    }

    pub fn lock(&self, key: &CacheKey) -> FileLock {
        FileLock::for_key(&self.locks, key)
    }

    /// Fresh, unused directory name for a detached entry directory.
    pub fn trash_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.f");
        self.root.join(format!("{TRASH_PREFIX}{stamp}-{}-{}", std::process::id(), next_seq()))
    }

    pub async fn create_dirs(&self) -> Result<(), Error> {
        for dir in [&self.entries, &self.locks] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
        }
        Ok(())
    }
}

fn next_seq() -> u64 {
    TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Write `bytes` to `path` via a temp file in the same directory: write, fsync, rename.
///
/// On failure the temp file is removed and `path` is left untouched.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let dir = path.parent().ok_or_else(|| Error::IoFailure(format!("{} has no parent", path.display())))?;
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.{}{TEMP_SUFFIX}", std::process::id(), next_seq()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::io(format!("write {}", path.display()), e));
    }

    Ok(())
}

/// What is on disk for a key. Callers hold at least a shared lock.
#[derive(Debug)]
pub(crate) enum Inspection {
    Missing,
    Corrupt(String),
    Expired(EntryMeta),
    Valid(EntryMeta, String),
}

pub(crate) async fn inspect(layout: &Layout, key: &CacheKey, now: DateTime<Utc>) -> Result<Inspection, Error> {
    let payload_path = layout.payload_path(key);
    let meta_path = layout.meta_path(key);

    let meta_bytes = match tokio::fs::read(&meta_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let orphan = tokio::fs::try_exists(&payload_path).await.unwrap_or(false);
            return Ok(if orphan { Inspection::Corrupt("payload without sidecar".into()) } else { Inspection::Missing });
        }
        Err(e) => return Err(Error::io(format!("read {}", meta_path.display()), e)),
    };

    let meta: EntryMeta = match serde_json::from_slice(&meta_bytes) {
        Ok(meta) => meta,
        Err(e) => return Ok(Inspection::Corrupt(format!("unreadable sidecar: {e}"))),
    };
    if meta.key != key.as_str() {
        return Ok(Inspection::Corrupt("sidecar belongs to a different key".into()));
    }
    if meta.is_expired_at(now) {
        return Ok(Inspection::Expired(meta));
    }

    let payload = match tokio::fs::read(&payload_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Inspection::Corrupt("sidecar without payload".into())),
        Err(e) => return Err(Error::io(format!("read {}", payload_path.display()), e)),
    };

    if payload.len() as u64 != meta.size_bytes {
        return Ok(Inspection::Corrupt(format!("size {} does not match sidecar size {}", payload.len(), meta.size_bytes)));
    }
    if sha256_hex(&payload) != meta.checksum {
        return Ok(Inspection::Corrupt("checksum mismatch".into()));
    }

    match String::from_utf8(payload) {
        Ok(payload) => Ok(Inspection::Valid(meta, payload)),
        Err(_) => Ok(Inspection::Corrupt("payload is not UTF-8".into())),
    }
}

/// Sidecar for `key`, if present and parseable.
pub(crate) async fn read_meta(layout: &Layout, key: &CacheKey) -> Option<EntryMeta> {
    let bytes = tokio::fs::read(layout.meta_path(key)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Delete payload and sidecar. Missing files are not an error.
pub(crate) async fn remove_files(layout: &Layout, key: &CacheKey) -> Result<(), Error> {
    for path in [layout.payload_path(key), layout.meta_path(key)] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(format!("remove {}", path.display()), e)),
        }
    }
    Ok(())
}
