//! Advisory file locks shared across threads and processes.
//!
//! Every acquisition opens its own handle on `<locks>/<key>.lock`, so two
//! acquisitions in the same process conflict exactly like two processes do.
//! Lock files are never deleted; unlinking a lock file while another handle
//! holds it would let a third caller lock a fresh inode.

use std::fs::{File, TryLockError};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::Error;
use crate::cache::CacheKey;

const MIN_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Lock over one named resource.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Lock for a cache key, stored under `locks_dir`.
    pub fn for_key(locks_dir: &Path, key: &CacheKey) -> Self {
        Self { path: locks_dir.join(format!("{key}.lock")) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling with backoff until `timeout` elapses.
    ///
    /// Not reentrant: acquiring twice from the same task with an exclusive mode
    /// on either side times out.
    pub async fn acquire(&self, mode: LockMode, timeout: Duration) -> Result<LockGuard, Error> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|e| Error::io(format!("open {}", self.path.display()), e))?
            .into_std()
            .await;

        let deadline = Instant::now() + timeout;
        let mut backoff = MIN_BACKOFF;

        loop {
            let attempt = match mode {
                LockMode::Shared => file.try_lock_shared(),
                LockMode::Exclusive => file.try_lock(),
            };

            match attempt {
                Ok(()) => return Ok(LockGuard { file, path: self.path.clone(), mode }),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => return Err(Error::io(format!("lock {}", self.path.display()), e)),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout(format!(
                    "{mode:?} lock on {} not acquired within {timeout:?}",
                    self.path.display()
                )));
            }

            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release file lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock(dir: &TempDir) -> FileLock {
        FileLock::for_key(dir.path(), &CacheKey::for_url("https://example.com/", ""))
    }

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_exclusive_excludes_everyone() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);

        let guard = lock.acquire(LockMode::Exclusive, SHORT).await.unwrap();
        assert_eq!(guard.mode(), LockMode::Exclusive);

        assert!(matches!(lock.acquire(LockMode::Exclusive, SHORT).await, Err(Error::LockTimeout(_))));
        assert!(matches!(lock.acquire(LockMode::Shared, SHORT).await, Err(Error::LockTimeout(_))));

        drop(guard);
        assert!(lock.acquire(LockMode::Exclusive, SHORT).await.is_ok());
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);

        let first = lock.acquire(LockMode::Shared, SHORT).await.unwrap();
        let second = lock.acquire(LockMode::Shared, SHORT).await.unwrap();
        assert!(matches!(lock.acquire(LockMode::Exclusive, SHORT).await, Err(Error::LockTimeout(_))));

        drop(first);
        drop(second);
        assert!(lock.acquire(LockMode::Exclusive, SHORT).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        let guard = lock.acquire(LockMode::Exclusive, SHORT).await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        let acquired = lock.acquire(LockMode::Exclusive, Duration::from_secs(2)).await;
        assert!(acquired.is_ok());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let dir = TempDir::new().unwrap();
        let a = FileLock::for_key(dir.path(), &CacheKey::for_url("https://a.test/", ""));
        let b = FileLock::for_key(dir.path(), &CacheKey::for_url("https://b.test/", ""));

        let _a = a.acquire(LockMode::Exclusive, SHORT).await.unwrap();
        assert!(b.acquire(LockMode::Exclusive, SHORT).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_file_survives_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir);
        drop(lock.acquire(LockMode::Shared, SHORT).await.unwrap());
        assert!(lock.path().exists());
    }
}
