//! Cache entries and their on-disk sidecar metadata.

use chrono::{DateTime, TimeDelta, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A cached extraction result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CacheEntry {
    pub key: String,
    pub payload: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    /// Starts at 1 and increments on every overwrite of the same key.
    pub version: u64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        expiry(self.created_at, self.ttl_seconds)
    }
}

/// Contents of `<key>.meta.json`, written after the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryMeta {
    pub key: String,
    pub size_bytes: u64,
    /// SHA-256 of the payload bytes.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub version: u64,
}

impl EntryMeta {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.created_at, self.ttl_seconds, now)
    }

    pub fn into_entry(self, payload: String, last_accessed_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: self.key,
            payload,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            last_accessed_at,
            ttl_seconds: self.ttl_seconds,
            version: self.version,
        }
    }
}

/// `None` when the TTL is too large to represent, meaning "never".
pub(crate) fn expiry(created_at: DateTime<Utc>, ttl_seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(ttl_seconds).ok()?;
    created_at.checked_add_signed(TimeDelta::try_seconds(seconds)?)
}

pub(crate) fn is_expired(created_at: DateTime<Utc>, ttl_seconds: u64, now: DateTime<Utc>) -> bool {
    expiry(created_at, ttl_seconds).is_some_and(|at| now >= at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let created = Utc::now();
        assert!(!is_expired(created, 60, created));
        assert!(is_expired(created, 60, created + TimeDelta::seconds(60)));
        assert!(is_expired(created, 0, created));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let created = Utc::now();
        assert!(expiry(created, u64::MAX).is_none());
        assert!(!is_expired(created, u64::MAX, created + TimeDelta::days(365 * 100)));
    }

    #[test]
    fn test_sidecar_json_shape() {
        let now = Utc::now();
        let meta = EntryMeta {
            key: "k".into(),
            size_bytes: 3,
            checksum: "c".into(),
            created_at: now,
            last_accessed_at: now,
            ttl_seconds: 10,
            version: 2,
        };
        let json: serde_json::Value = serde_json::to_value(&meta).unwrap();
        for field in ["key", "size_bytes", "checksum", "created_at", "last_accessed_at", "ttl_seconds", "version"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }
}
