//! Content-addressed cache keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Error;

/// SHA-256 fingerprint of one extractable input, as 64 lowercase hex chars.
///
/// Keys name files on disk, so anything that is not exactly that shape is
/// rejected with `InvalidKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a remote resource: canonical URL plus the extraction options.
    pub fn for_url(canonical_url: &str, options: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"url\n");
        hasher.update(canonical_url.as_bytes());
        hasher.update(b"\n");
        hasher.update(options.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Key for local content: the bytes themselves plus the extraction options.
    pub fn for_content(content: &[u8], options: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"content\n");
        hasher.update(content);
        hasher.update(b"\n");
        hasher.update(options.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Validate a key received from outside (tool input, file names).
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::InvalidKey(format!("expected 64 lowercase hex characters, got {raw:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Lowercase hex SHA-256 of `bytes`; used for payload checksums.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_stability() {
        let a = CacheKey::for_url("https://example.com/", "minify=false");
        let b = CacheKey::for_url("https://example.com/", "minify=false");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_depends_on_options() {
        let plain = CacheKey::for_url("https://example.com/", "minify=false");
        let minified = CacheKey::for_url("https://example.com/", "minify=true");
        assert_ne!(plain, minified);
    }

    #[test]
    fn test_url_and_content_keys_do_not_collide() {
        let url = CacheKey::for_url("abc", "");
        let content = CacheKey::for_content(b"abc", "");
        assert_ne!(url, content);
    }

    #[test]
    fn test_key_format() {
        let key = CacheKey::for_content(b"<style>a{}</style>", "minify=true");
        assert_eq!(key.as_str().len(), 64);
        assert!(CacheKey::parse(key.as_str()).is_ok());
    }

    #[test]
    fn test_parse_rejects_unsafe_keys() {
        let rejected = vec![
            String::new(),
            "../../etc/passwd".to_string(),
            "A".repeat(64),
            "a".repeat(63),
            format!("{}g", "a".repeat(63)),
        ];
        for raw in &rejected {
            assert!(matches!(CacheKey::parse(raw), Err(Error::InvalidKey(_))), "{raw:?} accepted");
        }
    }

    #[test]
    fn test_serde_validates() {
        let key = CacheKey::for_url("https://example.com/", "");
        let json = serde_json::to_string(&key).unwrap();
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<CacheKey>("\"not-a-key\"").is_err());
    }
}
