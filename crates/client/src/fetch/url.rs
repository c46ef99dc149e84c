//! URL canonicalization and connection origins.

use std::fmt;

use url::Url;

/// Error type for URL canonicalization failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host: {0}")]
    MissingHost(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Canonicalize a URL string so equal resources produce equal cache keys.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Default scheme to https:// if missing
/// 3. Lowercase the host and drop a trailing root dot
/// 4. Drop the port when it is the scheme default (done by `url`)
/// 5. Remove fragment (#...)
/// 6. Keep query string intact (do not reorder)
pub fn canonicalize(input: &str) -> Result<Url, UrlError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let with_scheme = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };
    let mut parsed = Url::parse(&with_scheme).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }

    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host.trim_end_matches('.').to_lowercase(),
        _ => return Err(UrlError::MissingHost(trimmed.to_string())),
    };
    parsed.set_host(Some(&host)).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    parsed.set_fragment(None);

    Ok(parsed)
}

/// Whether `source` names a remote resource rather than a local path.
pub fn is_remote(source: &str) -> bool {
    let source = source.trim_start();
    ["http://", "https://"]
        .iter()
        .any(|scheme| source.get(..scheme.len()).is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme)))
}

/// `(scheme, host, port)`: the unit connections are pooled by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn of(url: &Url) -> Result<Self, UrlError> {
        let host = url.host_str().ok_or_else(|| UrlError::MissingHost(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| UrlError::UnsupportedScheme(url.scheme().to_string()))?;
        Ok(Self { scheme: url.scheme().to_string(), host: host.to_string(), port })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_default_scheme() {
        let url = canonicalize("example.com").unwrap();
        assert_eq!(url.as_str(), "https://example.com/");
    }

    #[test]
    fn test_canonicalize_lowercase_host_and_trailing_dot() {
        let url = canonicalize("https://EXAMPLE.COM./Path").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.path(), "/Path");
    }

    #[test]
    fn test_canonicalize_default_port_dropped() {
        let a = canonicalize("https://example.com:443/a").unwrap();
        let b = canonicalize("https://example.com/a").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonicalize_fragment_removed_query_kept() {
        let url = canonicalize("  https://example.com/p?b=2&a=1#top ").unwrap();
        assert_eq!(url.as_str(), "https://example.com/p?b=2&a=1");
    }

    #[test]
    fn test_canonicalize_rejects() {
        assert!(matches!(canonicalize("   "), Err(UrlError::Empty)));
        assert!(matches!(canonicalize("file:///etc/passwd"), Err(UrlError::UnsupportedScheme(_))));
        assert!(matches!(canonicalize("ftp://example.com"), Err(UrlError::UnsupportedScheme(_))));
        assert!(canonicalize("https://exa mple.com").is_err());
    }

    #[test]
    fn test_is_remote() {
        assert!(is_remote("https://example.com"));
        assert!(is_remote("HTTP://example.com"));
        assert!(!is_remote("./pages/index.html"));
        assert!(!is_remote("/srv/https-notes.html"));
        assert!(!is_remote("http"));
    }

    #[test]
    fn test_origin() {
        let origin = Origin::of(&canonicalize("http://Example.com:8080/x").unwrap()).unwrap();
        assert_eq!(origin, Origin { scheme: "http".into(), host: "example.com".into(), port: 8080 });
        assert_eq!(origin.to_string(), "http://example.com:8080");

        let https = Origin::of(&canonicalize("https://example.com").unwrap()).unwrap();
        assert_eq!(https.port, 443);
    }
}
