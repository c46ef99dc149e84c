//! Connection-level transport seam.
//!
//! [`NetworkManager`](super::NetworkManager) only sees these traits, so the
//! pool, retry and size logic can be driven by a scripted transport in tests.
//! [`ReqwestTransport`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, header};
use url::Url;

use csx_core::Error;

use super::NetworkRequest;
use super::url::Origin;

const MAX_REDIRECTS: usize = 5;
const ACCEPT: &str = "text/html,application/xhtml+xml,text/css;q=0.9,*/*;q=0.8";

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection reset: {0}")]
    Reset(String),

    #[error("malformed request: {0}")]
    Request(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => Error::Timeout(msg),
            TransportError::Connect(msg) | TransportError::Reset(msg) => Error::ConnectionFailed(msg),
            TransportError::Request(msg) => Error::InvalidInput(msg),
        }
    }
}

/// Streaming response body.
#[async_trait]
pub trait BodyReader: Send {
    /// Next chunk, or `None` once the body is complete.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Status line and headers of a response whose body has not been read yet.
pub struct TransportResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: Box<dyn BodyReader>,
}

/// One connection to an origin.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, request: &NetworkRequest, url: &Url) -> Result<TransportResponse, TransportError>;

    /// Whether the connection may be returned to the idle pool.
    fn is_reusable(&self) -> bool {
        true
    }
}

/// Opens connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, origin: &Origin) -> Result<Box<dyn Connection>, TransportError>;
}

/// HTTP(S) transport backed by `reqwest` with rustls.
///
/// Each pooled connection owns a client that keeps at most one idle socket,
/// so pool accounting matches real sockets.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    user_agent: String,
    timeout: Duration,
    verify_ssl: bool,
}

impl ReqwestTransport {
    pub fn new(user_agent: impl Into<String>, timeout: Duration, verify_ssl: bool) -> Self {
        Self { user_agent: user_agent.into(), timeout, verify_ssl }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn connect(&self, origin: &Origin) -> Result<Box<dyn Connection>, TransportError> {
        let http = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .use_rustls_tls()
            .danger_accept_invalid_certs(!self.verify_ssl)
            .pool_max_idle_per_host(1)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| TransportError::Connect(format!("failed to build HTTP client for {origin}: {e}")))?;

        Ok(Box::new(ReqwestConnection { http }))
    }
}

struct ReqwestConnection {
    http: Client,
}

#[async_trait]
impl Connection for ReqwestConnection {
    async fn send(&mut self, request: &NetworkRequest, url: &Url) -> Result<TransportResponse, TransportError> {
        let mut builder = self.http.request(request.method.clone(), url.as_str()).header(header::ACCEPT, ACCEPT);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify)?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(TransportResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            content_type,
            body: Box::new(ReqwestBody(response)),
        })
    }
}

struct ReqwestBody(reqwest::Response);

#[async_trait]
impl BodyReader for ReqwestBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.0.chunk().await.map_err(classify)
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::Request(err.to_string())
    } else {
        TransportError::Reset(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classes() {
        assert!(matches!(Error::from(TransportError::Timeout("t".into())), Error::Timeout(_)));
        assert!(matches!(Error::from(TransportError::Connect("refused".into())), Error::ConnectionFailed(_)));
        assert!(matches!(Error::from(TransportError::Reset("eof".into())), Error::ConnectionFailed(_)));

        let err = Error::from(TransportError::Request("bad header".into()));
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_reqwest_transport_connects_lazily() {
        let transport = ReqwestTransport::new("css-extract/0.1", Duration::from_secs(5), true);
        let origin = Origin { scheme: "https".into(), host: "example.com".into(), port: 443 };
        let conn = transport.connect(&origin).await.unwrap();
        assert!(conn.is_reusable());
    }
}
