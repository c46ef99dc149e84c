//! Network access for remote stylesheets and pages.
//!
//! ### Pre-flight
//! - Canonicalize the URL (see [`canonicalize`])
//! - Check the host against the domain allow/block policy
//! - Take a token from the rate limiter (waiting or not, per request)
//!
//! ### Transfer
//! - Lease a pooled connection for the `(scheme, host, port)` origin
//! - Reject oversized bodies by `Content-Length` and while streaming
//! - Consult the memory manager before buffering large bodies
//!
//! ### Retry
//! - Timeouts, connection failures, 429 and 5xx are retried with exponential
//!   backoff and jitter; everything else surfaces on the first attempt.

pub mod policy;
pub mod pool;
pub mod rate_limit;
pub mod transport;
pub mod url;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use reqwest::Method;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use self::url::{Origin, UrlError, canonicalize, is_remote};
pub use policy::{DomainPolicy, PolicyError};
pub use pool::{ConnectionPool, Lease, PoolConfig, PoolStats};
pub use rate_limit::RateLimiter;
pub use transport::{BodyReader, Connection, ReqwestTransport, Transport, TransportError, TransportResponse};

use csx_core::config::{DefaultPolicy, PoolOverflow};
use csx_core::{AppConfig, Error, MemoryManager};

/// Settings for [`NetworkManager`].
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Per-attempt timeout, covering the rate-limit wait, the pool wait and the transfer.
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: u32,
    pub max_response_bytes: u64,
    /// Bodies are checked against the memory manager every this many bytes.
    pub large_allocation_bytes: u64,
    pub pool_max_per_host: usize,
    pub pool_idle_ttl: Duration,
    pub pool_overflow: PoolOverflow,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub default_domain_policy: DefaultPolicy,
    pub verify_ssl: bool,
    pub user_agent: String,
}

impl From<&AppConfig> for NetworkConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: config.network_timeout(),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
            rate_limit_per_second: config.rate_limit_per_second,
            rate_limit_burst: config.rate_limit_burst,
            max_response_bytes: config.max_response_bytes,
            large_allocation_bytes: config.large_allocation_bytes,
            pool_max_per_host: config.pool_max_per_host,
            pool_idle_ttl: Duration::from_secs(config.pool_idle_ttl_seconds),
            pool_overflow: config.pool_overflow,
            allowed_domains: config.allowed_domains.clone(),
            blocked_domains: config.blocked_domains.clone(),
            default_domain_policy: config.default_domain_policy,
            verify_ssl: config.verify_ssl,
            user_agent: config.user_agent.clone(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// A request for one remote resource.
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub url: String,
    pub method: Method,
    /// Overrides the configured per-attempt timeout.
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
    /// Wait for a rate-limit token instead of failing with `RateLimited`.
    pub wait_for_rate_limit: bool,
}

impl NetworkRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into(), method: Method::GET, timeout: None, headers: Vec::new(), wait_for_rate_limit: true }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Fail with `RateLimited` rather than waiting for a token.
    pub fn no_wait(mut self) -> Self {
        self.wait_for_rate_limit = false;
        self
    }
}

/// A fully buffered successful response.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    /// Canonical URL that was fetched.
    pub url: ::url::Url,
    pub status: u16,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub elapsed: Duration,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NetworkStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub blocked: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
    pub bytes_received: u64,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub connections_opened: u64,
    pub connections_reused: u64,
    pub tokens_available: f64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    blocked: AtomicU64,
    rate_limited: AtomicU64,
    timeouts: AtomicU64,
    bytes_received: AtomicU64,
}

/// Fetches remote resources through pooled connections, gated by the domain
/// policy and the rate limiter.
pub struct NetworkManager {
    config: NetworkConfig,
    policy: DomainPolicy,
    limiter: RateLimiter,
    pool: ConnectionPool,
    memory: Option<Arc<MemoryManager>>,
    counters: Counters,
}

impl NetworkManager {
    /// Manager using the HTTP transport.
    pub fn new(config: NetworkConfig, memory: Option<Arc<MemoryManager>>) -> Self {
        if !config.verify_ssl {
            tracing::warn!("TLS certificate verification is disabled; remote hosts are not authenticated");
        }
        let transport = ReqwestTransport::new(&config.user_agent, config.timeout, config.verify_ssl);
        Self::with_transport(config, Arc::new(transport), memory)
    }

    pub fn with_transport(config: NetworkConfig, transport: Arc<dyn Transport>, memory: Option<Arc<MemoryManager>>) -> Self {
        let policy = DomainPolicy::new(&config.allowed_domains, &config.blocked_domains, config.default_domain_policy);
        let limiter = RateLimiter::new(config.rate_limit_per_second, config.rate_limit_burst);
        let pool_config = PoolConfig {
            max_per_host: config.pool_max_per_host,
            idle_ttl: config.pool_idle_ttl,
            overflow: config.pool_overflow,
        };
        let pool = ConnectionPool::new(transport, pool_config);

        Self { config, policy, limiter, pool, memory, counters: Counters::default() }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Fetch `request.url`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// - `InvalidUrl` if the URL cannot be canonicalized
    /// - `DomainBlocked` if the policy rejects the host (nothing is sent)
    /// - `RateLimited` if no token is available and the request does not wait,
    ///   or the server keeps answering 429
    /// - `Timeout`, `ConnectionFailed` or 5xx `HttpStatus` once retries are exhausted
    /// - `HttpStatus` for other non-success statuses
    /// - `TooLarge` / `MemoryLimitExceeded` if the body cannot be buffered
    pub async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse, Error> {
        let start = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let result = self.fetch_with_retries(&request).await;
        match &result {
            Ok(response) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_received.fetch_add(response.body.len() as u64, Ordering::Relaxed);
                tracing::debug!(
                    url = %response.url,
                    status = response.status,
                    bytes = response.body.len(),
                    attempts = response.attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "fetched"
                );
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                if matches!(e, Error::Timeout(_)) {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!(url = %request.url, error = %e, "fetch failed");
            }
        }

        result.map(|response| NetworkResponse { elapsed: start.elapsed(), ..response })
    }

    async fn fetch_with_retries(&self, request: &NetworkRequest) -> Result<NetworkResponse, Error> {
        let url = canonicalize(&request.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let host = url.host_str().unwrap_or_default();
        if let Err(e) = self.policy.check(host) {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            return Err(Error::DomainBlocked(e.to_string()));
        }
        let origin = Origin::of(&url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let timeout = request.timeout.unwrap_or(self.config.timeout);

        let mut attempt = 0;
        loop {
            if let Err(e) = self.limiter.acquire(1, request.wait_for_rate_limit, timeout).await {
                if matches!(e, Error::RateLimited(_)) {
                    self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }

            match self.attempt(request, &url, &origin, timeout).await {
                Ok((status, content_type, body)) => {
                    return Ok(NetworkResponse {
                        url,
                        status,
                        body,
                        content_type,
                        elapsed: Duration::ZERO,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    if matches!(e, Error::RateLimited(_)) {
                        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    }
                    if !e.is_transient() || attempt >= self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.backoff(attempt);
                    tracing::debug!(url = %url, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    if matches!(e, Error::Timeout(_)) {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One lease, one exchange. The connection is discarded on any failure.
    async fn attempt(
        &self, request: &NetworkRequest, url: &::url::Url, origin: &Origin, timeout: Duration,
    ) -> Result<(u16, Option<String>, Bytes), Error> {
        let deadline = Instant::now() + timeout;
        let mut lease = self.pool.lease(origin, deadline).await?;

        let result = match tokio::time::timeout_at(deadline, self.exchange(&mut lease, request, url)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{url} did not complete within {timeout:?}"))),
        };
        if result.is_err() {
            lease.discard();
        }
        result
    }

    async fn exchange(
        &self, lease: &mut Lease, request: &NetworkRequest, url: &::url::Url,
    ) -> Result<(u16, Option<String>, Bytes), Error> {
        let mut response = lease.send(request, url).await?;

        match response.status {
            200..=299 => {}
            429 => return Err(Error::RateLimited(format!("{url} answered 429 Too Many Requests"))),
            status => return Err(Error::HttpStatus { status, url: url.to_string() }),
        }

        let limit = self.config.max_response_bytes;
        let step = self.config.large_allocation_bytes.max(1);
        let mut reserved = 0;

        if let Some(len) = response.content_length {
            if len > limit {
                return Err(Error::TooLarge(format!("{url}: {len} bytes exceeds {limit}")));
            }
            if len >= step {
                self.reserve(len)?;
                reserved = len;
            }
        }

        let capacity = response.content_length.unwrap_or(0).min(step);
        let mut body = BytesMut::with_capacity(usize::try_from(capacity).unwrap_or(0));
        while let Some(chunk) = response.body.next_chunk().await? {
            let received = (body.len() + chunk.len()) as u64;
            if received > limit {
                return Err(Error::TooLarge(format!("{url}: body exceeds {limit} bytes")));
            }
            if received >= reserved + step {
                self.reserve(step)?;
                reserved += step;
            }
            body.extend_from_slice(&chunk);
        }

        Ok((response.status, response.content_type, body.freeze()))
    }

    fn reserve(&self, bytes: u64) -> Result<(), Error> {
        match &self.memory {
            Some(memory) => memory.check_limit(bytes).map(|_| ()),
            None => Ok(()),
        }
    }

    /// `min(base · 2^attempt, max) · U[0.5, 1.5)`
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.retry_base_delay.as_secs_f64() * 2f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.config.retry_max_delay.as_secs_f64());
        Duration::from_secs_f64(capped * rand::thread_rng().gen_range(0.5..1.5))
    }

    /// Drop idle pooled connections. Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        self.pool.close_idle()
    }

    pub fn stats(&self) -> NetworkStats {
        let pool = self.pool.stats();
        let c = &self.counters;

        NetworkStats {
            requests: c.requests.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            blocked: c.blocked.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            active_connections: pool.active,
            idle_connections: pool.idle,
            connections_opened: pool.opened,
            connections_reused: pool.reused,
            tokens_available: self.limiter.available_tokens(),
        }
    }
}
