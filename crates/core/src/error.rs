//! Unified error types for css-extract.
//!
//! Every variant displays with a stable code prefix so callers (and the MCP
//! surface) can match on the class of failure without parsing messages.

use rmcp::model::{ErrorCode, ErrorData as McpError};

/// Unified error types shared by the cache, memory, network and worker components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty source, zero tokens).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Cache key is not a 64-char lowercase hex digest.
    #[error("INVALID_KEY: {0}")]
    InvalidKey(String),

    /// No cache entry found for the given key.
    #[error("CACHE_MISS: {0}")]
    CacheMiss(String),

    /// Payload can never fit in the configured cache size.
    #[error("CAPACITY_EXCEEDED: {size} bytes exceeds cache limit of {limit} bytes")]
    CapacityExceeded { size: u64, limit: u64 },

    /// Filesystem operation failed.
    #[error("IO_FAILURE: {0}")]
    IoFailure(String),

    /// Usage is above the hard memory threshold.
    #[error("MEMORY_LIMIT_EXCEEDED: {usage} bytes in use, hard limit {limit} bytes")]
    MemoryLimitExceeded { usage: u64, limit: u64 },

    /// A blocking operation did not complete within its timeout.
    #[error("TIMEOUT: {0}")]
    Timeout(String),

    /// Could not open or keep a connection to the remote host.
    #[error("CONNECTION_FAILED: {0}")]
    ConnectionFailed(String),

    /// Host rejected by the domain allow/block policy.
    #[error("DOMAIN_BLOCKED: {0}")]
    DomainBlocked(String),

    /// No rate-limit token was available and the caller chose not to wait.
    #[error("RATE_LIMITED: {0}")]
    RateLimited(String),

    /// Response body exceeds the configured maximum.
    #[error("TOO_LARGE: {0}")]
    TooLarge(String),

    /// Non-success HTTP status.
    #[error("HTTP_ERROR: status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Worker pool queue is full.
    #[error("POOL_SATURATED: {capacity} tasks already outstanding")]
    PoolSaturated { capacity: usize },

    /// Worker pool is shutting down.
    #[error("POOL_CLOSED")]
    PoolClosed,

    /// Task was cancelled before or while running.
    #[error("CANCELLED: {0}")]
    Cancelled(String),

    /// Task failed with an unhandled fault.
    #[error("TASK_FAILED: {0}")]
    TaskFailed(String),

    /// Input could not be parsed as HTML/CSS.
    #[error("PARSE_ERROR: {0}")]
    ParseError(String),

    /// File lock could not be acquired in time.
    #[error("LOCK_TIMEOUT: {0}")]
    LockTimeout(String),
}

impl Error {
    /// Wrap an I/O error with the operation and path that produced it.
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Error::IoFailure(format!("{context}: {err}"))
    }

    /// Whether the network layer may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::RateLimited(_) => true,
            Error::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::InvalidInput(_) | Error::InvalidUrl(_) | Error::InvalidKey(_) => -32602,
            Error::ParseError(_) => -32000,
            Error::CacheMiss(_) => -32001,
            Error::CapacityExceeded { .. } | Error::IoFailure(_) | Error::LockTimeout(_) => -32002,
            Error::DomainBlocked(_) => -32004,
            Error::Timeout(_) => -32006,
            Error::TooLarge(_) => -32007,
            Error::HttpStatus { .. } | Error::ConnectionFailed(_) => -32008,
            Error::RateLimited(_) => -32010,
            Error::MemoryLimitExceeded { .. } => -32013,
            Error::PoolSaturated { .. } | Error::PoolClosed => -32014,
            Error::Cancelled(_) | Error::TaskFailed(_) => -32015,
        };

        McpError { code: ErrorCode(code), message: err.to_string().into(), data: None }
    }
}
