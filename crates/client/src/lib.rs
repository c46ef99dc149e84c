//! Client code for css-extract.
//!
//! This crate provides the network manager (pooling, rate limiting, domain
//! policy, retries), HTML/CSS extraction, the extraction pipeline and the
//! factory that wires them to the core managers.

pub mod extract;
pub mod fetch;
pub mod manager;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use extract::{CssParser, HtmlStyleParser, minify};
pub use fetch::{NetworkConfig, NetworkManager, NetworkRequest, NetworkResponse, NetworkStats, RateLimiter};
pub use manager::{ManagerFactory, ResourceStats};
pub use pipeline::{ExtractOptions, Extraction, Extractor};
