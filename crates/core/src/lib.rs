//! Core types and shared functionality for css-extract.
//!
//! This crate provides:
//! - A file-backed cache with cross-process locking
//! - Memory accounting with soft/hard limits and leak detection
//! - A bounded worker pool
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod workers;

pub use cache::{CacheEntry, CacheKey, CacheManager, CacheStats};
pub use config::{AppConfig, ConfigError};
pub use error::Error;
pub use memory::{MemoryManager, MemoryPressure, MemoryStats};
pub use workers::{TaskHandle, WorkerPool, WorkerPoolStats};
