//! # Key-Value Cache Seam
//!
//! The engine may publish to a cache but never reads its own correctness from
//! one. Every implementation is therefore best-effort from the caller's view.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("cache operation failed: {0}")]
pub struct CacheError(pub String);

/// A get/set/TTL store.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}
