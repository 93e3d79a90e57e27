//! # Connections Module
//!
//! This module handles persistent connections to external services
//! including the database and the optional caching layer.

/// Module for PostgreSQL connection pooling and health probing.
pub mod db_postgres;

/// The key-value cache abstraction consulted opportunistically by the engine.
pub mod cache;

/// Module for Redis cache operations and connection handling.
#[cfg(feature = "cache")]
pub mod cache_redis;

pub use cache::{CacheError, KeyValueCache};
#[cfg(feature = "cache")]
pub use cache_redis::RedisCache;
pub use db_postgres::{mask_url_password, DatabaseProbe, DbError, PostgresProbe};
