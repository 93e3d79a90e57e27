//! # Data Retrieval Module
//!
//! Generic HTTP plumbing shared by the REST-facing parts of the engine. The
//! `api_client` wraps `reqwest` with retry middleware so callers such as the
//! token exchange only deal with paths, credentials and typed responses.

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod api_client;

pub use api_client::{ApiClient, ApiError, ApiResponse, Auth, RequestBody};
