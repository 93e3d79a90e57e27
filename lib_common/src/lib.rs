//! Shared library for the relay workspace: the connection-resilience and
//! event-relay engine plus the upstream adapters it runs against.

pub mod configs;
pub mod connections;
pub mod core;
pub mod errors;
pub mod retrieve;

pub use configs::RelayConfig;
pub use crate::core::{Component, Orchestrator, OrchestratorError, Upstreams};
pub use errors::{ErrorTracker, Severity};
