//! # Configuration Modules
//!
//! This module aggregates the typed configuration of the relay engine.

/// Engine configuration with the production defaults.
pub mod config_relay;

pub use config_relay::{HealthConfig, RelayConfig, StreamConfig, TokenConfig, TrackerConfig};
