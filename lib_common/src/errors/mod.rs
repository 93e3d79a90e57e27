//! # Diagnostics Module
//!
//! Every component of the engine reports its failures here instead of
//! propagating them. The tracker keeps the most recent events in a bounded,
//! newest-first buffer that operators can filter, acknowledge and summarise.

/// Bounded ring buffer of structured diagnostic events.
pub mod error_tracker;

pub use error_tracker::{
    DiagnosticEvent, ErrorFilter, ErrorStatistics, ErrorTracker, Severity,
};
