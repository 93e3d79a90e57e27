//! # Relay Engine Configuration
//!
//! Typed configuration for every component of the engine. All timings are
//! plain milliseconds so the structs deserialize straight from JSON, and every
//! `Default` carries the production constants. Tests shrink them to run the
//! engine on an accelerated clock.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for the OAuth2 token lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenConfig {
    /// A credential expiring within this window is refreshed before use.
    pub refresh_margin_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 60,
        }
    }
}

impl TokenConfig {
    pub fn refresh_margin(&self) -> chrono::Duration {
        i64::try_from(self.refresh_margin_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Settings for the streaming socket and its reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// Delay before the first reconnect attempt.
    pub reconnect_base_delay_ms: u64,
    /// Multiplier applied for every further consecutive failure.
    pub reconnect_growth_factor: f64,
    /// Consecutive failures tolerated before the session gives up.
    pub reconnect_max_attempts: u32,
    /// Capacity of the session notification channel.
    pub event_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 5_000,
            reconnect_growth_factor: 1.5,
            reconnect_max_attempts: 10,
            event_buffer: 64,
        }
    }
}

impl StreamConfig {
    /// Longest wait between two reconnect attempts, whatever the growth.
    pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(3_600);

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms).min(Self::MAX_RECONNECT_DELAY)
    }

    /// The growth factor, or `1.0` when the configured one is not a finite
    /// number of at least one.
    pub fn growth_factor(&self) -> f64 {
        if self.reconnect_growth_factor.is_finite() && self.reconnect_growth_factor >= 1.0 {
            self.reconnect_growth_factor
        } else {
            1.0
        }
    }
}

/// Settings for the health monitor cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    /// Time between the issuance of two check cycles.
    pub check_interval_ms: u64,
    /// Upper bound for a single component check. Never longer than the interval.
    pub check_timeout_ms: u64,
    /// Capacity of the state-change notification channel.
    pub event_buffer: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            check_timeout_ms: 5_000,
            event_buffer: 64,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    /// The per-check timeout, clamped to the check interval.
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms.clamp(1, self.check_interval_ms.max(1)))
    }
}

/// Settings for the diagnostic buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    /// Maximum number of events kept; the oldest are evicted beyond it.
    pub capacity: usize,
    /// Capacity of the new-event notification channel.
    pub notify_buffer: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            notify_buffer: 256,
        }
    }
}

/// # Relay Configuration
///
/// The complete engine configuration handed to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub token: TokenConfig,
    pub stream: StreamConfig,
    pub health: HealthConfig,
    pub tracker: TrackerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_constants() {
        let config = RelayConfig::default();
        assert_eq!(config.token.refresh_margin_secs, 60);
        assert_eq!(config.stream.reconnect_base_delay(), Duration::from_secs(5));
        assert_eq!(config.stream.reconnect_growth_factor, 1.5);
        assert_eq!(config.stream.reconnect_max_attempts, 10);
        assert_eq!(config.health.check_interval(), Duration::from_secs(5));
        assert_eq!(config.tracker.capacity, 1_000);
    }

    #[test]
    fn check_timeout_never_exceeds_interval() {
        let health = HealthConfig {
            check_interval_ms: 1_000,
            check_timeout_ms: 30_000,
            ..Default::default()
        };
        assert_eq!(health.check_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_growth_factors_fall_back_to_constant_backoff() {
        for factor in [-1.5, 0.5, f64::NAN, f64::INFINITY] {
            let config = StreamConfig {
                reconnect_growth_factor: factor,
                ..Default::default()
            };
            assert_eq!(config.growth_factor(), 1.0, "factor={factor}");
        }
        assert_eq!(StreamConfig::default().growth_factor(), 1.5);
    }

    #[test]
    fn oversized_refresh_margin_saturates() {
        let config = TokenConfig {
            refresh_margin_secs: u64::MAX,
        };
        assert_eq!(config.refresh_margin(), chrono::Duration::MAX);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"stream":{"reconnectMaxAttempts":3}}"#).expect("parse");
        assert_eq!(config.stream.reconnect_max_attempts, 3);
        assert_eq!(config.stream.reconnect_base_delay_ms, 5_000);
        assert_eq!(config.health, HealthConfig::default());
    }
}
