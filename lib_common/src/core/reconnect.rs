//! # Reconnect Policy
//!
//! Exponential backoff for the streaming socket. The n-th consecutive close
//! waits `base × growth^(n-1)` before the next attempt; once the ceiling is
//! passed every further close is answered with `Exhausted` until the counter
//! is reset by a successful open or by creating a fresh policy. Delays
//! saturate at [`StreamConfig::MAX_RECONNECT_DELAY`].

use std::time::Duration;

use crate::configs::StreamConfig;

/// What to do after the socket closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectDecision {
    /// Try again after `delay`; `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// The ceiling was reached; no more automatic attempts.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    growth_factor: f64,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &StreamConfig) -> Self {
        let growth_factor = config.growth_factor();
        if growth_factor != config.reconnect_growth_factor {
            log::warn!(
                "Ignoring reconnect growth factor {}, using {}",
                config.reconnect_growth_factor,
                growth_factor
            );
        }
        Self {
            base_delay: config.reconnect_base_delay(),
            growth_factor,
            max_attempts: config.reconnect_max_attempts,
            attempts: 0,
        }
    }

    /// The socket reported open.
    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// The socket closed, cleanly or not.
    pub fn on_close(&mut self) -> ReconnectDecision {
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.delay_for(self.attempts),
        }
    }

    /// Backoff before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.growth_factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(StreamConfig::MAX_RECONNECT_DELAY)
            .min(StreamConfig::MAX_RECONNECT_DELAY)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twelve_closes_schedule_ten_retries_then_exhaust() {
        let mut policy = ReconnectPolicy::new(&StreamConfig::default());
        let decisions: Vec<ReconnectDecision> = (0..12).map(|_| policy.on_close()).collect();

        let retries = decisions
            .iter()
            .filter(|d| matches!(d, ReconnectDecision::Retry { .. }))
            .count();
        assert_eq!(retries, 10);
        assert_eq!(decisions[10], ReconnectDecision::Exhausted { attempts: 10 });
        assert_eq!(decisions[11], ReconnectDecision::Exhausted { attempts: 10 });
        assert!(policy.is_exhausted());
    }

    #[test]
    fn delay_grows_geometrically_from_base() {
        let mut policy = ReconnectPolicy::new(&StreamConfig::default());
        let expected_ms = [5_000u128, 7_500, 11_250, 16_875];
        for (n, expected) in expected_ms.iter().enumerate() {
            match policy.on_close() {
                ReconnectDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt as usize, n + 1);
                    assert_eq!(delay.as_millis(), *expected);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn long_ceilings_saturate_the_delay() {
        let mut policy = ReconnectPolicy::new(&StreamConfig {
            reconnect_max_attempts: 200,
            ..Default::default()
        });
        let mut last = Duration::ZERO;
        for _ in 0..200 {
            match policy.on_close() {
                ReconnectDecision::Retry { delay, .. } => {
                    assert!(delay >= last);
                    assert!(delay <= StreamConfig::MAX_RECONNECT_DELAY);
                    last = delay;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(last, StreamConfig::MAX_RECONNECT_DELAY);
        assert_eq!(policy.on_close(), ReconnectDecision::Exhausted { attempts: 200 });
        assert_eq!(policy.delay_for(u32::MAX), StreamConfig::MAX_RECONNECT_DELAY);
    }

    #[test]
    fn negative_growth_keeps_a_constant_delay() {
        let mut policy = ReconnectPolicy::new(&StreamConfig {
            reconnect_growth_factor: -1.5,
            ..Default::default()
        });
        for attempt in 1..=10 {
            assert_eq!(
                policy.on_close(),
                ReconnectDecision::Retry {
                    attempt,
                    delay: Duration::from_secs(5)
                }
            );
        }
    }

    #[test]
    fn open_resets_the_counter() {
        let mut policy = ReconnectPolicy::new(&StreamConfig::default());
        policy.on_close();
        policy.on_close();
        policy.on_open();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(
            policy.on_close(),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(5)
            }
        );
    }
}
