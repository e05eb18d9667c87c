//! Reconnect backoff with jitter
//!
//! `delay = min(max, initial * 2^(attempt-1)) + jitter`. The attempt counter
//! increments on every failure and resets only after a successful connect.
//! Jitter is uniform in `[0, max_jitter)` so processes reconnecting after a
//! shared outage spread out.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    max_jitter: Duration,
    /// Failures since the last successful connect.
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            initial,
            max,
            max_jitter,
            attempt: 0,
        }
    }

    /// Base delay for a given attempt number (1-based), without jitter.
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        1u32.checked_shl(exponent)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.base_delay(self.attempt) + self.jitter()
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn jitter(&self) -> Duration {
        let bound = self.max_jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..bound))
    }
}
