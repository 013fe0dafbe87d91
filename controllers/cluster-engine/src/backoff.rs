//! # Drain Backoff
//!
//! Exponential backoff for failed drains of reboot and repair queue entries.
//!
//! After `k` consecutive failures the next attempt is delayed by
//! `base · 2^(k−1)` seconds, capped at `max`, plus a uniform jitter in
//! `[0, base)` seconds.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Base delay in seconds
pub const DRAIN_BACKOFF_BASE_SECONDS: u64 = 60;
/// Maximum delay in seconds, before jitter
pub const DRAIN_BACKOFF_MAX_SECONDS: u64 = 1200;

/// Exponential drain backoff calculator
#[derive(Debug, Clone, Copy)]
pub struct DrainBackoff {
    base_seconds: u64,
    max_seconds: u64,
}

impl Default for DrainBackoff {
    fn default() -> Self {
        Self::new(DRAIN_BACKOFF_BASE_SECONDS, DRAIN_BACKOFF_MAX_SECONDS)
    }
}

impl DrainBackoff {
    /// Back-off starting at `base_seconds` and capped at `max_seconds`
    #[must_use]
    pub fn new(base_seconds: u64, max_seconds: u64) -> Self {
        Self {
            base_seconds,
            max_seconds,
        }
    }

    /// Delay before jitter for the `count`-th consecutive failure (1-indexed)
    #[must_use]
    pub fn delay(&self, count: u32) -> Duration {
        let exponent = count.saturating_sub(1).min(32);
        let seconds = self
            .base_seconds
            .saturating_mul(1_u64 << exponent)
            .min(self.max_seconds);
        Duration::from_secs(seconds)
    }

    /// Random jitter in `[0, base)`
    #[must_use]
    pub fn jitter(&self) -> Duration {
        if self.base_seconds == 0 {
            return Duration::ZERO;
        }
        let millis = rand::rng().random_range(0..self.base_seconds * 1000);
        Duration::from_millis(millis)
    }

    /// Bump `count` and compute the time the next attempt is allowed
    #[must_use]
    pub fn next(&self, count: u32, now: DateTime<Utc>) -> (u32, DateTime<Utc>) {
        let count = count.saturating_add(1);
        let wait = self.delay(count) + self.jitter();
        let wait = chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::MAX);
        (count, now + wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_backoff_sequence() {
        let backoff = DrainBackoff::default();

        // 60s, 120s, 240s, 480s, 960s, 1200s (max)
        assert_eq!(backoff.delay(1).as_secs(), 60);
        assert_eq!(backoff.delay(2).as_secs(), 120);
        assert_eq!(backoff.delay(3).as_secs(), 240);
        assert_eq!(backoff.delay(4).as_secs(), 480);
        assert_eq!(backoff.delay(5).as_secs(), 960);
        assert_eq!(backoff.delay(6).as_secs(), 1200);
        assert_eq!(backoff.delay(40).as_secs(), 1200);
    }

    #[test]
    fn test_drain_backoff_jitter_bounds() {
        let backoff = DrainBackoff::default();
        for _ in 0..100 {
            assert!(backoff.jitter() < Duration::from_secs(DRAIN_BACKOFF_BASE_SECONDS));
        }
        assert_eq!(DrainBackoff::new(0, 10).jitter(), Duration::ZERO);
    }

    #[test]
    fn test_drain_backoff_next_expiry() {
        let backoff = DrainBackoff::default();
        let now = Utc::now();

        let (count, expire) = backoff.next(2, now);
        assert_eq!(count, 3);
        let waited = (expire - now).num_seconds();
        assert!((240..300).contains(&waited), "waited {waited}s");
    }
}
