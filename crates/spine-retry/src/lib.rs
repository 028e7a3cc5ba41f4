//! Exponential backoff with jitter, shared by every component that retries
//! something: the dispatcher (§4.3), the work-item queue (§4.5), and alert
//! delivery (§4.8). All three specify the same shape — `min(base *
//! 2^retry_count, cap)` plus one-sided jitter `U[0, 0.25 * delay)` — so one
//! policy type serves all of them, configured per lane or per channel.
//!
//! # Example
//!
//! ```
//! use spine_retry::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy {
//!     base_ms: 10,
//!     cap_ms: 1_000,
//!     max_retries: 2,
//! };
//! let delay = policy.delay_for(0);
//! assert_eq!(delay.base(), Duration::from_millis(10));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lane- or channel-scoped backoff configuration (§4.3, §6.4
/// `dispatcher.lanes.*.backoff`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^retry_count, cap)`, with the jitter bound attached but
    /// not yet sampled — callers that need determinism (tests, proptest
    /// properties) can inspect [`Delay::base`] without invoking the RNG.
    pub fn delay_for(&self, retry_count: u32) -> Delay {
        let exp = retry_count.min(32);
        let scaled = self.base_ms.saturating_mul(1u64 << exp.min(63));
        let base = scaled.min(self.cap_ms);
        Delay {
            base: Duration::from_millis(base),
        }
    }

    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

/// An un-jittered delay, with jitter sampled lazily so the base value stays
/// testable without randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delay {
    base: Duration,
}

impl Delay {
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Sample `base + U[0, 0.25 * base)` per §4.3's jitter rule.
    pub fn with_jitter(&self) -> Duration {
        use rand::Rng;
        let quarter = self.base.as_millis() as f64 * 0.25;
        if quarter <= 0.0 {
            return self.base;
        }
        let mut rng = rand::rng();
        let extra_ms = rng.random_range(0.0..quarter);
        self.base + Duration::from_millis(extra_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_then_caps() {
        let policy = BackoffPolicy {
            base_ms: 10,
            cap_ms: 100,
            max_retries: 10,
        };
        assert_eq!(policy.delay_for(0).base(), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1).base(), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2).base(), Duration::from_millis(40));
        assert_eq!(policy.delay_for(10).base(), Duration::from_millis(100));
    }

    #[test]
    fn exhausted_at_max_retries() {
        let policy = BackoffPolicy {
            base_ms: 10,
            cap_ms: 1_000,
            max_retries: 2,
        };
        assert!(!policy.exhausted(1));
        assert!(policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[test]
    fn jitter_stays_within_quarter_bound() {
        let policy = BackoffPolicy {
            base_ms: 1_000,
            cap_ms: 10_000,
            max_retries: 5,
        };
        let delay = policy.delay_for(1);
        for _ in 0..200 {
            let jittered = delay.with_jitter();
            assert!(jittered >= delay.base());
            assert!(jittered < delay.base() + Duration::from_millis(500));
        }
    }
}
