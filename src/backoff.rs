//! # Backoff Calculator
//!
//! Pure mapping from attempt number to retry delay. The growth curve is
//! exponential with a hard ceiling:
//!
//! ```text
//! delay(attempt) = min(base * 2^attempt, max)
//! ```
//!
//! An optional jitter of up to ±20% can be applied on top to spread retries
//! from many concurrent runs apart. Jitter never pushes a delay below zero;
//! it may exceed the ceiling by at most the jitter fraction.

use std::time::Duration;

use rand::Rng;

use crate::config::RecoveryConfig;

/// Exponential backoff policy with a delay ceiling and optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// First-attempt base delay.
    pub base: Duration,
    /// Delay ceiling before jitter.
    pub max: Duration,
    /// Jitter fraction in `0.0..=0.2`; `0.0` is fully deterministic.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Create a deterministic policy (no jitter).
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Add jitter of up to ±`jitter` (clamped to `0.0..=0.2`).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.2);
        self
    }

    /// Derive the policy from a [`RecoveryConfig`].
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            base: config.backoff_base,
            max: config.backoff_max,
            jitter: config.backoff_jitter.clamp(0.0, 0.2),
        }
    }

    /// Delay before re-dispatching after the given failed attempt (1-based).
    ///
    /// The exponent saturates so large attempt numbers cannot overflow; the
    /// result is capped at `max` before jitter is applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;

        let factor = 2u64.saturating_pow(attempt.min(63));
        let capped_ms = base_ms.saturating_mul(factor).min(max_ms);

        if self.jitter > 0.0 {
            let mut rng = rand::rng();
            let random_factor: f64 = rng.random_range(-1.0..=1.0);
            let jittered = capped_ms as f64 * (1.0 + self.jitter * random_factor);
            Duration::from_millis(jittered.max(0.0) as u64)
        } else {
            Duration::from_millis(capped_ms)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            max: Duration::from_millis(300_000),
            jitter: 0.0,
        }
    }
}
