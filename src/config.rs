//! # Recovery Configuration
//!
//! [`RecoveryConfig`] is the single configuration surface for the dispatch
//! and recovery core. It is built once at process start and passed down by
//! value to the components that need it; there is no global state.
//!
//! ## 🚀 Quick Start
//!
//! ```rust
//! use redrive::prelude::*;
//! use tokio::time::Duration;
//!
//! let config = RecoveryConfig::new()
//!     .with_circuit_breaker(3, Duration::from_secs(10))
//!     .with_backoff(Duration::from_millis(500), Duration::from_secs(60))
//!     .with_human_review_threshold(ReviewThreshold::Critical);
//! ```
//!
//! All durations default to production-sensible values; tests typically
//! shrink them to keep wall-clock time down.

use std::time::Duration;

/// When failures are escalated to a human reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewThreshold {
    /// Never escalate based on severity alone.
    None,
    /// Escalate any unrecovered error.
    #[default]
    Error,
    /// Escalate only security failures.
    Critical,
}

/// Configuration for retry scheduling, circuit breaking and escalation.
///
/// Grouped by concern:
///
/// | Options | Concern |
/// |---------|---------|
/// | `circuit_breaker_threshold`, `circuit_breaker_cooldown`, `circuit_breaker_window` | Per-node failure isolation |
/// | `backoff_base`, `backoff_max`, `backoff_jitter` | Retry delay growth |
/// | `retry_poll_interval`, `retry_batch_size`, `retry_lease_timeout` | Delay queue draining |
/// | `task_cleanup_interval`, `task_retention` | Registry pruning |
/// | `human_review_threshold` | Escalation policy |
///
/// The per-task attempt ceiling lives on
/// [`RetryPolicy`](crate::task::RetryPolicy), not here.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Consecutive failures that trip a node's breaker open.
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker refuses dispatch before going half-open.
    pub circuit_breaker_cooldown: Duration,
    /// Rolling window within which failures count as consecutive.
    pub circuit_breaker_window: Duration,
    /// When unrecovered errors are escalated to a human.
    pub human_review_threshold: ReviewThreshold,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
    /// Jitter fraction applied to computed delays, clamped to `0.0..=0.2`.
    pub backoff_jitter: f64,
    /// How often the retry poller drains the delay queue.
    pub retry_poll_interval: Duration,
    /// Maximum due entries drained per poller tick.
    pub retry_batch_size: usize,
    /// How long a polled entry stays leased before it is redelivered.
    pub retry_lease_timeout: Duration,
    /// How often the registry cleanup pass runs.
    pub task_cleanup_interval: Duration,
    /// How long terminal registry entries are kept before pruning.
    pub task_retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_millis(30_000),
            circuit_breaker_window: Duration::from_millis(60_000),
            human_review_threshold: ReviewThreshold::Error,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(300_000),
            backoff_jitter: 0.0,
            retry_poll_interval: Duration::from_millis(5_000),
            retry_batch_size: 50,
            retry_lease_timeout: Duration::from_millis(30_000),
            task_cleanup_interval: Duration::from_millis(60_000),
            task_retention: Duration::from_millis(3_600_000),
        }
    }
}

impl RecoveryConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the circuit breaker trip threshold and cooldown.
    pub fn with_circuit_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_cooldown = cooldown;
        self
    }

    /// Set the rolling window for consecutive-failure counting.
    pub fn with_circuit_breaker_window(mut self, window: Duration) -> Self {
        self.circuit_breaker_window = window;
        self
    }

    /// Set the backoff base delay and ceiling.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Set the backoff jitter fraction (clamped to `0.0..=0.2`).
    pub fn with_backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter.clamp(0.0, 0.2);
        self
    }

    /// Set the escalation threshold.
    pub fn with_human_review_threshold(mut self, threshold: ReviewThreshold) -> Self {
        self.human_review_threshold = threshold;
        self
    }

    /// Set the retry poller cadence and batch bound.
    pub fn with_retry_polling(mut self, interval: Duration, batch_size: usize) -> Self {
        self.retry_poll_interval = interval;
        self.retry_batch_size = batch_size;
        self
    }

    /// Set how long polled entries stay leased before redelivery.
    pub fn with_retry_lease_timeout(mut self, timeout: Duration) -> Self {
        self.retry_lease_timeout = timeout;
        self
    }

    /// Set the registry cleanup cadence and retention window.
    pub fn with_task_cleanup(mut self, interval: Duration, retention: Duration) -> Self {
        self.task_cleanup_interval = interval;
        self.task_retention = retention;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_cooldown, Duration::from_secs(30));
        assert_eq!(config.human_review_threshold, ReviewThreshold::Error);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(300));
        assert_eq!(config.retry_poll_interval, Duration::from_secs(5));
        assert_eq!(config.retry_batch_size, 50);
        assert_eq!(config.task_retention, Duration::from_secs(3600));
    }

    #[test]
    fn test_builder_chain() {
        let config = RecoveryConfig::new()
            .with_circuit_breaker(2, Duration::from_millis(50))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(80))
            .with_retry_polling(Duration::from_millis(20), 5)
            .with_human_review_threshold(ReviewThreshold::None);

        assert_eq!(config.circuit_breaker_threshold, 2);
        assert_eq!(config.backoff_max, Duration::from_millis(80));
        assert_eq!(config.retry_batch_size, 5);
        assert_eq!(config.human_review_threshold, ReviewThreshold::None);
    }

    #[test]
    fn test_jitter_clamped() {
        let config = RecoveryConfig::new().with_backoff_jitter(0.9);
        assert_eq!(config.backoff_jitter, 0.2);

        let config = RecoveryConfig::new().with_backoff_jitter(-1.0);
        assert_eq!(config.backoff_jitter, 0.0);
    }
}
