//! # Circuit Breaker Registry - Per-Node Failure Isolation
//!
//! One breaker per node identifier, shared across every run that touches the
//! node. Repeated failures trip the breaker open, which refuses all dispatch
//! for that node; after a cooldown the breaker admits exactly one trial
//! dispatch, and the trial's outcome decides whether the node is healthy
//! again.
//!
//! ## State Machine
//!
//! ```text
//! Closed --(threshold failures in window)--> Open
//! Open --(cooldown elapsed)--> HalfOpen
//! HalfOpen --(trial success)--> Closed (failure count reset)
//! HalfOpen --(trial failure)--> Open (cooldown restarts)
//! ```
//!
//! Failure counting is *consecutive within a rolling window*: a success while
//! closed resets the count, and a failure that arrives after the window has
//! passed since the previous one starts the count over.
//!
//! ## 🔒 Thread Safety
//!
//! The registry is a `HashMap` behind a `Mutex`; every operation takes the
//! lock briefly and never across an await point. Time-based transitions
//! (open → half-open) are applied lazily on access, so no background timer
//! is needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::RecoveryConfig;

/// Breaker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; dispatch admitted.
    Closed,
    /// Failure threshold exceeded; dispatch refused.
    Open,
    /// Cooldown elapsed; one trial dispatch admitted.
    HalfOpen,
}

/// Point-in-time view of one node's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Whether dispatch for the node is currently refused.
    pub open: bool,
    /// Consecutive failure count.
    pub failure_count: u32,
    /// Full state, for observability.
    pub state: CircuitState,
}

impl BreakerSnapshot {
    /// Snapshot of an untouched (closed, zero-failure) breaker.
    pub fn closed() -> Self {
        Self {
            open: false,
            failure_count: 0,
            state: CircuitState::Closed,
        }
    }
}

/// Outcome of asking the breaker whether a dispatch may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPermit {
    /// Breaker closed; dispatch normally.
    Allowed,
    /// Breaker half-open; this is the single trial dispatch.
    Trial,
    /// Breaker open (or a trial is already in flight); do not dispatch.
    Refused,
}

struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerEntry {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Apply the lazy open → half-open transition if the cooldown elapsed.
    fn advance(&mut self, cooldown: Duration) {
        if self.state == CircuitState::Open {
            let elapsed = self
                .opened_at
                .map(|at| at.elapsed() >= cooldown)
                .unwrap_or(true);
            if elapsed {
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = false;
            }
        }
    }
}

/// Registry of per-node circuit breakers.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    window: Duration,
    breakers: Arc<Mutex<HashMap<String, BreakerEntry>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry tripping after `threshold` consecutive failures and
    /// cooling down for `cooldown` before a trial dispatch.
    pub fn new(threshold: u32, cooldown: Duration, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            window,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Derive the registry from a [`RecoveryConfig`].
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown,
            config.circuit_breaker_window,
        )
    }

    /// Current state for a node; unseen nodes read as closed with zero
    /// failures. Open breakers whose cooldown elapsed surface as half-open.
    pub fn snapshot(&self, node_id: &str) -> BreakerSnapshot {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = breakers.get_mut(node_id) else {
            return BreakerSnapshot::closed();
        };
        entry.advance(self.cooldown);
        BreakerSnapshot {
            open: entry.state == CircuitState::Open,
            failure_count: entry.failure_count,
            state: entry.state,
        }
    }

    /// Ask whether a dispatch for the node may proceed.
    ///
    /// Half-open breakers admit exactly one trial: the first caller gets
    /// [`DispatchPermit::Trial`], every caller after it is refused until the
    /// trial resolves via [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self, node_id: &str) -> DispatchPermit {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = breakers.get_mut(node_id) else {
            return DispatchPermit::Allowed;
        };
        entry.advance(self.cooldown);

        match entry.state {
            CircuitState::Closed => DispatchPermit::Allowed,
            CircuitState::Open => DispatchPermit::Refused,
            CircuitState::HalfOpen => {
                if entry.trial_in_flight {
                    DispatchPermit::Refused
                } else {
                    entry.trial_in_flight = true;
                    DispatchPermit::Trial
                }
            }
        }
    }

    /// Record a failure for the node and return the updated snapshot.
    ///
    /// While closed, increments the consecutive count (restarting it when the
    /// previous failure fell outside the rolling window) and trips the
    /// breaker at the threshold. While half-open, a failure reopens the
    /// breaker and restarts the cooldown.
    pub fn record_failure(&self, node_id: &str) -> BreakerSnapshot {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = breakers
            .entry(node_id.to_string())
            .or_insert_with(BreakerEntry::closed);
        entry.advance(self.cooldown);

        let now = Instant::now();
        match entry.state {
            CircuitState::Closed => {
                let window_expired = entry
                    .last_failure_at
                    .is_some_and(|at| now.duration_since(at) > self.window);
                if window_expired {
                    entry.failure_count = 0;
                }
                entry.failure_count += 1;
                entry.last_failure_at = Some(now);

                if entry.failure_count >= self.threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(now);
                    warn!(
                        node_id,
                        failures = entry.failure_count,
                        "Circuit breaker tripped open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                entry.failure_count += 1;
                entry.last_failure_at = Some(now);
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                entry.trial_in_flight = false;
                warn!(node_id, "Trial dispatch failed, circuit breaker reopened");
            }
            CircuitState::Open => {
                // already refusing dispatch; keep counting for observability
                entry.failure_count += 1;
                entry.last_failure_at = Some(now);
            }
        }

        BreakerSnapshot {
            open: entry.state == CircuitState::Open,
            failure_count: entry.failure_count,
            state: entry.state,
        }
    }

    /// Record a success for the node.
    ///
    /// A half-open trial success closes the breaker and resets the failure
    /// count; a success while closed resets the consecutive count.
    pub fn record_success(&self, node_id: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = breakers.get_mut(node_id) else {
            return;
        };
        entry.advance(self.cooldown);

        match entry.state {
            CircuitState::HalfOpen => {
                info!(node_id, "Trial dispatch succeeded, circuit breaker closed");
                *entry = BreakerEntry::closed();
            }
            CircuitState::Closed => {
                entry.failure_count = 0;
                entry.last_failure_at = None;
            }
            // a success report while open refers to an execution that started
            // before the trip; the breaker state is left alone
            CircuitState::Open => {}
        }
    }

    /// Forcibly reset a node's breaker to closed.
    pub fn reset(&self, node_id: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.insert(node_id.to_string(), BreakerEntry::closed());
    }
}
