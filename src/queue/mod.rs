//! # Delay Queue - Durable, Time-Ordered Retry Storage
//!
//! The delay queue holds pending retries keyed by `run_id:node_id`, scored by
//! the epoch-millis instant at which the retry becomes due. Scheduling a new
//! retry for a pair replaces any existing entry, so there is at most one
//! pending retry per node per run.
//!
//! ## 🎯 Delivery Semantics
//!
//! Polling *leases* due entries instead of deleting them: each polled entry
//! carries a lease token and a deadline, and stays invisible until either the
//! consumer [`ack`](DelayQueue::ack)s it (confirmed downstream hand-off,
//! entry deleted) or the deadline passes (entry reclaimed and redelivered).
//! A crash between polling and publishing therefore re-delivers the retry
//! instead of losing it - delivery is at-least-once.
//!
//! The bundled [`MemoryDelayQueue`] keeps everything in process memory.
//! Durable backends (a sorted-set store, a database table) implement the same
//! trait; the scheduler and poller only see the trait.

pub mod memory;

use async_trait::async_trait;

use crate::error::{RedriveError, RedriveResult};
use crate::task::ID_SEPARATOR;

pub use memory::MemoryDelayQueue;

/// A pending retry for one `(run_id, node_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryQueueEntry {
    pub run_id: String,
    pub node_id: String,
    /// Epoch millis at which the retry becomes due.
    pub execute_at: i64,
}

impl RetryQueueEntry {
    /// The queue key for this pair.
    pub fn key(&self) -> String {
        format!("{}{ID_SEPARATOR}{}", self.run_id, self.node_id)
    }
}

/// A due entry handed out by [`DelayQueue::poll_due`], valid until its lease
/// deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedEntry {
    /// The `run_id:node_id` queue key.
    pub key: String,
    /// The score the entry was stored under.
    pub execute_at: i64,
    /// Token tying an ack to this specific delivery.
    pub lease_token: u64,
    /// Epoch millis after which the entry is reclaimed and redelivered.
    pub lease_deadline: i64,
}

impl LeasedEntry {
    /// Split the key into `(run_id, node_id)`.
    ///
    /// Returns `None` for keys that do not contain a separator or have an
    /// empty segment; the poller drops such entries with a warning.
    pub fn parse_key(&self) -> Option<(&str, &str)> {
        let (run_id, node_id) = self.key.split_once(ID_SEPARATOR)?;
        if run_id.is_empty() || node_id.is_empty() {
            return None;
        }
        Some((run_id, node_id))
    }
}

/// Time-ordered store of pending retries.
///
/// Implementations must provide atomic upsert and an atomic poll-and-lease;
/// see the module docs for the delivery contract.
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// Insert or replace the entry for `key`, due at `execute_at` (epoch
    /// millis).
    async fn add(&self, key: &str, execute_at: i64) -> RedriveResult<()>;

    /// Lease up to `limit` entries with `execute_at <= max_timestamp`,
    /// ordered by score. Leases expire `retry_lease_timeout` after
    /// `max_timestamp`; expired leases from earlier polls are reclaimed
    /// first.
    async fn poll_due(&self, max_timestamp: i64, limit: usize) -> RedriveResult<Vec<LeasedEntry>>;

    /// Delete a leased entry after its retry has been handed off downstream.
    ///
    /// Returns `false` for stale acks (the lease already expired and the
    /// entry was redelivered, or the key was re-added in the meantime).
    async fn ack(&self, entry: &LeasedEntry) -> RedriveResult<bool>;

    /// Number of entries currently pending (leased entries excluded).
    async fn pending_len(&self) -> RedriveResult<usize>;
}

/// Build the queue key for a pair, validating the segments.
///
/// The run id must not contain the separator; the node id may (only the
/// first separator splits on the way back out).
pub fn queue_key(run_id: &str, node_id: &str) -> RedriveResult<String> {
    if run_id.is_empty() || node_id.is_empty() {
        return Err(RedriveError::queue("Queue key segments must be non-empty"));
    }
    if run_id.contains(ID_SEPARATOR) {
        return Err(RedriveError::queue(format!(
            "Run id '{run_id}' must not contain '{ID_SEPARATOR}'"
        )));
    }
    Ok(format!("{run_id}{ID_SEPARATOR}{node_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_validation() {
        assert_eq!(queue_key("run-1", "embed").unwrap(), "run-1:embed");
        assert!(queue_key("", "embed").is_err());
        assert!(queue_key("run-1", "").is_err());
        assert!(queue_key("run:1", "embed").is_err());
    }

    #[test]
    fn test_parse_key() {
        let entry = LeasedEntry {
            key: "run-1:embed".to_string(),
            execute_at: 0,
            lease_token: 1,
            lease_deadline: 0,
        };
        assert_eq!(entry.parse_key(), Some(("run-1", "embed")));

        let malformed = LeasedEntry {
            key: "no-separator".to_string(),
            ..entry.clone()
        };
        assert_eq!(malformed.parse_key(), None);

        let empty_node = LeasedEntry {
            key: "run-1:".to_string(),
            ..entry
        };
        assert_eq!(empty_node.parse_key(), None);
    }
}
