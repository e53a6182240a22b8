//! In-memory delay queue backend.
//!
//! The default backend for single-process deployments and tests. Entries live
//! in two sets: `pending` (waiting for their due time) and `leased` (polled,
//! awaiting ack). Both are guarded by one mutex; no operation holds the lock
//! across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{DelayQueue, LeasedEntry};
use crate::error::RedriveResult;

struct Lease {
    execute_at: i64,
    token: u64,
    deadline: i64,
}

#[derive(Default)]
struct Inner {
    /// key -> due time (epoch millis); upsert keeps at most one per key.
    pending: HashMap<String, i64>,
    /// key -> in-flight lease.
    leased: HashMap<String, Lease>,
    next_token: u64,
}

/// In-memory [`DelayQueue`] with lease-based delivery.
#[derive(Clone)]
pub struct MemoryDelayQueue {
    inner: Arc<Mutex<Inner>>,
    lease_timeout: Duration,
}

impl MemoryDelayQueue {
    /// Create a queue whose leases expire `lease_timeout` after the poll
    /// timestamp.
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            lease_timeout,
        }
    }

    /// Move expired leases back into the pending set.
    ///
    /// A key re-added while its old lease was in flight keeps the newer
    /// pending entry; the stale lease is simply dropped.
    fn reclaim_expired(inner: &mut Inner, now: i64) {
        let expired: Vec<String> = inner
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(lease) = inner.leased.remove(&key) {
                debug!(key = %key, "Reclaiming expired retry lease");
                inner.pending.entry(key).or_insert(lease.execute_at);
            }
        }
    }
}

impl Default for MemoryDelayQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(30_000))
    }
}

#[async_trait]
impl DelayQueue for MemoryDelayQueue {
    async fn add(&self, key: &str, execute_at: i64) -> RedriveResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.insert(key.to_string(), execute_at);
        Ok(())
    }

    async fn poll_due(&self, max_timestamp: i64, limit: usize) -> RedriveResult<Vec<LeasedEntry>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::reclaim_expired(&mut inner, max_timestamp);

        let mut due: Vec<(String, i64)> = inner
            .pending
            .iter()
            .filter(|&(_, &at)| at <= max_timestamp)
            .map(|(key, &at)| (key.clone(), at))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        due.truncate(limit);

        let deadline = max_timestamp + self.lease_timeout.as_millis() as i64;
        let mut leased = Vec::with_capacity(due.len());
        for (key, execute_at) in due {
            inner.pending.remove(&key);
            inner.next_token += 1;
            let token = inner.next_token;
            inner.leased.insert(
                key.clone(),
                Lease {
                    execute_at,
                    token,
                    deadline,
                },
            );
            leased.push(LeasedEntry {
                key,
                execute_at,
                lease_token: token,
                lease_deadline: deadline,
            });
        }
        Ok(leased)
    }

    async fn ack(&self, entry: &LeasedEntry) -> RedriveResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let matches = inner
            .leased
            .get(&entry.key)
            .is_some_and(|lease| lease.token == entry.lease_token);
        if matches {
            inner.leased.remove(&entry.key);
        }
        Ok(matches)
    }

    async fn pending_len(&self) -> RedriveResult<usize> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MemoryDelayQueue {
        MemoryDelayQueue::new(Duration::from_millis(5_000))
    }

    #[tokio::test]
    async fn test_due_entries_respect_timestamps() {
        let q = queue();
        let t0 = 1_000_000;
        q.add("run-1:embed", t0 + 10_000).await.unwrap();

        // not yet due
        assert!(q.poll_due(t0, 50).await.unwrap().is_empty());
        // due one second after the scheduled instant
        let due = q.poll_due(t0 + 11_000, 50).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "run-1:embed");
        assert_eq!(due[0].execute_at, t0 + 10_000);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_entry() {
        let q = queue();
        q.add("run-1:embed", 1_000).await.unwrap();
        q.add("run-1:embed", 9_000).await.unwrap();

        assert_eq!(q.pending_len().await.unwrap(), 1);
        assert!(q.poll_due(2_000, 50).await.unwrap().is_empty());
        let due = q.poll_due(9_000, 50).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].execute_at, 9_000);
    }

    #[tokio::test]
    async fn test_poll_is_bounded_and_ordered() {
        let q = queue();
        for i in 0..10 {
            q.add(&format!("run-{i}:n"), 100 + i).await.unwrap();
        }

        let first = q.poll_due(1_000, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let scores: Vec<i64> = first.iter().map(|e| e.execute_at).collect();
        assert_eq!(scores, vec![100, 101, 102]);

        // remaining entries still pending
        assert_eq!(q.pending_len().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_acked_entry_is_gone() {
        let q = queue();
        q.add("run-1:embed", 100).await.unwrap();

        let due = q.poll_due(1_000, 50).await.unwrap();
        assert!(q.ack(&due[0]).await.unwrap());

        // neither pending nor redelivered, even after the lease window
        assert!(q.poll_due(100_000, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_entry_redelivers_after_lease_expiry() {
        let q = queue();
        q.add("run-1:embed", 100).await.unwrap();

        let first = q.poll_due(1_000, 50).await.unwrap();
        assert_eq!(first.len(), 1);

        // within the lease window the entry is invisible
        assert!(q.poll_due(2_000, 50).await.unwrap().is_empty());

        // past the deadline it is reclaimed and delivered again
        let redelivered = q.poll_due(1_000 + 6_000, 50).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].key, "run-1:embed");
        assert_ne!(redelivered[0].lease_token, first[0].lease_token);

        // the stale lease can no longer be acked
        assert!(!q.ack(&first[0]).await.unwrap());
        // the fresh one can
        assert!(q.ack(&redelivered[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_re_add_during_lease_wins_over_reclaim() {
        let q = queue();
        q.add("run-1:embed", 100).await.unwrap();
        let first = q.poll_due(1_000, 50).await.unwrap();

        // a new retry is scheduled while the old delivery is in flight
        q.add("run-1:embed", 50_000).await.unwrap();

        // reclaim keeps the newer pending entry
        let polled = q.poll_due(1_000 + 6_000, 50).await.unwrap();
        assert!(polled.is_empty());
        let due = q.poll_due(50_000, 50).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].execute_at, 50_000);

        // stale ack for the first lease is rejected
        assert!(!q.ack(&first[0]).await.unwrap());
    }
}
