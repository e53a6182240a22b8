//! # Retry Poller - Draining Due Retries Back Into Scheduling
//!
//! A single background loop that periodically pulls due entries from the
//! [`DelayQueue`](crate::queue::DelayQueue) and publishes one retry-trigger
//! event per entry. The workflow-run collaborator consumes those events and
//! re-invokes `schedule_task` with an incremented attempt.
//!
//! ## Failure Containment
//!
//! Every entry is processed independently:
//! - a malformed key (not `run_id:node_id`) is warn-logged and acked away,
//! - a failed publish is error-logged and left on its lease, so it
//!   redelivers after the lease deadline,
//! - a poll error skips the tick.
//!
//! Nothing a single entry does can halt the batch or stop the loop.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::RecoveryConfig;
use crate::error::{RedriveError, RedriveResult};
use crate::queue::{DelayQueue, LeasedEntry};
use crate::services::EventPublisher;

/// Periodic task that funnels due delay-queue entries into retry events.
pub struct RetryPoller {
    queue: Arc<dyn DelayQueue>,
    publisher: Arc<dyn EventPublisher>,
    config: RecoveryConfig,
    running: Arc<RwLock<bool>>,
}

impl RetryPoller {
    /// Wire a poller from its collaborators.
    pub fn new(
        queue: Arc<dyn DelayQueue>,
        publisher: Arc<dyn EventPublisher>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            queue,
            publisher,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the polling loop.
    pub async fn start(&mut self) -> RedriveResult<()> {
        if *self.running.read().await {
            return Err(RedriveError::configuration("Retry poller already running"));
        }
        *self.running.write().await = true;

        let queue = Arc::clone(&self.queue);
        let publisher = Arc::clone(&self.publisher);
        let running = Arc::clone(&self.running);
        let poll_interval = self.config.retry_poll_interval;
        let batch_size = self.config.retry_batch_size;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }

                let now = Utc::now().timestamp_millis();
                if let Err(err) =
                    Self::drain_once(queue.as_ref(), publisher.as_ref(), now, batch_size).await
                {
                    error!(error = %err, "Retry poll tick failed");
                }
            }
        });
        Ok(())
    }

    /// Stop the polling loop. Leased but unpublished entries redeliver once
    /// their lease expires, on this process or another.
    pub async fn stop(&mut self) {
        *self.running.write().await = false;
    }

    /// Drain one batch of due entries as of `now` (epoch millis).
    ///
    /// Exposed for deterministic draining in tests and for schedulers that
    /// want to pump retries manually. Returns how many retry triggers were
    /// published and acked.
    pub async fn drain_once(
        queue: &dyn DelayQueue,
        publisher: &dyn EventPublisher,
        now: i64,
        batch_size: usize,
    ) -> RedriveResult<usize> {
        let due = queue.poll_due(now, batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Draining due retry entries");

        // split out malformed keys first; they are dropped, not retried
        let mut deliverable: Vec<(LeasedEntry, String, String)> = Vec::with_capacity(due.len());
        for entry in due {
            match entry.parse_key() {
                Some((run_id, node_id)) => {
                    let run_id = run_id.to_string();
                    let node_id = node_id.to_string();
                    deliverable.push((entry, run_id, node_id));
                }
                None => {
                    warn!(key = %entry.key, "Dropping malformed retry queue entry");
                    let _ = queue.ack(&entry).await;
                }
            }
        }

        let publishes = deliverable.iter().map(|(_, run_id, node_id)| {
            publisher.publish_retry(run_id.as_str(), node_id.as_str())
        });
        let outcomes = join_all(publishes).await;

        let mut published = 0;
        for ((entry, run_id, node_id), outcome) in deliverable.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    if queue.ack(entry).await? {
                        published += 1;
                    }
                    debug!(run_id, node_id, "Retry trigger published");
                }
                Err(err) => {
                    // leave the lease in place; the entry redelivers later
                    error!(
                        run_id,
                        node_id,
                        error = %err,
                        "Retry trigger publish failed, entry will redeliver"
                    );
                }
            }
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryDelayQueue;
    use crate::services::SchedulerEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPublisher {
        retries: Mutex<Vec<(String, String)>>,
        fail_runs: Vec<String>,
    }

    impl RecordingPublisher {
        fn failing_for(run_id: &str) -> Self {
            Self {
                retries: Mutex::new(Vec::new()),
                fail_runs: vec![run_id.to_string()],
            }
        }

        fn recorded(&self) -> Vec<(String, String)> {
            self.retries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, _events: &[SchedulerEvent]) -> RedriveResult<()> {
            Ok(())
        }

        async fn publish_retry(&self, run_id: &str, node_id: &str) -> RedriveResult<()> {
            if self.fail_runs.iter().any(|r| r == run_id) {
                return Err(RedriveError::generic("bus unavailable"));
            }
            self.retries
                .lock()
                .unwrap()
                .push((run_id.to_string(), node_id.to_string()));
            Ok(())
        }
    }

    fn queue() -> MemoryDelayQueue {
        MemoryDelayQueue::new(Duration::from_millis(5_000))
    }

    #[tokio::test]
    async fn test_drain_publishes_and_acks_due_entries() {
        let q = queue();
        let publisher = RecordingPublisher::default();
        q.add("run-1:embed", 100).await.unwrap();
        q.add("run-2:rank", 200).await.unwrap();
        q.add("run-3:later", 99_999).await.unwrap();

        let published = RetryPoller::drain_once(&q, &publisher, 1_000, 50)
            .await
            .unwrap();
        assert_eq!(published, 2);

        let mut recorded = publisher.recorded();
        recorded.sort();
        assert_eq!(
            recorded,
            vec![
                ("run-1".to_string(), "embed".to_string()),
                ("run-2".to_string(), "rank".to_string()),
            ]
        );

        // acked entries never come back
        let again = RetryPoller::drain_once(&q, &publisher, 10_000, 50)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_batch_limit_bounds_each_drain() {
        let q = queue();
        let publisher = RecordingPublisher::default();
        for i in 0..8 {
            q.add(&format!("run-{i}:n"), 100 + i).await.unwrap();
        }

        let first = RetryPoller::drain_once(&q, &publisher, 1_000, 3)
            .await
            .unwrap();
        assert_eq!(first, 3);
        let second = RetryPoller::drain_once(&q, &publisher, 1_000, 50)
            .await
            .unwrap();
        assert_eq!(second, 5);
    }

    #[tokio::test]
    async fn test_malformed_keys_are_dropped_not_fatal() {
        let q = queue();
        let publisher = RecordingPublisher::default();
        q.add("no-separator", 100).await.unwrap();
        q.add("run-1:embed", 100).await.unwrap();

        let published = RetryPoller::drain_once(&q, &publisher, 1_000, 50)
            .await
            .unwrap();
        assert_eq!(published, 1);
        assert_eq!(publisher.recorded(), vec![(
            "run-1".to_string(),
            "embed".to_string()
        )]);

        // the malformed entry was acked away, not left to redeliver
        let again = RetryPoller::drain_once(&q, &publisher, 100_000, 50)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_entry_for_redelivery() {
        let q = queue();
        let publisher = RecordingPublisher::failing_for("run-1");
        q.add("run-1:embed", 100).await.unwrap();
        q.add("run-2:rank", 100).await.unwrap();

        let published = RetryPoller::drain_once(&q, &publisher, 1_000, 50)
            .await
            .unwrap();
        // the healthy entry went through despite its neighbor failing
        assert_eq!(published, 1);

        // after the lease expires the failed entry is delivered again
        let healthy = RecordingPublisher::default();
        let retried = RetryPoller::drain_once(&q, &healthy, 1_000 + 6_000, 50)
            .await
            .unwrap();
        assert_eq!(retried, 1);
        assert_eq!(healthy.recorded(), vec![(
            "run-1".to_string(),
            "embed".to_string()
        )]);
    }

    #[tokio::test]
    async fn test_started_poller_drains_on_interval() {
        let q = Arc::new(queue());
        let publisher = Arc::new(RecordingPublisher::default());
        q.add("run-1:embed", Utc::now().timestamp_millis() - 1_000)
            .await
            .unwrap();

        let config = RecoveryConfig::new()
            .with_retry_polling(Duration::from_millis(20), 50);
        let mut poller = RetryPoller::new(q.clone(), publisher.clone(), config);
        poller.start().await.unwrap();
        // double start is refused
        assert!(poller.start().await.is_err());

        tokio::time::sleep(Duration::from_millis(120)).await;
        poller.stop().await;

        assert_eq!(publisher.recorded(), vec![(
            "run-1".to_string(),
            "embed".to_string()
        )]);
    }
}
