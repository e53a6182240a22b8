//! # Retry Scheduling Example
//!
//! Shows the delay queue and retry poller on their own:
//!
//! 1. Backoff delays growing per attempt (with and without jitter)
//! 2. Upsert semantics - one pending retry per (run, node) pair
//! 3. The poller's lease/ack protocol: a failed publish redelivers instead
//!    of losing the retry
//!
//! Run with:
//! ```bash
//! cargo run --example retry_scheduling
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redrive::prelude::*;
use redrive::queue::{DelayQueue, MemoryDelayQueue};
use redrive::services::{EventPublisher, SchedulerEvent};

/// Event bus that can be flipped between broken and healthy.
struct FlakyBus {
    broken: AtomicBool,
}

#[async_trait]
impl EventPublisher for FlakyBus {
    async fn publish(&self, _events: &[SchedulerEvent]) -> RedriveResult<()> {
        Ok(())
    }

    async fn publish_retry(&self, run_id: &str, node_id: &str) -> RedriveResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            println!("💥 bus down, retry trigger for {run_id}/{node_id} not delivered");
            return Err(RedriveError::generic("bus unavailable"));
        }
        println!("🔁 retry trigger delivered for {run_id}/{node_id}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> RedriveResult<()> {
    // 1. backoff growth
    println!("--- backoff delays ---");
    let backoff = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(8));
    for attempt in 1..=7 {
        println!(
            "attempt {attempt}: {:>6}ms",
            backoff.delay_for_attempt(attempt).as_millis()
        );
    }

    let jittered = backoff.clone().with_jitter(0.2);
    println!(
        "attempt 3 with ±20% jitter: {}ms\n",
        jittered.delay_for_attempt(3).as_millis()
    );

    // 2. upsert keeps one pending retry per pair
    println!("--- delay queue upsert ---");
    let queue = Arc::new(MemoryDelayQueue::new(Duration::from_millis(2_000)));
    queue.add("run-1:embed", 1_000).await?;
    queue.add("run-1:embed", 4_000).await?;
    queue.add("run-2:rank", 2_000).await?;
    println!("pending entries: {}", queue.pending_len().await?);
    println!(
        "due at t=2500: {:?}\n",
        queue
            .poll_due(2_500, 10)
            .await?
            .iter()
            .map(|e| e.key.clone())
            .collect::<Vec<_>>()
    );

    // 3. lease/ack protocol survives a broken bus
    println!("--- lease and redelivery ---");
    let bus = FlakyBus {
        broken: AtomicBool::new(true),
    };
    queue.add("run-3:rerank", 5_000).await?;

    // the publish fails; the entry stays leased
    let delivered = RetryPoller::drain_once(queue.as_ref(), &bus, 6_000, 50).await?;
    println!("delivered while broken: {delivered}");

    // bus recovers; after the lease deadline the entry comes back
    bus.broken.store(false, Ordering::SeqCst);
    let delivered = RetryPoller::drain_once(queue.as_ref(), &bus, 6_000 + 2_500, 50).await?;
    println!("delivered after recovery: {delivered}");

    Ok(())
}
