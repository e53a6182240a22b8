//! # End-to-End Recovery Pipeline Example
//!
//! This example wires the full dispatch-and-recovery core with small
//! in-process collaborators and walks three failures through it:
//!
//! 1. A **transient** failure that gets retried with exponential backoff
//! 2. A **security** failure that escalates to a human review task
//! 3. Repeated **permanent** failures that trip the node's circuit breaker,
//!    after which further errors short-circuit to abort
//!
//! Run with:
//! ```bash
//! cargo run --example recovery_pipeline
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redrive::prelude::*;
use redrive::queue::MemoryDelayQueue;
use redrive::services::{
    AuditService, EventPublisher, HitlService, SchedulerEvent, SelfHealingService, TaskDispatcher,
};
use redrive::services::FixOutcome;

/// Dispatcher that prints the hand-off instead of talking to real executors.
struct PrintingDispatcher;

#[async_trait]
impl TaskDispatcher for PrintingDispatcher {
    async fn dispatch(
        &self,
        task: &NodeExecutionTask,
        executor: &ExecutorHandle,
    ) -> RedriveResult<()> {
        println!(
            "🚚 dispatching {} to executor {}",
            task.id(),
            executor.executor_id
        );
        Ok(())
    }
}

/// Event bus that prints retry triggers.
struct PrintingBus;

#[async_trait]
impl EventPublisher for PrintingBus {
    async fn publish(&self, events: &[SchedulerEvent]) -> RedriveResult<()> {
        for event in events {
            println!("📢 event {} for run {}", event.name, event.run_id);
        }
        Ok(())
    }

    async fn publish_retry(&self, run_id: &str, node_id: &str) -> RedriveResult<()> {
        println!("🔁 retry trigger published for {run_id}/{node_id}");
        Ok(())
    }
}

/// Self-healing collaborator that never volunteers.
struct NoHealer;

#[async_trait]
impl SelfHealingService for NoHealer {
    async fn can_auto_fix(&self, _error: &ErrorPayload) -> bool {
        false
    }

    async fn attempt_fix(
        &self,
        _error: &ErrorPayload,
        _context: &NodeContext,
    ) -> RedriveResult<FixOutcome> {
        Ok(FixOutcome::failed())
    }
}

/// HITL collaborator that mints review task ids.
struct ConsoleHitl;

#[async_trait]
impl HitlService for ConsoleHitl {
    async fn create_review_task(
        &self,
        error: &ErrorPayload,
        context: &NodeContext,
    ) -> RedriveResult<String> {
        println!(
            "🧑‍⚖️ review task created for {}/{} ({})",
            context.run_id, context.node_id, error.kind
        );
        Ok(format!("review-{}-{}", context.run_id, context.node_id))
    }
}

/// Audit trail that prints every decision version.
struct ConsoleAudit;

#[async_trait]
impl AuditService for ConsoleAudit {
    async fn log_error_handling(
        &self,
        error: &ErrorPayload,
        decision: &ErrorHandlingDecision,
    ) -> RedriveResult<()> {
        println!(
            "📝 audit: node={} action={} reason=\"{}\"",
            error.origin_node, decision.action, decision.reason
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> RedriveResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("redrive=info")),
        )
        .init();

    let config = RecoveryConfig::new()
        .with_circuit_breaker(2, Duration::from_secs(30))
        .with_backoff(Duration::from_millis(500), Duration::from_secs(60))
        .with_human_review_threshold(ReviewThreshold::None);

    let executors = StaticExecutorRegistry::new();
    executors.register("embed", ExecutorHandle::new("exec-embed", "container"));
    executors.register("guard", ExecutorHandle::new("exec-guard", "container"));

    let queue = Arc::new(MemoryDelayQueue::new(config.retry_lease_timeout));
    let breakers = CircuitBreakerRegistry::from_config(&config);
    let bus = Arc::new(PrintingBus);

    let scheduler = Arc::new(TaskScheduler::new(
        TaskRegistry::new(),
        Arc::new(executors),
        Arc::new(PrintingDispatcher),
        bus.clone(),
        queue.clone(),
        breakers.clone(),
        config.clone(),
    ));

    let handler = ErrorHandler::new(
        ErrorPolicyEngine::new(&config),
        scheduler.clone(),
        breakers.clone(),
        Arc::new(NoHealer),
        Arc::new(ConsoleHitl),
        Arc::new(ConsoleAudit),
    );

    // 1. dispatch a task, then report a transient failure -> retry
    println!("--- transient failure retries ---");
    let task = NodeExecutionTask::new("run-1", "embed").with_retry_policy(RetryPolicy::new(3));
    scheduler.schedule_task(task.clone()).await?;

    let decision = handler
        .handle_error(
            ErrorPayload::new(ErrorKind::Transient, "embed")
                .with_attempt(1)
                .with_max_attempts(3)
                .with_message("connection reset by peer"),
            NodeContext::for_task(&task),
        )
        .await?;
    println!(
        "decision: {} (delay {:?})\n",
        decision.action,
        decision.delay.unwrap_or_default()
    );

    // the poller would normally drain this on its interval; drain manually
    let now = chrono::Utc::now().timestamp_millis() + 60_000;
    let drained = RetryPoller::drain_once(queue.as_ref(), bus.as_ref(), now, 50).await?;
    println!("drained {drained} due retry entries\n");

    // 2. a security failure escalates no matter what
    println!("--- security failure escalates ---");
    let decision = handler
        .handle_error(
            ErrorPayload::new(ErrorKind::Security, "guard")
                .with_message("prompt injection detected"),
            NodeContext::new("run-1", "guard"),
        )
        .await?;
    println!(
        "decision: {} (review task {:?})\n",
        decision.action, decision.hitl_task_id
    );

    // 3. repeated aborts trip the breaker, then short-circuit
    println!("--- permanent failures trip the breaker ---");
    for run in 1..=2 {
        let decision = handler
            .handle_error(
                ErrorPayload::new(ErrorKind::Permanent, "embed")
                    .with_attempt(1)
                    .with_max_attempts(3)
                    .with_message("schema no longer exists"),
                NodeContext::new(format!("run-{run}"), "embed"),
            )
            .await?;
        println!("decision: {}", decision.action);
    }

    let snapshot = breakers.snapshot("embed");
    println!(
        "breaker for embed: open={} failures={}",
        snapshot.open, snapshot.failure_count
    );

    let decision = handler
        .handle_error(
            ErrorPayload::new(ErrorKind::Transient, "embed")
                .with_attempt(1)
                .with_max_attempts(3),
            NodeContext::new("run-9", "embed"),
        )
        .await?;
    println!("next decision short-circuits to: {}", decision.action);

    Ok(())
}
