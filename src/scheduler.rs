//! # Task Scheduler - Dispatching Node Work to Executors
//!
//! [`TaskScheduler`] orchestrates the hand-off of a [`NodeExecutionTask`] to
//! its executor:
//!
//! 1. registers the task in the [`TaskRegistry`] (insert-if-absent, which
//!    makes dispatch at-most-once per task id),
//! 2. resolves the executor from the [`ExecutorRegistry`],
//! 3. consults the node's circuit breaker,
//! 4. dispatches, and records the outcome in the registry.
//!
//! Dispatch failures are bookkept and logged, never re-thrown: the only
//! scheduling failures a caller sees are registry-level ones (no executor
//! registered, invalid task). Execution failures are reported later by the
//! workflow-run collaborator through
//! [`ErrorHandler`](crate::handler::ErrorHandler), not through this type.
//!
//! The scheduler also fronts the delay queue
//! ([`schedule_retry`](TaskScheduler::schedule_retry)) and owns the periodic
//! registry cleanup pass, started and stopped explicitly with the process
//! lifecycle.
//!
//! ## 🚀 Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use redrive::prelude::*;
//! use redrive::queue::MemoryDelayQueue;
//!
//! # use redrive::services::{TaskDispatcher, EventPublisher, SchedulerEvent, ExecutorHandle};
//! # use redrive::error::RedriveResult;
//! # struct NoopDispatcher;
//! # #[async_trait]
//! # impl TaskDispatcher for NoopDispatcher {
//! #     async fn dispatch(&self, _t: &NodeExecutionTask, _e: &ExecutorHandle) -> RedriveResult<()> { Ok(()) }
//! # }
//! # struct NoopPublisher;
//! # #[async_trait]
//! # impl EventPublisher for NoopPublisher {
//! #     async fn publish(&self, _e: &[SchedulerEvent]) -> RedriveResult<()> { Ok(()) }
//! #     async fn publish_retry(&self, _r: &str, _n: &str) -> RedriveResult<()> { Ok(()) }
//! # }
//! #[tokio::main]
//! async fn main() -> RedriveResult<()> {
//!     let config = RecoveryConfig::default();
//!     let executors = StaticExecutorRegistry::new();
//!     executors.register("embed", ExecutorHandle::new("exec-1", "container"));
//!
//!     let mut scheduler = TaskScheduler::new(
//!         TaskRegistry::new(),
//!         Arc::new(executors),
//!         Arc::new(NoopDispatcher),
//!         Arc::new(NoopPublisher),
//!         Arc::new(MemoryDelayQueue::new(config.retry_lease_timeout)),
//!         CircuitBreakerRegistry::from_config(&config),
//!         config,
//!     );
//!     scheduler.start().await?;
//!
//!     scheduler
//!         .schedule_task(NodeExecutionTask::new("run-1", "embed"))
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::breaker::{CircuitBreakerRegistry, DispatchPermit};
use crate::config::RecoveryConfig;
use crate::error::{RedriveError, RedriveResult};
use crate::queue::{queue_key, DelayQueue, RetryQueueEntry};
use crate::registry::TaskRegistry;
use crate::services::{EventPublisher, ExecutorRegistry, SchedulerEvent, TaskDispatcher};
use crate::task::{NodeExecutionTask, ScheduledTask, TaskId, TaskStatus};

/// Dispatches node execution tasks and fronts the retry delay queue.
///
/// All collaborators are injected at construction; the scheduler holds no
/// global state. Cloning is cheap and every clone shares the same registry,
/// breakers and queue.
pub struct TaskScheduler {
    registry: TaskRegistry,
    executors: Arc<dyn ExecutorRegistry>,
    dispatcher: Arc<dyn TaskDispatcher>,
    publisher: Arc<dyn EventPublisher>,
    queue: Arc<dyn DelayQueue>,
    breakers: CircuitBreakerRegistry,
    config: RecoveryConfig,
    running: Arc<RwLock<bool>>,
}

impl TaskScheduler {
    /// Wire a scheduler from its collaborators.
    pub fn new(
        registry: TaskRegistry,
        executors: Arc<dyn ExecutorRegistry>,
        dispatcher: Arc<dyn TaskDispatcher>,
        publisher: Arc<dyn EventPublisher>,
        queue: Arc<dyn DelayQueue>,
        breakers: CircuitBreakerRegistry,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            registry,
            executors,
            dispatcher,
            publisher,
            queue,
            breakers,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// The shared task registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The shared circuit breaker registry.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Idempotently register and dispatch a task.
    ///
    /// Re-scheduling an already-known `(run, node, attempt)` is a logged
    /// no-op. Executor resolution failures propagate; dispatch failures and
    /// breaker refusals are recorded on the registry entry and logged, and
    /// the call still returns `Ok` (recovery is driven by the error handler
    /// once the failure is reported).
    pub async fn schedule_task(&self, task: NodeExecutionTask) -> RedriveResult<()> {
        if task.attempt > task.retry_policy.max_attempts {
            return Err(RedriveError::configuration(format!(
                "Attempt {} exceeds max_attempts {} for task {}",
                task.attempt,
                task.retry_policy.max_attempts,
                task.id()
            )));
        }

        let task_id = task.id();
        let node_id = task.node_id.clone();

        if !self.registry.insert_if_absent(ScheduledTask::new(task.clone()))? {
            debug!(task_id = %task_id, "Task already scheduled, skipping duplicate dispatch");
            return Ok(());
        }

        let executor = match self.executors.executor_for_node(&node_id) {
            Ok(executor) => executor,
            Err(err) => {
                self.registry
                    .transition(&task_id, TaskStatus::Failed, Some(err.to_string()))?;
                return Err(err);
            }
        };

        match self.breakers.try_acquire(&node_id) {
            DispatchPermit::Refused => {
                warn!(
                    task_id = %task_id,
                    node_id = %node_id,
                    "Dispatch refused, circuit breaker open"
                );
                self.registry.transition(
                    &task_id,
                    TaskStatus::Failed,
                    Some(format!("circuit breaker open for node {node_id}")),
                )?;
                return Ok(());
            }
            DispatchPermit::Trial => {
                info!(task_id = %task_id, node_id = %node_id, "Half-open trial dispatch");
            }
            DispatchPermit::Allowed => {}
        }

        match self.dispatcher.dispatch(&task, &executor).await {
            Ok(()) => {
                self.registry
                    .transition(&task_id, TaskStatus::Running, None)?;
                debug!(
                    task_id = %task_id,
                    executor_id = %executor.executor_id,
                    "Task dispatched"
                );
            }
            Err(err) => {
                error!(
                    task_id = %task_id,
                    executor_id = %executor.executor_id,
                    error = %err,
                    "Dispatch failed"
                );
                self.registry
                    .transition(&task_id, TaskStatus::Failed, Some(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// Schedule (or reschedule) a retry for a node, due after `delay`.
    ///
    /// At most one pending retry exists per `(run, node)` pair; a newer call
    /// replaces the previous entry.
    pub async fn schedule_retry(
        &self,
        run_id: &str,
        node_id: &str,
        delay: Duration,
    ) -> RedriveResult<()> {
        // validate the key shape before it ever reaches the queue
        queue_key(run_id, node_id)?;
        let entry = RetryQueueEntry {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            execute_at: Utc::now().timestamp_millis() + delay.as_millis() as i64,
        };
        self.queue.add(&entry.key(), entry.execute_at).await?;
        debug!(
            run_id,
            node_id,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        Ok(())
    }

    /// Best-effort cancellation of every non-terminal task of a run.
    ///
    /// Local bookkeeping only: an executor already working on a task is not
    /// stopped. Returns the number of entries cancelled.
    pub async fn cancel_tasks_for_run(&self, run_id: &str) -> RedriveResult<usize> {
        let cancelled = self.registry.cancel_run(run_id)?;
        if cancelled > 0 {
            info!(run_id, cancelled, "Cancelled scheduled tasks for run");
        }
        Ok(cancelled)
    }

    /// Forward events to the event publisher; empty input is a no-op.
    pub async fn publish_events(&self, events: Vec<SchedulerEvent>) -> RedriveResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.publisher.publish(&events).await
    }

    /// Number of tasks not yet in a terminal state.
    pub fn scheduled_task_count(&self) -> RedriveResult<usize> {
        self.registry.active_count()
    }

    /// Record successful execution of a task.
    ///
    /// Marks the entry completed and reports the success to the node's
    /// circuit breaker (closing a half-open breaker).
    pub fn mark_completed(&self, task_id: &TaskId) -> RedriveResult<bool> {
        let Some(entry) = self.registry.get(task_id)? else {
            return Ok(false);
        };
        let applied = self
            .registry
            .transition(task_id, TaskStatus::Completed, None)?;
        if applied {
            self.breakers.record_success(&entry.task.node_id);
        }
        Ok(applied)
    }

    /// Record failed execution of a task in the registry.
    ///
    /// Breaker accounting for execution failures is the error handler's
    /// responsibility (only aborted failures count against the breaker).
    pub fn mark_failed<S: Into<String>>(&self, task_id: &TaskId, message: S) -> RedriveResult<bool> {
        self.registry
            .transition(task_id, TaskStatus::Failed, Some(message.into()))
    }

    /// Start the periodic registry cleanup pass.
    pub async fn start(&mut self) -> RedriveResult<()> {
        if *self.running.read().await {
            return Err(RedriveError::configuration("Scheduler already running"));
        }
        *self.running.write().await = true;

        let registry = self.registry.clone();
        let running = Arc::clone(&self.running);
        let cleanup_interval = self.config.task_cleanup_interval;
        let retention = self.config.task_retention;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick fires immediately; skip it so a fresh scheduler
            // does not purge before anything ages
            interval.tick().await;

            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }

                let cutoff = Utc::now()
                    - chrono::Duration::from_std(retention)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600));
                match registry.purge_terminal_before(cutoff) {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "Pruned terminal registry entries"),
                    Err(err) => warn!(error = %err, "Registry cleanup pass failed"),
                }
            }
        });
        Ok(())
    }

    /// Stop the cleanup pass. In-flight registry entries are untouched.
    pub async fn stop(&mut self) {
        *self.running.write().await = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryDelayQueue;
    use crate::services::{ExecutorHandle, StaticExecutorRegistry};
    use crate::task::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDispatcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingDispatcher {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskDispatcher for CountingDispatcher {
        async fn dispatch(
            &self,
            _task: &NodeExecutionTask,
            _executor: &ExecutorHandle,
        ) -> RedriveResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RedriveError::dispatch("executor rejected the task"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct CountingPublisher {
        batches: AtomicUsize,
        retries: AtomicUsize,
    }

    #[async_trait]
    impl EventPublisher for CountingPublisher {
        async fn publish(&self, _events: &[SchedulerEvent]) -> RedriveResult<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish_retry(&self, _run_id: &str, _node_id: &str) -> RedriveResult<()> {
            self.retries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler_with(
        dispatcher: Arc<CountingDispatcher>,
        publisher: Arc<CountingPublisher>,
        config: RecoveryConfig,
    ) -> (TaskScheduler, Arc<MemoryDelayQueue>) {
        let executors = StaticExecutorRegistry::new();
        executors.register("embed", ExecutorHandle::new("exec-1", "container"));
        executors.register("rank", ExecutorHandle::new("exec-2", "container"));

        let queue = Arc::new(MemoryDelayQueue::new(config.retry_lease_timeout));
        let scheduler = TaskScheduler::new(
            TaskRegistry::new(),
            Arc::new(executors),
            dispatcher,
            publisher,
            queue.clone(),
            CircuitBreakerRegistry::from_config(&config),
            config,
        );
        (scheduler, queue)
    }

    #[tokio::test]
    async fn test_schedule_dispatches_and_marks_running() {
        let dispatcher = CountingDispatcher::accepting();
        let (scheduler, _queue) = scheduler_with(
            dispatcher.clone(),
            Arc::new(CountingPublisher::default()),
            RecoveryConfig::default(),
        );

        let task = NodeExecutionTask::new("run-1", "embed");
        let id = task.id();
        scheduler.schedule_task(task).await.unwrap();

        assert_eq!(dispatcher.count(), 1);
        let entry = scheduler.registry().get(&id).unwrap().unwrap();
        assert_eq!(entry.status, TaskStatus::Running);
        assert_eq!(scheduler.scheduled_task_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_schedule_dispatches_once() {
        let dispatcher = CountingDispatcher::accepting();
        let (scheduler, _queue) = scheduler_with(
            dispatcher.clone(),
            Arc::new(CountingPublisher::default()),
            RecoveryConfig::default(),
        );

        let task = NodeExecutionTask::new("run-1", "embed");
        scheduler.schedule_task(task.clone()).await.unwrap();
        scheduler.schedule_task(task).await.unwrap();

        assert_eq!(dispatcher.count(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_node_fails_scheduling() {
        let dispatcher = CountingDispatcher::accepting();
        let (scheduler, _queue) = scheduler_with(
            dispatcher.clone(),
            Arc::new(CountingPublisher::default()),
            RecoveryConfig::default(),
        );

        let task = NodeExecutionTask::new("run-1", "mystery");
        let id = task.id();
        let result = scheduler.schedule_task(task).await;

        assert!(matches!(result, Err(RedriveError::NoExecutorAvailable(_))));
        assert_eq!(dispatcher.count(), 0);
        let entry = scheduler.registry().get(&id).unwrap().unwrap();
        assert_eq!(entry.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_bookkept_not_rethrown() {
        let dispatcher = CountingDispatcher::rejecting();
        let (scheduler, _queue) = scheduler_with(
            dispatcher.clone(),
            Arc::new(CountingPublisher::default()),
            RecoveryConfig::default(),
        );

        let task = NodeExecutionTask::new("run-1", "embed");
        let id = task.id();
        scheduler.schedule_task(task).await.unwrap();

        let entry = scheduler.registry().get(&id).unwrap().unwrap();
        assert_eq!(entry.status, TaskStatus::Failed);
        assert!(entry.error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_open_breaker_refuses_dispatch() {
        let dispatcher = CountingDispatcher::accepting();
        let config = RecoveryConfig::new()
            .with_circuit_breaker(1, Duration::from_secs(60));
        let (scheduler, _queue) = scheduler_with(
            dispatcher.clone(),
            Arc::new(CountingPublisher::default()),
            config,
        );

        scheduler.breakers().record_failure("embed");

        let task = NodeExecutionTask::new("run-1", "embed");
        let id = task.id();
        scheduler.schedule_task(task).await.unwrap();

        assert_eq!(dispatcher.count(), 0);
        let entry = scheduler.registry().get(&id).unwrap().unwrap();
        assert_eq!(entry.status, TaskStatus::Failed);
        assert!(entry.error.unwrap().contains("circuit breaker open"));
    }

    #[tokio::test]
    async fn test_attempt_beyond_policy_rejected() {
        let dispatcher = CountingDispatcher::accepting();
        let (scheduler, _queue) = scheduler_with(
            dispatcher.clone(),
            Arc::new(CountingPublisher::default()),
            RecoveryConfig::default(),
        );

        let task = NodeExecutionTask::new("run-1", "embed")
            .with_attempt(4)
            .with_retry_policy(RetryPolicy::new(3));
        let result = scheduler.schedule_task(task).await;

        assert!(matches!(result, Err(RedriveError::Configuration(_))));
        assert_eq!(dispatcher.count(), 0);
    }

    #[tokio::test]
    async fn test_schedule_retry_upserts_queue_entry() {
        let (scheduler, queue) = scheduler_with(
            CountingDispatcher::accepting(),
            Arc::new(CountingPublisher::default()),
            RecoveryConfig::default(),
        );

        scheduler
            .schedule_retry("run-1", "embed", Duration::from_secs(10))
            .await
            .unwrap();
        scheduler
            .schedule_retry("run-1", "embed", Duration::from_secs(20))
            .await
            .unwrap();

        assert_eq!(queue.pending_len().await.unwrap(), 1);

        // due well after both delays have elapsed
        let far_future = Utc::now().timestamp_millis() + 60_000;
        let due = queue.poll_due(far_future, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "run-1:embed");
    }

    #[tokio::test]
    async fn test_cancel_tasks_for_run() {
        let dispatcher = CountingDispatcher::accepting();
        let (scheduler, _queue) = scheduler_with(
            dispatcher,
            Arc::new(CountingPublisher::default()),
            RecoveryConfig::default(),
        );

        scheduler
            .schedule_task(NodeExecutionTask::new("run-1", "embed"))
            .await
            .unwrap();
        scheduler
            .schedule_task(NodeExecutionTask::new("run-1", "rank"))
            .await
            .unwrap();
        scheduler
            .schedule_task(NodeExecutionTask::new("run-2", "embed"))
            .await
            .unwrap();

        assert_eq!(scheduler.cancel_tasks_for_run("run-1").await.unwrap(), 2);
        assert_eq!(scheduler.scheduled_task_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_events_empty_is_noop() {
        let publisher = Arc::new(CountingPublisher::default());
        let (scheduler, _queue) = scheduler_with(
            CountingDispatcher::accepting(),
            publisher.clone(),
            RecoveryConfig::default(),
        );

        scheduler.publish_events(Vec::new()).await.unwrap();
        assert_eq!(publisher.batches.load(Ordering::SeqCst), 0);

        scheduler
            .publish_events(vec![SchedulerEvent::new("run.started", "run-1")])
            .await
            .unwrap();
        assert_eq!(publisher.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mark_completed_reports_breaker_success() {
        let dispatcher = CountingDispatcher::accepting();
        let config = RecoveryConfig::new()
            .with_circuit_breaker(3, Duration::from_secs(60));
        let (scheduler, _queue) = scheduler_with(
            dispatcher,
            Arc::new(CountingPublisher::default()),
            config,
        );

        scheduler.breakers().record_failure("embed");
        scheduler.breakers().record_failure("embed");

        let task = NodeExecutionTask::new("run-1", "embed");
        let id = task.id();
        scheduler.schedule_task(task).await.unwrap();
        assert!(scheduler.mark_completed(&id).unwrap());

        // the success reset the consecutive failure count
        assert_eq!(scheduler.breakers().snapshot("embed").failure_count, 0);
        assert_eq!(scheduler.scheduled_task_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_pass_purges_old_terminal_entries() {
        let dispatcher = CountingDispatcher::accepting();
        let config = RecoveryConfig::new().with_task_cleanup(
            Duration::from_millis(20),
            Duration::from_millis(10),
        );
        let (mut scheduler, _queue) = scheduler_with(
            dispatcher,
            Arc::new(CountingPublisher::default()),
            config,
        );

        let task = NodeExecutionTask::new("run-1", "embed");
        let id = task.id();
        scheduler.schedule_task(task).await.unwrap();
        scheduler.mark_completed(&id).unwrap();
        assert_eq!(scheduler.registry().len().unwrap(), 1);

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop().await;

        assert_eq!(scheduler.registry().len().unwrap(), 0);
    }
}
