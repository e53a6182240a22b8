//! # Redrive: Dispatch & Recovery Core for Async Workflow Orchestration
//!
//! Redrive is the layer of a workflow platform that decides *when* a unit of
//! work reaches an executor and *what happens* when it fails. It combines a
//! durable, time-ordered retry schedule, per-node circuit breaking shared
//! across concurrent runs, and a multi-outcome error policy whose every
//! decision is audited.
//!
//! ## 🚀 Quick Start
//!
//! Wire a [`TaskScheduler`] from your platform's collaborators (executor
//! registry, dispatcher, event bus, delay queue), start it, and schedule
//! tasks. When an execution fails, hand the failure to an [`ErrorHandler`]
//! and act on the decision it returns. See the `recovery_pipeline` example
//! for an end-to-end walkthrough.
//!
//! ## 🎯 Core Concepts
//!
//! ### Tasks - Attempts at Node Work
//!
//! A [`NodeExecutionTask`] is one attempt at executing a workflow node,
//! identified by `run:node:attempt`. The [`TaskRegistry`]'s insert-if-absent
//! check makes dispatch at-most-once per attempt.
//!
//! ### Retries - Scheduled, Not Spun
//!
//! Failed nodes are not retried in a loop. A retry is an entry in the
//! [`DelayQueue`](queue::DelayQueue), due at `now + backoff(attempt)`; the
//! [`RetryPoller`] drains due entries and publishes retry triggers, and the
//! platform re-schedules the node with an incremented attempt. A lease/ack
//! protocol makes delivery at-least-once across crashes.
//!
//! ### Circuit Breakers - Per-Node Failure Isolation
//!
//! Each node has a breaker shared by every run that touches it
//! ([`CircuitBreakerRegistry`]). Enough consecutive failures trip it open;
//! dispatch is refused until a cooldown passes, then one trial dispatch
//! decides whether the node is healthy again.
//!
//! ### Decisions - The Error Policy
//!
//! The [`ErrorPolicyEngine`] turns a failure snapshot into an
//! [`ErrorHandlingDecision`] (retry, auto-fix, human review, fallback,
//! abort) in a strict priority order, and the [`ErrorHandler`] executes it,
//! auditing every version of the decision along the way.
//!
//! ## 📚 Module Overview
//!
//! - **[`scheduler`]**: [`TaskScheduler`] - dispatch, cancellation, retry
//!   scheduling, registry cleanup
//! - **[`registry`]**: [`TaskRegistry`] - idempotency and in-flight state
//! - **[`queue`]**: [`DelayQueue`](queue::DelayQueue) trait +
//!   [`MemoryDelayQueue`](queue::MemoryDelayQueue) backend
//! - **[`poller`]**: [`RetryPoller`] - periodic queue draining
//! - **[`breaker`]**: [`CircuitBreakerRegistry`] - per-node breakers
//! - **[`backoff`]**: [`BackoffPolicy`] - exponential delays with a cap and
//!   optional jitter
//! - **[`policy`]**: [`ErrorPolicyEngine`] and the decision model
//! - **[`handler`]**: [`ErrorHandler`] - decision execution and audit
//! - **[`services`]**: collaborator traits (executors, dispatch, events,
//!   self-healing, HITL, audit)
//! - **[`error`]**: [`RedriveError`] plus the failure taxonomy
//!   ([`ErrorKind`], [`ErrorPayload`])
//! - **[`config`]**: [`RecoveryConfig`] - every tunable, with defaults
//!
//! ## Concurrency Model
//!
//! One scheduler process per shard. The registry and breakers are shared,
//! lock-guarded maps with atomic per-key operations; the poller and cleanup
//! passes are independent background tasks with explicit start/stop
//! lifecycles. Cross-process coordination happens only through the durable
//! delay queue's atomic poll semantics.

pub mod backoff;
pub mod breaker;
pub mod config;
pub mod error;
pub mod handler;
pub mod policy;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod task;

// Core public API - simplified imports
pub use backoff::BackoffPolicy;
pub use breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState, DispatchPermit};
pub use config::{RecoveryConfig, ReviewThreshold};
pub use error::{ErrorKind, ErrorPayload, RedriveError, RedriveResult};
pub use handler::ErrorHandler;
pub use policy::{
    ErrorAction, ErrorContext, ErrorHandlingDecision, ErrorPolicyEngine, PolicyRule, RuleCondition,
};
pub use poller::RetryPoller;
pub use queue::{DelayQueue, LeasedEntry, MemoryDelayQueue, RetryQueueEntry};
pub use registry::TaskRegistry;
pub use scheduler::TaskScheduler;
pub use services::{
    AuditService, EventPublisher, ExecutorHandle, ExecutorRegistry, FixOutcome, HitlService,
    SchedulerEvent, SelfHealingService, StaticExecutorRegistry, TaskDispatcher,
};
pub use task::{NodeContext, NodeExecutionTask, RetryPolicy, ScheduledTask, TaskId, TaskStatus};

// Convenience re-exports for common patterns
pub mod prelude {
    //! Simplified imports for common usage patterns
    //!
    //! Use `use redrive::prelude::*;` to import the most commonly used types
    //! and traits.

    pub use crate::{
        BackoffPolicy, CircuitBreakerRegistry, ErrorAction, ErrorHandler, ErrorHandlingDecision,
        ErrorKind, ErrorPayload, ErrorPolicyEngine, ExecutorHandle, NodeContext,
        NodeExecutionTask, RecoveryConfig, RedriveError, RedriveResult, RetryPolicy, RetryPoller,
        ReviewThreshold, StaticExecutorRegistry, TaskId, TaskRegistry, TaskScheduler, TaskStatus,
    };

    // Re-export async_trait for convenience
    pub use async_trait::async_trait;
}
