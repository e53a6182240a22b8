//! # Collaborator Interfaces
//!
//! Narrow contracts between the dispatch-and-recovery core and the rest of
//! the platform. The core never talks to concrete infrastructure; everything
//! it needs from the outside arrives through these traits, constructed once
//! at process start and passed down explicitly.
//!
//! | Trait | Collaborator |
//! |-------|--------------|
//! | [`ExecutorRegistry`] | Maps node ids to executor handles |
//! | [`TaskDispatcher`] | Hands a task to its executor |
//! | [`EventPublisher`] | Event-bus transport |
//! | [`SelfHealingService`] | Automated repair of fixable failures |
//! | [`HitlService`] | Human-in-the-loop task creation |
//! | [`AuditService`] | Durable error-handling audit trail |
//!
//! The bundled [`StaticExecutorRegistry`] covers tests, demos and
//! fixed-topology deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorPayload, RedriveError, RedriveResult};
use crate::policy::ErrorHandlingDecision;
use crate::task::{NodeContext, NodeExecutionTask};

/// Opaque handle to a registered executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorHandle {
    /// Stable executor identifier.
    pub executor_id: String,
    /// Executor kind, for logging and routing (e.g. `"container"`, `"wasm"`).
    pub kind: String,
}

impl ExecutorHandle {
    /// Create a handle.
    pub fn new<I: Into<String>, K: Into<String>>(executor_id: I, kind: K) -> Self {
        Self {
            executor_id: executor_id.into(),
            kind: kind.into(),
        }
    }
}

/// Resolves the executor responsible for a node.
pub trait ExecutorRegistry: Send + Sync {
    /// Look up the executor for `node_id`; fails with
    /// [`RedriveError::NoExecutorAvailable`] when none is registered.
    fn executor_for_node(&self, node_id: &str) -> RedriveResult<ExecutorHandle>;
}

/// In-memory executor registry for tests, demos and fixed topologies.
#[derive(Default, Clone)]
pub struct StaticExecutorRegistry {
    executors: Arc<RwLock<HashMap<String, ExecutorHandle>>>,
}

impl StaticExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for a node.
    pub fn register<S: Into<String>>(&self, node_id: S, executor: ExecutorHandle) {
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        executors.insert(node_id.into(), executor);
    }
}

impl ExecutorRegistry for StaticExecutorRegistry {
    fn executor_for_node(&self, node_id: &str) -> RedriveResult<ExecutorHandle> {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        executors
            .get(node_id)
            .cloned()
            .ok_or_else(|| RedriveError::no_executor(node_id))
    }
}

/// Hands a task to its executor.
///
/// The returned future resolves when the executor has *accepted* the task,
/// not when execution finishes; execution outcomes are reported back by the
/// workflow-run collaborator.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        task: &NodeExecutionTask,
        executor: &ExecutorHandle,
    ) -> RedriveResult<()>;
}

/// An event emitted by the scheduler or poller onto the platform bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    /// Event name, e.g. `"node.retry.triggered"`.
    pub name: String,
    pub run_id: String,
    pub node_id: Option<String>,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl SchedulerEvent {
    /// Create an event for a run.
    pub fn new<N: Into<String>, R: Into<String>>(name: N, run_id: R) -> Self {
        Self {
            name: name.into(),
            run_id: run_id.into(),
            node_id: None,
            payload: Value::Null,
            occurred_at: Utc::now(),
        }
    }

    /// Scope the event to a node.
    pub fn with_node<S: Into<String>>(mut self, node_id: S) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Event-bus transport.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a batch of events.
    async fn publish(&self, events: &[SchedulerEvent]) -> RedriveResult<()>;

    /// Publish the retry trigger for a node; the workflow-run collaborator
    /// consumes it and re-invokes `schedule_task` with an incremented
    /// attempt.
    async fn publish_retry(&self, run_id: &str, node_id: &str) -> RedriveResult<()>;
}

/// Result of an automated repair attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixOutcome {
    /// Whether the repair produced a usable replacement input.
    pub success: bool,
    /// The repaired input, when `success` is true.
    pub result: Option<Value>,
}

impl FixOutcome {
    /// A successful repair carrying the fixed input.
    pub fn fixed(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
        }
    }

    /// A failed repair.
    pub fn failed() -> Self {
        Self {
            success: false,
            result: None,
        }
    }
}

/// Automated repair of fixable failures.
#[async_trait]
pub trait SelfHealingService: Send + Sync {
    /// Whether this failure looks repairable without human input.
    async fn can_auto_fix(&self, error: &ErrorPayload) -> bool;

    /// Attempt the repair.
    async fn attempt_fix(
        &self,
        error: &ErrorPayload,
        context: &NodeContext,
    ) -> RedriveResult<FixOutcome>;
}

/// Human-in-the-loop escalation.
#[async_trait]
pub trait HitlService: Send + Sync {
    /// Create a review task for a human operator; returns its id.
    async fn create_review_task(
        &self,
        error: &ErrorPayload,
        context: &NodeContext,
    ) -> RedriveResult<String>;
}

/// Durable audit trail for error handling.
///
/// The write is mandatory and synchronous from the orchestrator's point of
/// view: a decision is not final until `log_error_handling` returns.
#[async_trait]
pub trait AuditService: Send + Sync {
    async fn log_error_handling(
        &self,
        error: &ErrorPayload,
        decision: &ErrorHandlingDecision,
    ) -> RedriveResult<()>;
}
