//! # Task Model - Units of Dispatchable Work
//!
//! This module defines the value types that flow through the scheduler:
//!
//! - [`NodeExecutionTask`]: one attempt at executing a workflow node,
//!   immutable once created.
//! - [`TaskId`]: the `run:node:attempt` idempotency key.
//! - [`RetryPolicy`]: the per-task attempt ceiling.
//! - [`ScheduledTask`] / [`TaskStatus`]: the registry's bookkeeping record
//!   and its one-directional status machine.
//! - [`NodeContext`]: the read-only context snapshot handed to the error
//!   policy engine and recovery collaborators.
//!
//! ## 🎯 Identity and Idempotency
//!
//! A task is identified by `(run_id, node_id, attempt)`. The attempt number
//! is 1-based and increases monotonically per `(run_id, node_id)` pair, never
//! beyond the policy's `max_attempts`. The registry uses [`TaskId`] for its
//! insert-if-absent check, which is what makes dispatch at-most-once.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RedriveError;

/// Separator between the segments of a [`TaskId`] and a retry-queue key.
pub const ID_SEPARATOR: char = ':';

/// Per-task retry budget.
///
/// The delay curve is owned by the global
/// [`BackoffPolicy`](crate::backoff::BackoffPolicy); the policy here only
/// bounds how many attempts a node gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt ceiling, first execution included.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` total attempts (minimum 1).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self { max_attempts: 1 }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Idempotency key for one execution attempt: `run_id:node_id:attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Build the key from its parts.
    pub fn new(run_id: &str, node_id: &str, attempt: u32) -> Self {
        Self(format!(
            "{run_id}{ID_SEPARATOR}{node_id}{ID_SEPARATOR}{attempt}"
        ))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = RedriveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(2, ID_SEPARATOR);
        let attempt = parts.next().unwrap_or_default();
        let prefix = parts.next();

        let valid = prefix.is_some_and(|p| p.contains(ID_SEPARATOR))
            && attempt.parse::<u32>().is_ok();
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(RedriveError::generic(format!("Malformed task id: {s}")))
        }
    }
}

/// One attempt at executing a workflow node.
///
/// Immutable once created; a retry is a *new* task with an incremented
/// attempt number, never a mutation of this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionTask {
    /// The workflow run this node belongs to.
    pub run_id: String,
    /// The node to execute.
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Opaque resume/correlation token handed to the executor.
    pub token: String,
    /// Input context forwarded to the executor.
    pub context: HashMap<String, Value>,
    /// Attempt budget for this node.
    pub retry_policy: RetryPolicy,
}

impl NodeExecutionTask {
    /// Create a first-attempt task with an empty context and default policy.
    pub fn new<R: Into<String>, N: Into<String>>(run_id: R, node_id: N) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            attempt: 1,
            token: String::new(),
            context: HashMap::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the attempt number (clamped to at least 1).
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    /// Set the resume token.
    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = token.into();
        self
    }

    /// Add a context entry.
    pub fn with_context<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// The idempotency key for this attempt.
    pub fn id(&self) -> TaskId {
        TaskId::new(&self.run_id, &self.node_id, self.attempt)
    }

    /// The retry-queue key shared by all attempts of this node.
    pub fn queue_key(&self) -> String {
        format!("{}{ID_SEPARATOR}{}", self.run_id, self.node_id)
    }

    /// The follow-up task for the next attempt of this node.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }
}

/// Lifecycle state of a registry entry.
///
/// Transitions are one-directional:
/// `Pending → Running → {Completed | Failed | Cancelled}` (with
/// `Pending → {Failed | Cancelled}` for dispatch refusals). Terminal states
/// never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the status machine permits moving from `self` to `to`.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                to,
                TaskStatus::Running | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Running => to.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Registry bookkeeping record for a scheduled task.
///
/// Owned exclusively by the [`TaskRegistry`](crate::registry::TaskRegistry):
/// created on scheduling, mutated by dispatch callbacks, pruned by the
/// cleanup pass once terminal and past retention.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// Idempotency key.
    pub task_id: TaskId,
    /// The underlying work unit.
    pub task: NodeExecutionTask,
    /// When the entry was registered.
    pub scheduled_at: DateTime<Utc>,
    /// How many retries this pair has been through (attempt - 1).
    pub retry_count: u32,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Set when the entry reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure description, when `status == Failed`.
    pub error: Option<String>,
}

impl ScheduledTask {
    /// Create a pending entry for the given task.
    pub fn new(task: NodeExecutionTask) -> Self {
        Self {
            task_id: task.id(),
            retry_count: task.attempt.saturating_sub(1),
            task,
            scheduled_at: Utc::now(),
            status: TaskStatus::Pending,
            completed_at: None,
            error: None,
        }
    }

    /// The instant used by the cleanup pass to age this entry.
    pub fn age_reference(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.scheduled_at)
    }
}

/// Read-only node context handed to the error policy engine and recovery
/// collaborators.
///
/// The run and node identifiers are lifted into typed fields because the
/// orchestrator routes on them (retry scheduling, HITL task creation);
/// everything else rides in `attributes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeContext {
    pub run_id: String,
    pub node_id: String,
    pub attributes: HashMap<String, Value>,
}

impl NodeContext {
    /// Create a context for a run/node pair.
    pub fn new<R: Into<String>, N: Into<String>>(run_id: R, node_id: N) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            attributes: HashMap::new(),
        }
    }

    /// Snapshot the context of an execution task.
    pub fn for_task(task: &NodeExecutionTask) -> Self {
        Self {
            run_id: task.run_id.clone(),
            node_id: task.node_id.clone(),
            attributes: task.context.clone(),
        }
    }

    /// Add an attribute.
    pub fn with_attribute<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_format() {
        let id = TaskId::new("run-1", "embed", 2);
        assert_eq!(id.as_str(), "run-1:embed:2");
        assert_eq!(id.to_string(), "run-1:embed:2");
    }

    #[test]
    fn test_task_id_parse() {
        assert!("run-1:embed:2".parse::<TaskId>().is_ok());
        assert!("run-1:embed".parse::<TaskId>().is_err());
        assert!("run-1:embed:two".parse::<TaskId>().is_err());
        assert!("garbage".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_task_builder_and_identity() {
        let task = NodeExecutionTask::new("run-1", "embed")
            .with_attempt(2)
            .with_token("tok-9")
            .with_context("input", "hello")
            .with_retry_policy(RetryPolicy::new(5));

        assert_eq!(task.id().as_str(), "run-1:embed:2");
        assert_eq!(task.queue_key(), "run-1:embed");
        assert_eq!(task.retry_policy.max_attempts, 5);
    }

    #[test]
    fn test_next_attempt_increments() {
        let task = NodeExecutionTask::new("run-1", "embed");
        let next = task.next_attempt();
        assert_eq!(next.attempt, 2);
        assert_eq!(next.id().as_str(), "run-1:embed:2");
        // original untouched
        assert_eq!(task.attempt, 1);
    }

    #[test]
    fn test_attempt_clamped_to_one() {
        let task = NodeExecutionTask::new("run-1", "embed").with_attempt(0);
        assert_eq!(task.attempt, 1);
    }

    #[test]
    fn test_status_transitions_one_directional() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));

        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));

        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for to in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_scheduled_task_age_reference() {
        let entry = ScheduledTask::new(NodeExecutionTask::new("run-1", "embed"));
        assert_eq!(entry.age_reference(), entry.scheduled_at);

        let mut done = entry.clone();
        let later = Utc::now();
        done.completed_at = Some(later);
        assert_eq!(done.age_reference(), later);
    }

    #[test]
    fn test_node_context_from_task() {
        let task = NodeExecutionTask::new("run-1", "embed").with_context("k", 42);
        let ctx = NodeContext::for_task(&task);
        assert_eq!(ctx.run_id, "run-1");
        assert_eq!(ctx.node_id, "embed");
        assert_eq!(ctx.attributes.get("k"), Some(&Value::from(42)));
    }
}
