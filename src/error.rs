//! # Error Handling - Crate Errors and the Failure Taxonomy
//!
//! This module provides two layers of error handling for the Redrive core:
//!
//! 1. [`RedriveError`] / [`RedriveResult`] — categorized errors produced by the
//!    core itself (registry failures, queue I/O, dispatch hand-off, audit
//!    writes, configuration problems).
//! 2. [`ErrorPayload`] / [`ErrorKind`] — the taxonomy of *node execution*
//!    failures that the error policy engine reasons about. These describe what
//!    went wrong inside an executor, not inside this crate.
//!
//! ## 🎯 Design Philosophy
//!
//! Errors are designed to be:
//! - **Clear**: messages explain what happened
//! - **Categorized**: different variants for different failure surfaces
//! - **Routable**: the taxonomy drives the recovery decision (retry,
//!   auto-fix, human review, abort)
//!
//! ## 📊 Error Categories
//!
//! | Error Type | When It Occurs | How to Fix |
//! |------------|----------------|------------|
//! | `NoExecutorAvailable` | No executor registered for a node | Register an executor before scheduling |
//! | `Dispatch` | Executor hand-off failed | Check executor health; the entry is marked failed |
//! | `Registry` | Task registry operation failed | Usually a poisoned lock; restart the shard |
//! | `Queue` | Delay queue I/O failed | Check the queue backend |
//! | `Audit` | Audit write did not complete | The decision is not final; retry the call |
//! | `Configuration` | Invalid option or policy | Check `RecoveryConfig` values |
//! | `Generic` | Anything else | Check the specific message |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Categorized error type for the dispatch-and-recovery core.
///
/// Covers every failure surface of the crate itself. Node execution failures
/// are *not* represented here; those travel as [`ErrorPayload`] values through
/// the error policy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedriveError {
    /// No executor is registered for the requested node.
    ///
    /// This is the only scheduling failure that propagates to the caller of
    /// `schedule_task`; everything downstream of executor resolution is
    /// funneled through the registry and the error policy engine.
    NoExecutorAvailable(String),

    /// The executor hand-off failed.
    Dispatch(String),

    /// A task registry operation failed.
    Registry(String),

    /// A delay queue operation failed.
    Queue(String),

    /// An audit write did not complete.
    ///
    /// Audit writes are mandatory: a decision is not considered final until
    /// its audit record is acknowledged.
    Audit(String),

    /// Invalid configuration or policy.
    Configuration(String),

    /// General-purpose error for other scenarios.
    Generic(String),
}

impl RedriveError {
    /// Create a new no-executor-available error for a node.
    pub fn no_executor<S: Into<String>>(node_id: S) -> Self {
        RedriveError::NoExecutorAvailable(node_id.into())
    }

    /// Create a new dispatch error.
    pub fn dispatch<S: Into<String>>(msg: S) -> Self {
        RedriveError::Dispatch(msg.into())
    }

    /// Create a new registry error.
    pub fn registry<S: Into<String>>(msg: S) -> Self {
        RedriveError::Registry(msg.into())
    }

    /// Create a new queue error.
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        RedriveError::Queue(msg.into())
    }

    /// Create a new audit error.
    pub fn audit<S: Into<String>>(msg: S) -> Self {
        RedriveError::Audit(msg.into())
    }

    /// Create a new configuration error.
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        RedriveError::Configuration(msg.into())
    }

    /// Create a new generic error.
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        RedriveError::Generic(msg.into())
    }

    /// Get the error message as a string slice.
    pub fn message(&self) -> &str {
        match self {
            RedriveError::NoExecutorAvailable(msg) => msg,
            RedriveError::Dispatch(msg) => msg,
            RedriveError::Registry(msg) => msg,
            RedriveError::Queue(msg) => msg,
            RedriveError::Audit(msg) => msg,
            RedriveError::Configuration(msg) => msg,
            RedriveError::Generic(msg) => msg,
        }
    }

    /// Get the error category as a string.
    pub fn category(&self) -> &'static str {
        match self {
            RedriveError::NoExecutorAvailable(_) => "no_executor_available",
            RedriveError::Dispatch(_) => "dispatch",
            RedriveError::Registry(_) => "registry",
            RedriveError::Queue(_) => "queue",
            RedriveError::Audit(_) => "audit",
            RedriveError::Configuration(_) => "configuration",
            RedriveError::Generic(_) => "generic",
        }
    }
}

impl std::fmt::Display for RedriveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedriveError::NoExecutorAvailable(node) => {
                write!(f, "No executor available for node: {node}")
            }
            RedriveError::Dispatch(msg) => write!(f, "Dispatch error: {msg}"),
            RedriveError::Registry(msg) => write!(f, "Registry error: {msg}"),
            RedriveError::Queue(msg) => write!(f, "Queue error: {msg}"),
            RedriveError::Audit(msg) => write!(f, "Audit error: {msg}"),
            RedriveError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            RedriveError::Generic(msg) => write!(f, "Error: {msg}"),
        }
    }
}

impl std::error::Error for RedriveError {}

impl From<Box<dyn std::error::Error + Send + Sync>> for RedriveError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        RedriveError::Generic(err.to_string())
    }
}

impl From<&str> for RedriveError {
    fn from(err: &str) -> Self {
        RedriveError::Generic(err.to_string())
    }
}

impl From<String> for RedriveError {
    fn from(err: String) -> Self {
        RedriveError::Generic(err)
    }
}

impl From<serde_json::Error> for RedriveError {
    fn from(err: serde_json::Error) -> Self {
        RedriveError::Generic(format!("Serialization error: {err}"))
    }
}

/// Convenient Result type alias for Redrive operations.
pub type RedriveResult<T> = Result<T, RedriveError>;

/// Classification of node execution failures.
///
/// The policy engine routes on this taxonomy:
///
/// - [`Validation`](ErrorKind::Validation) — potentially auto-fixable input
///   or schema problems
/// - [`Security`](ErrorKind::Security) — always escalated to a human, never
///   silently retried
/// - [`Transient`](ErrorKind::Transient) — retryable infrastructure hiccups
/// - [`Permanent`](ErrorKind::Permanent) — not retryable, no auto-fix path
/// - [`Timeout`](ErrorKind::Timeout) — retryable up to the policy limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Security,
    Transient,
    Permanent,
    Timeout,
}

impl ErrorKind {
    /// Whether failures of this kind are retryable by default.
    ///
    /// Callers building an [`ErrorPayload`] can override this per occurrence;
    /// the policy engine only consults the payload's `retryable` flag.
    pub fn retryable_by_default(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Security => "SecurityError",
            ErrorKind::Transient => "TransientError",
            ErrorKind::Permanent => "PermanentError",
            ErrorKind::Timeout => "TimeoutError",
        };
        write!(f, "{name}")
    }
}

/// A node execution failure as seen by the error policy engine.
///
/// Built by the workflow-run collaborator when an executor reports failure,
/// then handed to [`ErrorHandler::handle_error`](crate::handler::ErrorHandler::handle_error).
/// The payload is a value object: once constructed it is not mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Failure classification.
    pub kind: ErrorKind,
    /// The node whose execution failed.
    pub origin_node: String,
    /// 1-based attempt number of the failed execution.
    pub attempt: u32,
    /// The policy's attempt ceiling for this node.
    pub max_attempts: u32,
    /// Whether this occurrence may be retried.
    pub retryable: bool,
    /// Human-readable failure description.
    pub message: String,
    /// Underlying cause, if the executor reported one.
    pub cause: Option<String>,
}

impl ErrorPayload {
    /// Create a payload with the kind's default retryability and a 1/3
    /// attempt budget. Adjust with the builder methods.
    pub fn new<S: Into<String>>(kind: ErrorKind, origin_node: S) -> Self {
        Self {
            kind,
            origin_node: origin_node.into(),
            attempt: 1,
            max_attempts: 3,
            retryable: kind.retryable_by_default(),
            message: String::new(),
            cause: None,
        }
    }

    /// Set the attempt number of the failed execution.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the retryable flag for this occurrence.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Set the failure message.
    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = message.into();
        self
    }

    /// Attach the underlying cause.
    pub fn with_cause<S: Into<String>>(mut self, cause: S) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Whether the policy still has attempt budget for this node.
    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Render the payload as a flat metadata map for audit records.
    pub fn to_metadata(&self) -> HashMap<String, Value> {
        let mut meta = HashMap::new();
        meta.insert(
            "error_type".to_string(),
            Value::String(self.kind.to_string()),
        );
        meta.insert(
            "origin_node".to_string(),
            Value::String(self.origin_node.clone()),
        );
        meta.insert("attempt".to_string(), Value::from(self.attempt));
        meta.insert("max_attempts".to_string(), Value::from(self.max_attempts));
        meta.insert("retryable".to_string(), Value::Bool(self.retryable));
        meta
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at node '{}' (attempt {}/{}): {}",
            self.kind, self.origin_node, self.attempt, self.max_attempts, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = RedriveError::registry("Test error");
        assert_eq!(error.message(), "Test error");
        assert_eq!(error.category(), "registry");
    }

    #[test]
    fn test_error_display() {
        let error = RedriveError::no_executor("http-request");
        assert_eq!(
            format!("{error}"),
            "No executor available for node: http-request"
        );
    }

    #[test]
    fn test_error_conversions() {
        let error1: RedriveError = "Test error".into();
        let error2: RedriveError = "Test error".to_string().into();

        match (&error1, &error2) {
            (RedriveError::Generic(msg1), RedriveError::Generic(msg2)) => {
                assert_eq!(msg1, msg2);
            }
            _ => panic!("Expected Generic errors"),
        }
    }

    #[test]
    fn test_kind_default_retryability() {
        assert!(ErrorKind::Transient.retryable_by_default());
        assert!(ErrorKind::Timeout.retryable_by_default());
        assert!(!ErrorKind::Validation.retryable_by_default());
        assert!(!ErrorKind::Security.retryable_by_default());
        assert!(!ErrorKind::Permanent.retryable_by_default());
    }

    #[test]
    fn test_kind_display_names() {
        assert_eq!(ErrorKind::Validation.to_string(), "ValidationError");
        assert_eq!(ErrorKind::Security.to_string(), "SecurityError");
        assert_eq!(ErrorKind::Timeout.to_string(), "TimeoutError");
    }

    #[test]
    fn test_payload_builder() {
        let payload = ErrorPayload::new(ErrorKind::Transient, "embed")
            .with_attempt(2)
            .with_max_attempts(5)
            .with_message("connection reset")
            .with_cause("io: reset by peer");

        assert_eq!(payload.attempt, 2);
        assert_eq!(payload.max_attempts, 5);
        assert!(payload.retryable);
        assert!(payload.attempts_remaining());
        assert_eq!(payload.cause.as_deref(), Some("io: reset by peer"));
    }

    #[test]
    fn test_payload_metadata() {
        let payload = ErrorPayload::new(ErrorKind::Security, "guard").with_message("blocked");
        let meta = payload.to_metadata();
        assert_eq!(
            meta.get("error_type"),
            Some(&Value::String("SecurityError".to_string()))
        );
        assert_eq!(meta.get("retryable"), Some(&Value::Bool(false)));
    }
}
