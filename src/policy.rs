//! # Error Policy Engine - Deciding What Happens After a Failure
//!
//! [`ErrorPolicyEngine::decide`] is a pure function from an error snapshot to
//! an [`ErrorHandlingDecision`]. Evaluation follows a strict priority order,
//! first match wins:
//!
//! 1. Circuit breaker open for the origin node → [`ErrorAction::Abort`]
//! 2. An explicitly configured [`PolicyRule`] matches → that rule's action,
//!    verbatim
//! 3. The error is retryable with attempt budget left → [`ErrorAction::Retry`]
//!    with an exponential-backoff delay
//! 4. A validation failure the self-healing collaborator can repair →
//!    [`ErrorAction::AutoFix`]
//! 5. The escalation policy applies → [`ErrorAction::HumanReview`]
//! 6. Nothing else applies → [`ErrorAction::Abort`]
//!
//! The engine performs no I/O: circuit-breaker state and auto-fix capability
//! arrive pre-resolved inside the [`ErrorContext`] snapshot, which is what
//! keeps decisions reproducible from the audit trail alone.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backoff::BackoffPolicy;
use crate::breaker::BreakerSnapshot;
use crate::config::{RecoveryConfig, ReviewThreshold};
use crate::error::{ErrorKind, ErrorPayload};
use crate::task::NodeContext;

/// Every way the platform can react to a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorAction {
    /// Re-dispatch the node after a delay.
    Retry,
    /// Let the self-healing collaborator repair the input and re-run.
    AutoFix,
    /// Create a human review task and wait for a decision.
    HumanReview,
    /// Route the run to a configured fallback node (caller's concern).
    Fallback,
    /// Stop this node; the breaker records the failure and the run
    /// collaborator marks the run failed.
    Abort,
    /// Escalate through the platform's operational channel (caller's
    /// concern).
    Escalate,
    /// Defer to platform-level recovery (caller's concern).
    DelegateToPlatform,
    /// Invoke a deployment-specific recovery hook (caller's concern).
    CustomRecovery,
}

impl std::fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorAction::Retry => "retry",
            ErrorAction::AutoFix => "auto_fix",
            ErrorAction::HumanReview => "human_review",
            ErrorAction::Fallback => "fallback",
            ErrorAction::Abort => "abort",
            ErrorAction::Escalate => "escalate",
            ErrorAction::DelegateToPlatform => "delegate_to_platform",
            ErrorAction::CustomRecovery => "custom_recovery",
        };
        write!(f, "{name}")
    }
}

/// The outcome of error handling for one failure occurrence.
///
/// Produced once per occurrence by [`ErrorPolicyEngine::decide`]. After the
/// initial audit write the only mutations allowed are the orchestrator's own
/// execution-step amendments (attaching a fix result or HITL task id,
/// degrading a failed auto-fix to human review), each of which is re-audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingDecision {
    pub action: ErrorAction,
    /// Why this action was chosen.
    pub reason: String,
    /// Structured context for the audit trail.
    pub metadata: HashMap<String, Value>,
    /// Convenience flag: the action re-dispatches the node.
    pub should_retry: bool,
    /// Convenience flag: a human needs to look at this.
    pub should_escalate: bool,
    /// Retry delay, set when `action == Retry`.
    pub delay: Option<Duration>,
    /// Review task id, attached once the HITL collaborator created it.
    pub hitl_task_id: Option<String>,
    /// Repaired input, attached after a successful auto-fix.
    pub fixed_input: Option<Value>,
}

impl ErrorHandlingDecision {
    /// Create a bare decision; flags and attachments start empty.
    pub fn new<S: Into<String>>(action: ErrorAction, reason: S) -> Self {
        Self {
            action,
            reason: reason.into(),
            metadata: HashMap::new(),
            should_retry: action == ErrorAction::Retry,
            should_escalate: matches!(
                action,
                ErrorAction::HumanReview | ErrorAction::Escalate
            ),
            delay: None,
            hitl_task_id: None,
            fixed_input: None,
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the retry delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Condition half of an externally configured policy rule.
///
/// Every populated field must hold for the rule to match; empty/`None`
/// fields match anything. This is the structured rendering of the platform's
/// expression-based rule conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Match any of these kinds (empty = any kind).
    pub kinds: Vec<ErrorKind>,
    /// Match on the payload's retryable flag.
    pub retryable: Option<bool>,
    /// Match a specific origin node.
    pub origin_node: Option<String>,
    /// Match attempts at or above this number.
    pub min_attempt: Option<u32>,
    /// Match when the failure message contains this substring.
    pub message_contains: Option<String>,
}

impl RuleCondition {
    /// Whether this condition holds for the payload.
    pub fn matches(&self, error: &ErrorPayload) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&error.kind) {
            return false;
        }
        if self.retryable.is_some_and(|r| r != error.retryable) {
            return false;
        }
        if self
            .origin_node
            .as_ref()
            .is_some_and(|node| node != &error.origin_node)
        {
            return false;
        }
        if self.min_attempt.is_some_and(|min| error.attempt < min) {
            return false;
        }
        if self
            .message_contains
            .as_ref()
            .is_some_and(|needle| !error.message.contains(needle.as_str()))
        {
            return false;
        }
        true
    }
}

/// An externally configured override: when the condition matches, the rule's
/// action is used verbatim and the built-in steps are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule identifier, recorded in decision metadata.
    pub name: String,
    pub condition: RuleCondition,
    pub action: ErrorAction,
    /// Reason recorded on matching decisions; defaults to the rule name.
    pub reason: Option<String>,
}

impl PolicyRule {
    /// Create a rule with an empty (match-all) condition.
    pub fn new<S: Into<String>>(name: S, action: ErrorAction) -> Self {
        Self {
            name: name.into(),
            condition: RuleCondition::default(),
            action,
            reason: None,
        }
    }

    /// Set the condition.
    pub fn with_condition(mut self, condition: RuleCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Set the recorded reason.
    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Read-only snapshot assembled per error-handling call.
///
/// `auto_fixable` is resolved by the orchestrator (one collaborator call)
/// before the engine runs, so [`ErrorPolicyEngine::decide`] stays pure.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error: ErrorPayload,
    pub node_context: NodeContext,
    pub breaker: BreakerSnapshot,
    pub auto_fixable: bool,
}

impl ErrorContext {
    /// Assemble a context snapshot.
    pub fn new(
        error: ErrorPayload,
        node_context: NodeContext,
        breaker: BreakerSnapshot,
        auto_fixable: bool,
    ) -> Self {
        Self {
            error,
            node_context,
            breaker,
            auto_fixable,
        }
    }
}

/// Pure decision function over the failure taxonomy, configured rules,
/// retry budget, breaker state and escalation policy.
#[derive(Debug, Clone)]
pub struct ErrorPolicyEngine {
    review_threshold: ReviewThreshold,
    backoff: BackoffPolicy,
    rules: Vec<PolicyRule>,
}

impl ErrorPolicyEngine {
    /// Build the engine from configuration, with no external rules.
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            review_threshold: config.human_review_threshold,
            backoff: BackoffPolicy::from_config(config),
            rules: Vec::new(),
        }
    }

    /// Install externally configured rules (checked in order).
    pub fn with_rules(mut self, rules: Vec<PolicyRule>) -> Self {
        self.rules = rules;
        self
    }

    /// The engine's backoff policy.
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Produce the decision for one failure occurrence.
    pub fn decide(&self, ctx: &ErrorContext) -> ErrorHandlingDecision {
        let error = &ctx.error;

        // 1. Open breaker short-circuits everything.
        if ctx.breaker.open {
            return ErrorHandlingDecision::new(ErrorAction::Abort, "circuit breaker open")
                .with_metadata("failure_count", ctx.breaker.failure_count);
        }

        // 2. Configured rules take precedence over the built-in steps.
        if let Some(rule) = self.rules.iter().find(|r| r.condition.matches(error)) {
            let reason = rule.reason.clone().unwrap_or_else(|| {
                format!("policy rule '{}' matched", rule.name)
            });
            let mut decision = ErrorHandlingDecision::new(rule.action, reason)
                .with_metadata("rule", rule.name.clone());
            if rule.action == ErrorAction::Retry {
                decision = decision.with_delay(self.backoff.delay_for_attempt(error.attempt));
            }
            return decision;
        }

        // 3. Retry while budget remains.
        if error.retryable && error.attempts_remaining() {
            let delay = self.backoff.delay_for_attempt(error.attempt);
            return ErrorHandlingDecision::new(
                ErrorAction::Retry,
                format!(
                    "retryable failure, attempt {} of {}",
                    error.attempt, error.max_attempts
                ),
            )
            .with_delay(delay);
        }

        // 4. Repairable validation failures.
        if error.kind == ErrorKind::Validation && ctx.auto_fixable {
            return ErrorHandlingDecision::new(
                ErrorAction::AutoFix,
                "validation failure accepted for automated repair",
            );
        }

        // 5. Human escalation.
        if let Some(reason) = self.escalation_reason(error) {
            return ErrorHandlingDecision::new(ErrorAction::HumanReview, reason);
        }

        // 6. Nothing left to try.
        ErrorHandlingDecision::new(ErrorAction::Abort, "no recovery strategy available")
    }

    /// Escalation check: security failures always escalate; the configured
    /// threshold widens or narrows the rest; three or more attempts escalate
    /// regardless of policy.
    fn escalation_reason(&self, error: &ErrorPayload) -> Option<String> {
        if error.kind == ErrorKind::Security {
            return Some("security failure requires human review".to_string());
        }
        match self.review_threshold {
            ReviewThreshold::Error => {
                return Some("escalation threshold includes all errors".to_string());
            }
            ReviewThreshold::Critical | ReviewThreshold::None => {}
        }
        if error.attempt >= 3 {
            return Some(format!(
                "repeated failure safety net after {} attempts",
                error.attempt
            ));
        }
        None
    }
}
