//! # Error Handling Orchestrator
//!
//! [`ErrorHandler`] drives the full recovery path for one node failure:
//!
//! 1. snapshot the circuit breaker and auto-fix capability into an
//!    [`ErrorContext`],
//! 2. run the pure [`ErrorPolicyEngine`] to get a decision,
//! 3. write the decision to the audit trail (the write must complete before
//!    anything executes - error handling is reconstructible from audit
//!    records alone),
//! 4. execute the decision: schedule the retry, attempt the repair, create
//!    the human review task, or record the breaker failure,
//! 5. re-audit whenever execution amended the decision (a repair result or
//!    review task id was attached, or a failed auto-fix degraded to human
//!    review).
//!
//! Failures inside execution collaborators do not escape as panics or lost
//! decisions; the decision object always comes back to the caller, amended
//! to reflect what actually happened.

use std::sync::Arc;

use tracing::{info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::error::{ErrorKind, ErrorPayload, RedriveResult};
use crate::policy::{ErrorAction, ErrorContext, ErrorHandlingDecision, ErrorPolicyEngine};
use crate::scheduler::TaskScheduler;
use crate::services::{AuditService, HitlService, SelfHealingService};
use crate::task::NodeContext;

/// Executes error-handling decisions against the recovery collaborators.
pub struct ErrorHandler {
    engine: ErrorPolicyEngine,
    scheduler: Arc<TaskScheduler>,
    breakers: CircuitBreakerRegistry,
    self_healing: Arc<dyn SelfHealingService>,
    hitl: Arc<dyn HitlService>,
    audit: Arc<dyn AuditService>,
}

impl ErrorHandler {
    /// Wire an error handler from its collaborators.
    ///
    /// The breaker registry must be the same instance the scheduler
    /// dispatches through, so aborts recorded here refuse dispatch there.
    pub fn new(
        engine: ErrorPolicyEngine,
        scheduler: Arc<TaskScheduler>,
        breakers: CircuitBreakerRegistry,
        self_healing: Arc<dyn SelfHealingService>,
        hitl: Arc<dyn HitlService>,
        audit: Arc<dyn AuditService>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            breakers,
            self_healing,
            hitl,
            audit,
        }
    }

    /// Handle one node execution failure and return the (executed) decision.
    ///
    /// The returned decision reflects execution amendments: a successful
    /// repair carries `fixed_input`, an escalation carries `hitl_task_id`,
    /// and a failed repair comes back as `HumanReview` rather than
    /// `AutoFix`. Every version of the decision that existed is in the audit
    /// trail.
    pub async fn handle_error(
        &self,
        error: ErrorPayload,
        node_context: NodeContext,
    ) -> RedriveResult<ErrorHandlingDecision> {
        let breaker = self.breakers.snapshot(&error.origin_node);
        let auto_fixable =
            error.kind == ErrorKind::Validation && self.self_healing.can_auto_fix(&error).await;

        let ctx = ErrorContext::new(error, node_context, breaker, auto_fixable);
        let mut decision = self.engine.decide(&ctx);
        info!(
            origin_node = %ctx.error.origin_node,
            action = %decision.action,
            reason = %decision.reason,
            "Error handling decision"
        );

        // the decision is not final until this write completes
        self.audit.log_error_handling(&ctx.error, &decision).await?;

        let amended = self.execute(&ctx, &mut decision).await?;
        if amended {
            self.audit.log_error_handling(&ctx.error, &decision).await?;
        }
        Ok(decision)
    }

    /// Execute a decision. Returns whether the decision was amended (and so
    /// needs re-auditing).
    async fn execute(
        &self,
        ctx: &ErrorContext,
        decision: &mut ErrorHandlingDecision,
    ) -> RedriveResult<bool> {
        match decision.action {
            ErrorAction::Retry => {
                let delay = decision
                    .delay
                    .unwrap_or_else(|| self.engine.backoff().delay_for_attempt(ctx.error.attempt));
                self.scheduler
                    .schedule_retry(&ctx.node_context.run_id, &ctx.node_context.node_id, delay)
                    .await?;
                Ok(false)
            }

            ErrorAction::AutoFix => {
                let fix = self
                    .self_healing
                    .attempt_fix(&ctx.error, &ctx.node_context)
                    .await;
                match fix {
                    Ok(outcome) if outcome.success => {
                        decision.fixed_input = outcome.result;
                        Ok(true)
                    }
                    other => {
                        if let Err(err) = other {
                            warn!(
                                origin_node = %ctx.error.origin_node,
                                error = %err,
                                "Self-healing attempt errored"
                            );
                        }
                        self.degrade_to_human_review(ctx, decision).await?;
                        Ok(true)
                    }
                }
            }

            ErrorAction::HumanReview => {
                let task_id = self
                    .hitl
                    .create_review_task(&ctx.error, &ctx.node_context)
                    .await?;
                decision.hitl_task_id = Some(task_id);
                Ok(true)
            }

            ErrorAction::Abort => {
                self.breakers.record_failure(&ctx.error.origin_node);
                Ok(false)
            }

            // routing for these is the caller's responsibility
            ErrorAction::Fallback
            | ErrorAction::Escalate
            | ErrorAction::DelegateToPlatform
            | ErrorAction::CustomRecovery => Ok(false),
        }
    }

    /// A failed automated repair becomes a human review escalation.
    async fn degrade_to_human_review(
        &self,
        ctx: &ErrorContext,
        decision: &mut ErrorHandlingDecision,
    ) -> RedriveResult<()> {
        decision.action = ErrorAction::HumanReview;
        decision.reason = "automated repair failed, escalating to human review".to_string();
        decision.should_escalate = true;

        let task_id = self
            .hitl
            .create_review_task(&ctx.error, &ctx.node_context)
            .await?;
        decision.hitl_task_id = Some(task_id);
        Ok(())
    }
}
