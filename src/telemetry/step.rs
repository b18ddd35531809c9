//! Step execution span helpers.

use tracing::Span;

use crate::model::WorkflowInvocation;

/// Start a span covering one dispatched invocation.
///
/// `step.outcome` is declared empty and filled in by [`record_outcome`].
pub fn start_step_span(invocation: &WorkflowInvocation) -> Span {
    tracing::info_span!(
        "step.dispatch",
        "workflow.name" = %invocation.workflow,
        "step.name" = %invocation.step,
        "invocation.id" = %invocation.id.0,
        "invocation.queued_by" = %invocation.queued_by,
        "step.outcome" = tracing::field::Empty,
    )
}

/// Record the dispatch outcome on the span and emit an event inside it.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("step.outcome", outcome);
    span.in_scope(|| {
        tracing::info!(outcome, "step_outcome");
    });
}
