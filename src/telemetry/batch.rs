//! Batch execution span helpers.

use tracing::Span;

/// Start a span covering one batch: dispatch, parse and reconciliation.
///
/// `batch.model` and the outcome counts are filled in as the batch resolves.
pub fn start_batch_span(kind: &str, user_id: &str, index: usize, size: usize) -> Span {
    tracing::info_span!(
        "batch.execute",
        "batch.kind" = kind,
        "batch.user_id" = user_id,
        "batch.index" = index,
        "batch.size" = size,
        "batch.model" = tracing::field::Empty,
        "batch.succeeded" = tracing::field::Empty,
        "batch.failed" = tracing::field::Empty,
    )
}

/// Record which model served the batch.
pub fn record_batch_model(span: &Span, model: &str) {
    span.record("batch.model", model);
}

/// Record the batch's outcome counts and emit a summary event in its scope.
pub fn record_batch_outcome(span: &Span, succeeded: usize, failed: usize) {
    span.record("batch.succeeded", succeeded);
    span.record("batch.failed", failed);
    span.in_scope(|| {
        tracing::info!(succeeded, failed, "batch_finished");
    });
}
