//! Provider-call spans following the OpenTelemetry GenAI conventions.
//!
//! One span per attempt. Besides the `gen_ai.*` attributes each span carries
//! the attempt number and how many work items the prompt covers, so a retried
//! batch shows up as sibling spans under its batch span.

use tracing::Span;

/// Start a span for one completion attempt.
pub fn start_chat_span(model: &str, provider: &str, attempt: u32, item_count: usize) -> Span {
    tracing::info_span!(
        "gen_ai.chat",
        "gen_ai.operation.name" = "chat",
        "gen_ai.request.model" = model,
        "gen_ai.provider.name" = provider,
        "gen_ai.usage.input_tokens" = tracing::field::Empty,
        "gen_ai.usage.output_tokens" = tracing::field::Empty,
        "rapport.attempt" = attempt,
        "rapport.item_count" = item_count,
        "error.type" = tracing::field::Empty,
    )
}

pub fn record_token_usage(span: &Span, input: u64, output: u64) {
    span.record("gen_ai.usage.input_tokens", input);
    span.record("gen_ai.usage.output_tokens", output);
}

/// Mark the attempt failed. `kind` is a low-cardinality class such as
/// "rate_limited" or "timeout".
pub fn record_error(span: &Span, kind: &str) {
    span.record("error.type", kind);
}
