//! Metric instrument factories for rapport-llm.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"rapport-llm"` meter; with no
//! provider installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for rapport-llm instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("rapport-llm")
}

/// Counter: rate limit checks.
/// Labels: `model`, `result` ("allowed" | "limited").
pub fn rate_limit_checks() -> Counter<u64> {
    meter()
        .u64_counter("rapport.ratelimit.checks")
        .with_description("Rate limit checks by outcome")
        .build()
}

/// Counter: fallback orchestrator decisions.
/// Labels: `model`, `decision` ("primary" | "fallback" | "waited" | "abort").
pub fn fallback_decisions() -> Counter<u64> {
    meter()
        .u64_counter("rapport.fallback.decisions")
        .with_description("Model decisions made under rate limiting")
        .build()
}

/// Histogram: computed backoff delays in milliseconds.
/// Labels: `attempt`.
pub fn backoff_delay_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("rapport.backoff.delay_ms")
        .with_description("Backoff delay before retrying a rate-limited call")
        .with_unit("ms")
        .build()
}

/// Histogram: time an operation spent queued before admission.
/// Labels: `priority`.
pub fn queue_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("rapport.queue.wait_ms")
        .with_description("Time spent waiting for an execution slot")
        .with_unit("ms")
        .build()
}

/// Counter: operations that left the concurrency controller.
/// Labels: `model`, `result` ("ok" | "error").
pub fn operations_finished() -> Counter<u64> {
    meter()
        .u64_counter("rapport.queue.operations_finished")
        .with_description("Operations finished by the concurrency controller")
        .build()
}

/// Counter: provider calls.
/// Labels: `model`, `provider`, `result` ("ok" | "rate_limited" | "error" | "timeout").
pub fn provider_requests() -> Counter<u64> {
    meter()
        .u64_counter("rapport.llm.requests")
        .with_description("LLM provider requests")
        .build()
}

/// Counter: LLM token usage.
/// Labels: `model`.
pub fn llm_tokens() -> Counter<u64> {
    meter()
        .u64_counter("rapport.llm.tokens")
        .with_description("LLM token usage")
        .build()
}

/// Counter: per-item batch outcomes.
/// Labels: `kind`, `outcome` ("success" | "failure" | "skipped").
pub fn batch_items() -> Counter<u64> {
    meter()
        .u64_counter("rapport.batch.items")
        .with_description("Work items by batch outcome")
        .build()
}
