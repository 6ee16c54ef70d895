//! Exponential backoff keyed by an opaque context string.
//!
//! One controller per process, shared by reference. Attempt counters live in
//! the instance, so tests get fresh state by building a new one.

use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::config::BackoffConfig;
use crate::error::Error;
use crate::telemetry::metrics;

/// Lowercase fragments providers put in rate-limit error messages.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
    "resource_exhausted",
    "overloaded",
];

pub struct BackoffController {
    config: BackoffConfig,
    attempts: Mutex<HashMap<String, u32>>,
}

impl BackoffController {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Does this error mean "slow down" rather than "broken"?
    pub fn classify(error: &Error) -> bool {
        match error {
            Error::RateLimited { .. } => true,
            Error::Provider { status, message } => {
                *status == Some(429) || is_rate_limit_message(message)
            }
            _ => false,
        }
    }

    /// Delay before the next retry for `context_key`, counting this attempt.
    ///
    /// `base * 2^min(attempts, cap_exponent)`, clamped to `max_delay_ms`.
    pub fn next_delay(&self, context_key: &str) -> Duration {
        let attempt = {
            let mut attempts = self.lock();
            let counter = attempts.entry(context_key.to_string()).or_insert(0);
            let current = *counter;
            *counter = counter.saturating_add(1);
            current
        };

        let exponent = attempt.min(self.config.cap_exponent).min(63);
        let delay_ms = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_delay_ms);

        debug!(context_key, attempt, delay_ms, "backoff delay computed");
        metrics::backoff_delay_ms().record(
            delay_ms as f64,
            &[KeyValue::new("attempt", i64::from(attempt))],
        );
        Duration::from_millis(delay_ms)
    }

    /// Forget the attempt count for `context_key`. Called on success.
    pub fn reset(&self, context_key: &str) {
        self.lock().remove(context_key);
    }

    /// Attempts recorded so far for `context_key`.
    pub fn attempts(&self, context_key: &str) -> u32 {
        self.lock().get(context_key).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}
