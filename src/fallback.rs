//! Fallback orchestration: turn rate-limit state into an executable decision.
//!
//! Per invocation, in order: primary model if allowed; fallback model if set,
//! the primary is not already the lowest tier, and the fallback is allowed;
//! otherwise wait for the primary's window to clear if that fits within
//! `max_wait`; otherwise abort. Abort is backpressure, not an error.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backoff::BackoffController;
use crate::error::Error;
use crate::limiter::RateLimiter;
use crate::model::RateLimitStrategy;
use crate::telemetry::metrics;

/// What the caller should do about a provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Call `model_id` now. `waited` is time already spent suspended.
    Proceed {
        model_id: String,
        waited: Duration,
        fell_back: bool,
    },
    /// Do not call the provider now; the window opens in `wait`.
    Abort { model_id: String, wait: Duration },
}

impl Decision {
    pub fn model_id(&self) -> &str {
        match self {
            Decision::Proceed { model_id, .. } | Decision::Abort { model_id, .. } => model_id,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Decision::Abort { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Decision::Proceed {
                fell_back: true, ..
            } => "fallback",
            Decision::Proceed { waited, .. } if !waited.is_zero() => "waited",
            Decision::Proceed { .. } => "primary",
            Decision::Abort { .. } => "abort",
        }
    }
}

/// How to continue after a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Rate limited; the backoff delay has already been slept.
    Retry { delay: Duration },
    /// Not ours to retry here.
    Propagate,
}

pub struct FallbackOrchestrator {
    limiter: Arc<RateLimiter>,
    backoff: Arc<BackoffController>,
}

impl FallbackOrchestrator {
    pub fn new(limiter: Arc<RateLimiter>, backoff: Arc<BackoffController>) -> Self {
        Self { limiter, backoff }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Decide which model to call for `user_id`, suspending if the strategy
    /// allows waiting out the primary's limit.
    ///
    /// A `Proceed` decision carries one request already reserved against the
    /// chosen model, so concurrent callers cannot overrun a cap between
    /// deciding and calling.
    pub async fn decide(&self, user_id: &str, strategy: &RateLimitStrategy) -> Decision {
        let decision = self.decide_inner(user_id, strategy).await;
        metrics::fallback_decisions().add(
            1,
            &[
                KeyValue::new("model", decision.model_id().to_string()),
                KeyValue::new("decision", decision.label()),
            ],
        );
        decision
    }

    async fn decide_inner(&self, user_id: &str, strategy: &RateLimitStrategy) -> Decision {
        let primary = &strategy.primary_model;
        let mut waited = Duration::ZERO;
        let mut at = Utc::now();

        loop {
            let check = self.limiter.try_acquire_at(user_id, primary, at);
            if check.allowed {
                return Decision::Proceed {
                    model_id: primary.clone(),
                    waited,
                    fell_back: false,
                };
            }

            if let Some(fallback) = &strategy.fallback_model {
                if !self.limiter.is_lowest_tier(primary)
                    && self.limiter.try_acquire_at(user_id, fallback, at).allowed
                {
                    info!(user_id, primary = %primary, fallback = %fallback, "primary model limited, falling back");
                    return Decision::Proceed {
                        model_id: fallback.clone(),
                        waited,
                        fell_back: true,
                    };
                }
            }

            let budget = strategy.max_wait.saturating_sub(waited);
            let wait = match check.reset_time {
                Some(reset) => (reset - at).to_std().unwrap_or(Duration::ZERO),
                None => budget,
            };

            if wait > budget {
                warn!(
                    user_id,
                    model = %primary,
                    wait_ms = wait.as_millis() as u64,
                    max_wait_ms = strategy.max_wait.as_millis() as u64,
                    suggestion = check.suggestion.as_deref().unwrap_or(""),
                    "rate limit wait exceeds strategy bound, aborting"
                );
                return Decision::Abort {
                    model_id: primary.clone(),
                    wait,
                };
            }

            info!(
                user_id,
                model = %primary,
                wait_ms = wait.as_millis() as u64,
                "waiting for rate limit window to clear"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
            // Another caller may take the freed slot first; go around again.
            at = match check.reset_time {
                Some(reset) => reset.max(Utc::now()),
                None => Utc::now(),
            };
        }
    }

    /// React to a provider error for `context_key`.
    ///
    /// Rate-limit errors sleep the next backoff delay when the strategy
    /// enables backoff and the delay fits in what is left of `max_wait`.
    /// Everything else propagates untouched.
    pub async fn recover(
        &self,
        context_key: &str,
        error: &Error,
        strategy: &RateLimitStrategy,
        waited_so_far: Duration,
    ) -> Recovery {
        if !strategy.enable_backoff || !BackoffController::classify(error) {
            return Recovery::Propagate;
        }

        let delay = self.backoff.next_delay(context_key);
        if waited_so_far + delay > strategy.max_wait {
            warn!(
                context_key,
                delay_ms = delay.as_millis() as u64,
                waited_ms = waited_so_far.as_millis() as u64,
                "backoff would exceed max wait, giving up"
            );
            return Recovery::Propagate;
        }

        info!(context_key, delay_ms = delay.as_millis() as u64, %error, "rate limited by provider, backing off");
        tokio::time::sleep(delay).await;
        Recovery::Retry { delay }
    }

    /// Clear backoff state after a successful call.
    pub fn succeeded(&self, context_key: &str) {
        self.backoff.reset(context_key);
    }
}

/// Backoff context for a user's calls to one model.
pub fn context_key(user_id: &str, model_id: &str) -> String {
    format!("{user_id}:{model_id}")
}
