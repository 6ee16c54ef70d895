//! Rate limiter: admission answers and model recommendations on top of
//! [`UsageTracker`].

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::{EngineConfig, RoutingConfig};
use crate::model::{ModelRecommendation, ModelTier};
use crate::telemetry::metrics;
use crate::usage::{
    Admission, ModelLimits, UsageSnapshot, UsageTracker, UsageWindow, exhausted_windows,
};

/// Answer to "can this user call this model now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub allowed: bool,
    /// When the blocking window(s) clear. Set only when `allowed` is false.
    pub reset_time: Option<DateTime<Utc>>,
    pub suggestion: Option<String>,
}

/// Current counters and caps for one (user, model).
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub user_id: String,
    pub model_id: String,
    pub tier: ModelTier,
    pub limits: ModelLimits,
    pub hourly: UsageWindow,
    pub daily: UsageWindow,
    pub allowed: bool,
}

pub struct RateLimiter {
    usage: Arc<UsageTracker>,
    tiers: HashMap<String, ModelTier>,
    routing: RoutingConfig,
}

impl RateLimiter {
    pub fn new(
        usage: Arc<UsageTracker>,
        tiers: HashMap<String, ModelTier>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            usage,
            tiers,
            routing,
        }
    }

    /// Build a limiter and its tracker from the engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        let limits = config
            .models
            .iter()
            .map(|(id, m)| (id.clone(), ModelLimits::from(m)))
            .collect();
        let tiers = config
            .models
            .iter()
            .map(|(id, m)| (id.clone(), m.tier))
            .collect();
        Self::new(
            Arc::new(UsageTracker::new(limits)),
            tiers,
            config.routing.clone(),
        )
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    /// Unknown models are treated as premium.
    pub fn tier_of(&self, model_id: &str) -> ModelTier {
        self.tiers
            .get(model_id)
            .copied()
            .unwrap_or(ModelTier::Premium)
    }

    pub fn is_lowest_tier(&self, model_id: &str) -> bool {
        self.tier_of(model_id) == ModelTier::Free
    }

    pub fn check_limit(&self, user_id: &str, model_id: &str) -> LimitCheck {
        self.check_limit_at(user_id, model_id, Utc::now())
    }

    pub(crate) fn check_limit_at(
        &self,
        user_id: &str,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> LimitCheck {
        let usage = self.usage.get_usage_at(user_id, model_id, now);
        if exhausted_windows(&usage, &self.usage.limits(model_id)).is_empty() {
            return allowed(model_id);
        }
        self.limited(user_id, model_id, &usage, now)
    }

    /// Like [`check_limit`](Self::check_limit), but an allowed answer also
    /// reserves one request against the model's caps. The caller owes a
    /// [`record_tokens`](Self::record_tokens) once the call completes.
    pub fn try_acquire(&self, user_id: &str, model_id: &str) -> LimitCheck {
        self.try_acquire_at(user_id, model_id, Utc::now())
    }

    pub(crate) fn try_acquire_at(
        &self,
        user_id: &str,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> LimitCheck {
        match self.usage.try_acquire_at(user_id, model_id, now) {
            Admission::Granted => allowed(model_id),
            Admission::Denied(usage) => self.limited(user_id, model_id, &usage, now),
        }
    }

    fn limited(
        &self,
        user_id: &str,
        model_id: &str,
        usage: &UsageSnapshot,
        now: DateTime<Utc>,
    ) -> LimitCheck {
        let limits = self.usage.limits(model_id);
        let over = exhausted_windows(usage, &limits);
        // Every exhausted window must clear before the call is allowed again.
        let reset_time = over.iter().map(|w| w.resets_at()).max();
        let suggestion = self.suggest(user_id, model_id, reset_time, now);

        debug!(
            user_id,
            model_id,
            hourly = usage.hourly.request_count,
            daily = usage.daily.request_count,
            reset_time = ?reset_time,
            "rate limit reached"
        );
        metrics::rate_limit_checks().add(
            1,
            &[
                KeyValue::new("model", model_id.to_string()),
                KeyValue::new("result", "limited"),
            ],
        );

        LimitCheck {
            allowed: false,
            reset_time,
            suggestion: Some(suggestion),
        }
    }

    fn suggest(
        &self,
        user_id: &str,
        model_id: &str,
        reset_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> String {
        let free = &self.routing.free_model;
        if free != model_id
            && !self.is_lowest_tier(model_id)
            && !self.usage.is_over_limit_at(user_id, free, now)
        {
            return format!("{model_id} is at its limit; {free} still has quota");
        }
        match reset_time {
            Some(t) => format!("{model_id} is at its limit; retry after {}", t.to_rfc3339()),
            None => format!("{model_id} is at its limit"),
        }
    }

    /// Pick a model for a workload. Pure: no counters are touched.
    ///
    /// Bulk or historical work goes to the free tier to conserve premium
    /// quota; small interactive work gets the premium model.
    pub fn get_recommended_model(
        &self,
        item_count: usize,
        is_historical_bulk_sync: bool,
    ) -> ModelRecommendation {
        let free = &self.routing.free_model;
        let premium = &self.routing.premium_model;

        if is_historical_bulk_sync {
            return ModelRecommendation {
                model_id: free.clone(),
                tier: self.tier_of(free),
                reasoning: format!(
                    "historical bulk sync of {item_count} items: using {free} to conserve premium quota"
                ),
            };
        }
        if item_count > self.routing.bulk_threshold {
            return ModelRecommendation {
                model_id: free.clone(),
                tier: self.tier_of(free),
                reasoning: format!(
                    "{item_count} items exceeds the bulk threshold of {}: using {free} to conserve premium quota",
                    self.routing.bulk_threshold
                ),
            };
        }
        ModelRecommendation {
            model_id: premium.clone(),
            tier: self.tier_of(premium),
            reasoning: format!(
                "{item_count} items is an interactive workload: using {premium} for quality"
            ),
        }
    }

    /// Count a completed provider call.
    pub fn record_usage(&self, user_id: &str, model_id: &str, tokens: u64) {
        self.usage.record_usage(user_id, model_id, tokens);
        metrics::llm_tokens().add(tokens, &[KeyValue::new("model", model_id.to_string())]);
    }

    /// Add the tokens of a call admitted by [`try_acquire`](Self::try_acquire).
    pub fn record_tokens(&self, user_id: &str, model_id: &str, tokens: u64) {
        self.usage.record_tokens(user_id, model_id, tokens);
        metrics::llm_tokens().add(tokens, &[KeyValue::new("model", model_id.to_string())]);
    }

    pub fn usage_stats(&self, user_id: &str, model_id: &str) -> UsageStats {
        let now = Utc::now();
        let usage = self.usage.get_usage_at(user_id, model_id, now);
        let limits = self.usage.limits(model_id);
        let allowed = exhausted_windows(&usage, &limits).is_empty();
        UsageStats {
            user_id: user_id.to_string(),
            model_id: model_id.to_string(),
            tier: self.tier_of(model_id),
            limits,
            hourly: usage.hourly,
            daily: usage.daily,
            allowed,
        }
    }
}

fn allowed(model_id: &str) -> LimitCheck {
    metrics::rate_limit_checks().add(
        1,
        &[
            KeyValue::new("model", model_id.to_string()),
            KeyValue::new("result", "allowed"),
        ],
    );
    LimitCheck {
        allowed: true,
        reset_time: None,
        suggestion: None,
    }
}
