//! Per-user, per-model request and token accounting.
//!
//! Two wall-clock aligned windows per (user, model): the current UTC hour and
//! the current UTC day. Windows roll over lazily; any read or write after a
//! boundary sees a zeroed counter. State is in-memory only and does not
//! survive a restart.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::ModelConfig;

/// Caps for one model. `None` is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelLimits {
    pub requests_per_hour: Option<u32>,
    pub requests_per_day: Option<u32>,
    pub tokens_per_day: Option<u64>,
}

impl From<&ModelConfig> for ModelLimits {
    fn from(config: &ModelConfig) -> Self {
        Self {
            requests_per_hour: config.requests_per_hour,
            requests_per_day: config.requests_per_day,
            tokens_per_day: config.tokens_per_day,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Hourly,
    Daily,
}

impl WindowKind {
    fn span_secs(self) -> i64 {
        match self {
            WindowKind::Hourly => 3_600,
            WindowKind::Daily => 86_400,
        }
    }

    /// Start of the window containing `now`.
    pub fn start_of(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = now.timestamp();
        let start = secs - secs.rem_euclid(self.span_secs());
        DateTime::from_timestamp(start, 0).unwrap_or(now)
    }
}

/// Counter snapshot for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageWindow {
    pub user_id: String,
    pub model_id: String,
    pub kind: WindowKind,
    pub window_start: DateTime<Utc>,
    pub request_count: u32,
    pub token_count: u64,
}

impl UsageWindow {
    /// When this window's counters go back to zero.
    pub fn resets_at(&self) -> DateTime<Utc> {
        self.window_start + TimeDelta::seconds(self.kind.span_secs())
    }
}

/// Both windows for a (user, model) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub hourly: UsageWindow,
    pub daily: UsageWindow,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    start: DateTime<Utc>,
    requests: u32,
    tokens: u64,
}

impl Counter {
    fn new(kind: WindowKind, now: DateTime<Utc>) -> Self {
        Self {
            start: kind.start_of(now),
            requests: 0,
            tokens: 0,
        }
    }

    fn roll(&mut self, kind: WindowKind, now: DateTime<Utc>) {
        let start = kind.start_of(now);
        if start > self.start {
            *self = Counter {
                start,
                requests: 0,
                tokens: 0,
            };
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    hourly: Counter,
    daily: Counter,
}

impl Counters {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            hourly: Counter::new(WindowKind::Hourly, now),
            daily: Counter::new(WindowKind::Daily, now),
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        self.hourly.roll(WindowKind::Hourly, now);
        self.daily.roll(WindowKind::Daily, now);
    }
}

/// Outcome of [`UsageTracker::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// One request was reserved against both windows.
    Granted,
    /// A cap is exhausted; nothing was counted.
    Denied(UsageSnapshot),
}

/// Usage bookkeeping. No I/O; one lock guards every counter so increments
/// are linearizable per key.
pub struct UsageTracker {
    limits: HashMap<String, ModelLimits>,
    counters: Mutex<HashMap<(String, String), Counters>>,
}

impl UsageTracker {
    pub fn new(limits: HashMap<String, ModelLimits>) -> Self {
        Self {
            limits,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Caps configured for `model_id`; unknown models are unlimited.
    pub fn limits(&self, model_id: &str) -> ModelLimits {
        self.limits.get(model_id).copied().unwrap_or_default()
    }

    /// Count one request of `tokens` tokens against both windows.
    pub fn record_usage(&self, user_id: &str, model_id: &str, tokens: u64) {
        self.record_usage_at(user_id, model_id, tokens, Utc::now());
    }

    /// Reserve one request if every cap for `model_id` still has room.
    ///
    /// The check and the increment happen under the same lock, so concurrent
    /// callers can never push a window past its cap. Tokens are added once
    /// the call completes, via [`record_tokens`](Self::record_tokens).
    pub fn try_acquire(&self, user_id: &str, model_id: &str) -> Admission {
        self.try_acquire_at(user_id, model_id, Utc::now())
    }

    /// Add `tokens` to both windows without counting a request.
    pub fn record_tokens(&self, user_id: &str, model_id: &str, tokens: u64) {
        self.record_tokens_at(user_id, model_id, tokens, Utc::now());
    }

    pub fn get_usage(&self, user_id: &str, model_id: &str) -> UsageSnapshot {
        self.get_usage_at(user_id, model_id, Utc::now())
    }

    pub fn is_over_limit(&self, user_id: &str, model_id: &str) -> bool {
        self.is_over_limit_at(user_id, model_id, Utc::now())
    }

    pub(crate) fn record_usage_at(
        &self,
        user_id: &str,
        model_id: &str,
        tokens: u64,
        now: DateTime<Utc>,
    ) {
        let mut counters = self.lock();
        let entry = counters
            .entry((user_id.to_string(), model_id.to_string()))
            .or_insert_with(|| Counters::new(now));
        entry.roll(now);
        entry.hourly.requests = entry.hourly.requests.saturating_add(1);
        entry.hourly.tokens = entry.hourly.tokens.saturating_add(tokens);
        entry.daily.requests = entry.daily.requests.saturating_add(1);
        entry.daily.tokens = entry.daily.tokens.saturating_add(tokens);
    }

    pub(crate) fn try_acquire_at(
        &self,
        user_id: &str,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        let limits = self.limits(model_id);
        let mut counters = self.lock();
        let entry = counters
            .entry((user_id.to_string(), model_id.to_string()))
            .or_insert_with(|| Counters::new(now));
        entry.roll(now);

        let usage = snapshot(user_id, model_id, entry);
        if !exhausted_windows(&usage, &limits).is_empty() {
            return Admission::Denied(usage);
        }
        entry.hourly.requests = entry.hourly.requests.saturating_add(1);
        entry.daily.requests = entry.daily.requests.saturating_add(1);
        Admission::Granted
    }

    pub(crate) fn record_tokens_at(
        &self,
        user_id: &str,
        model_id: &str,
        tokens: u64,
        now: DateTime<Utc>,
    ) {
        let mut counters = self.lock();
        let entry = counters
            .entry((user_id.to_string(), model_id.to_string()))
            .or_insert_with(|| Counters::new(now));
        entry.roll(now);
        entry.hourly.tokens = entry.hourly.tokens.saturating_add(tokens);
        entry.daily.tokens = entry.daily.tokens.saturating_add(tokens);
    }

    pub(crate) fn get_usage_at(
        &self,
        user_id: &str,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> UsageSnapshot {
        let counters = {
            let mut map = self.lock();
            match map.get_mut(&(user_id.to_string(), model_id.to_string())) {
                Some(entry) => {
                    entry.roll(now);
                    *entry
                }
                None => Counters::new(now),
            }
        };
        snapshot(user_id, model_id, &counters)
    }

    pub(crate) fn is_over_limit_at(&self, user_id: &str, model_id: &str, now: DateTime<Utc>) -> bool {
        let usage = self.get_usage_at(user_id, model_id, now);
        !exhausted_windows(&usage, &self.limits(model_id)).is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Counters>> {
        // Counters stay consistent even if a holder panicked mid-update.
        self.counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn snapshot(user_id: &str, model_id: &str, counters: &Counters) -> UsageSnapshot {
    let window = |kind, counter: Counter| UsageWindow {
        user_id: user_id.to_string(),
        model_id: model_id.to_string(),
        kind,
        window_start: counter.start,
        request_count: counter.requests,
        token_count: counter.tokens,
    };
    UsageSnapshot {
        hourly: window(WindowKind::Hourly, counters.hourly),
        daily: window(WindowKind::Daily, counters.daily),
    }
}

/// Windows currently at or over their cap.
pub(crate) fn exhausted_windows<'a>(
    usage: &'a UsageSnapshot,
    limits: &ModelLimits,
) -> Vec<&'a UsageWindow> {
    let mut over = Vec::new();
    if limits
        .requests_per_hour
        .is_some_and(|cap| usage.hourly.request_count >= cap)
    {
        over.push(&usage.hourly);
    }
    let daily_requests = limits
        .requests_per_day
        .is_some_and(|cap| usage.daily.request_count >= cap);
    let daily_tokens = limits
        .tokens_per_day
        .is_some_and(|cap| usage.daily.token_count >= cap);
    if daily_requests || daily_tokens {
        over.push(&usage.daily);
    }
    over
}
