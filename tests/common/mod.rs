//! Shared fixtures: a scripted provider, work items and a small engine config.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::{Value, json};

use rapport_llm::config::{EngineConfig, ModelConfig, RoutingConfig};
use rapport_llm::error::{Error, Result};
use rapport_llm::llm::{Completion, LlmProvider, Message};
use rapport_llm::model::{CalendarEvent, ModelTier};

pub const PREMIUM: &str = "premium-model";
pub const FREE: &str = "free-model";

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct Call {
    pub model_id: String,
    pub item_ids: Vec<String>,
}

type Responder = dyn Fn(usize, &Call) -> Result<String> + Send + Sync;

/// Provider whose replies are computed from the call index and the item ids
/// found in the prompt.
pub struct ScriptedProvider {
    responder: Box<Responder>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedProvider {
    pub fn new(responder: impl Fn(usize, &Call) -> Result<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answers every item with a valid calendar classification.
    pub fn classifying() -> Arc<Self> {
        Self::new(|_, call| Ok(classification_reply(&call.item_ids)))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_completion(
        &self,
        model_id: &str,
        messages: &[Message],
        _wants_json: bool,
    ) -> Result<Completion> {
        let call = Call {
            model_id: model_id.to_string(),
            item_ids: prompt_item_ids(messages),
        };
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call.clone());
            calls.len() - 1
        };
        let text = (self.responder)(index, &call)?;
        Ok(Completion::estimated(messages, text))
    }
}

/// Item ids embedded in the user message's `{"items": [...]}` payload.
pub fn prompt_item_ids(messages: &[Message]) -> Vec<String> {
    let Some(user) = messages.last() else {
        return Vec::new();
    };
    let Some(start) = user.content.find("{\"items\"") else {
        return Vec::new();
    };
    let payload: Value = serde_json::from_str(&user.content[start..]).unwrap();
    payload["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_str().unwrap().to_string())
        .collect()
}

pub fn classification_reply(ids: &[String]) -> String {
    let results: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "is_relevant": true,
                "category": "client_meeting",
                "confidence": 0.9,
            })
        })
        .collect();
    // Wrapped the way models usually answer.
    format!("```json\n{}\n```", json!({ "results": results }))
}

pub fn rate_limit_error() -> Error {
    Error::Provider {
        status: Some(429),
        message: "rate_limit_error: too many requests".to_string(),
    }
}

pub fn event(n: usize) -> CalendarEvent {
    let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::hours(n as i64);
    CalendarEvent {
        id: format!("evt-{n}"),
        summary: format!("Meeting {n}"),
        description: None,
        start,
        end: start + Duration::minutes(30),
        attendees: vec![format!("client{n}@example.com"), "me@example.com".to_string()],
        location: None,
    }
}

pub fn events(count: usize) -> Vec<CalendarEvent> {
    (0..count).map(event).collect()
}

/// Two models with generous limits and fast backoff.
pub fn engine_config() -> EngineConfig {
    let mut models = BTreeMap::new();
    models.insert(
        PREMIUM.to_string(),
        ModelConfig {
            tier: ModelTier::Premium,
            requests_per_hour: Some(100),
            requests_per_day: Some(1_000),
            tokens_per_day: None,
        },
    );
    models.insert(
        FREE.to_string(),
        ModelConfig {
            tier: ModelTier::Free,
            requests_per_hour: Some(100),
            requests_per_day: Some(1_000),
            tokens_per_day: None,
        },
    );
    let mut config = EngineConfig {
        models,
        routing: RoutingConfig {
            premium_model: PREMIUM.to_string(),
            free_model: FREE.to_string(),
            bulk_threshold: 20,
        },
        ..EngineConfig::default()
    };
    config.backoff.base_delay_ms = 100;
    config.backoff.max_delay_ms = 1_000;
    config
}

pub fn set_hourly_limit(config: &mut EngineConfig, model: &str, limit: u32) {
    if let Some(m) = config.models.get_mut(model) {
        m.requests_per_hour = Some(limit);
    }
}
