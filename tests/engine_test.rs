//! Engine wiring: validation, recommendations and the exposed stats.

mod common;

use std::sync::Arc;

use common::*;
use rapport_llm::batch::{BatchRequest, CalendarClassification};
use rapport_llm::engine::Engine;
use rapport_llm::error::Error;
use rapport_llm::model::ModelTier;
use rapport_llm::store::MemoryDedupStore;

fn engine() -> Engine {
    Engine::from_config(&engine_config(), Arc::new(MemoryDedupStore::new())).unwrap()
}

#[test]
fn invalid_config_is_refused() {
    let mut config = engine_config();
    config.routing.free_model = "not-configured".to_string();
    let result = Engine::from_config(&config, Arc::new(MemoryDedupStore::new()));
    assert!(matches!(result, Err(Error::Config(_))));

    let mut config = engine_config();
    config.backoff.base_delay_ms = config.backoff.max_delay_ms + 1;
    assert!(Engine::from_config(&config, Arc::new(MemoryDedupStore::new())).is_err());
}

#[test]
fn recommendation_follows_workload_shape() {
    let engine = engine();

    let small = engine.recommend(5, false);
    assert_eq!(small.model_id, PREMIUM);
    assert_eq!(small.tier, ModelTier::Premium);
    assert!(!small.reasoning.is_empty());

    let bulk = engine.recommend(21, false);
    assert_eq!(bulk.model_id, FREE);
    assert!(bulk.reasoning.contains("21"));

    let historical = engine.recommend(1, true);
    assert_eq!(historical.model_id, FREE);
    assert_eq!(historical.tier, ModelTier::Free);
}

#[test]
fn usage_stats_reflect_recorded_calls() {
    let mut config = engine_config();
    set_hourly_limit(&mut config, PREMIUM, 2);
    let engine = Engine::from_config(&config, Arc::new(MemoryDedupStore::new())).unwrap();

    engine.limiter().record_usage("u1", PREMIUM, 400);
    let stats = engine.usage_stats("u1", PREMIUM);
    assert_eq!(stats.hourly.request_count, 1);
    assert_eq!(stats.daily.token_count, 400);
    assert_eq!(stats.limits.requests_per_hour, Some(2));
    assert!(stats.allowed);

    engine.limiter().record_usage("u1", PREMIUM, 400);
    assert!(!engine.usage_stats("u1", PREMIUM).allowed);
    let check = engine.check_limit("u1", PREMIUM);
    assert!(!check.allowed);
    assert!(check.reset_time.unwrap() > chrono::Utc::now());
}

#[tokio::test]
async fn concurrency_stats_count_batches() {
    let mut config = engine_config();
    config.batch.batch_size = 10;
    let engine = Engine::from_config(&config, Arc::new(MemoryDedupStore::new())).unwrap();

    let result = engine
        .execute(
            ScriptedProvider::classifying(),
            Arc::new(CalendarClassification),
            BatchRequest::new("u1", events(30)),
        )
        .await;
    assert_eq!(result.provider_calls, 3);

    let stats = engine.concurrency_stats();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queued, 0);
}
