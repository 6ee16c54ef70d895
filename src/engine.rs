//! Engine assembly.
//!
//! One instance of every component, built from an [`EngineConfig`] and shared
//! by `Arc`. Tests build a fresh engine each; nothing is global.

use std::sync::Arc;

use tracing::info;

use crate::backoff::BackoffController;
use crate::batch::{BatchOrchestrator, BatchRequest, BatchResult, Enrichment};
use crate::concurrency::{ConcurrencyController, ConcurrencyStats};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::fallback::FallbackOrchestrator;
use crate::limiter::{LimitCheck, RateLimiter, UsageStats};
use crate::llm::LlmProvider;
use crate::model::ModelRecommendation;
use crate::store::DedupStore;

pub struct Engine {
    limiter: Arc<RateLimiter>,
    fallback: Arc<FallbackOrchestrator>,
    concurrency: ConcurrencyController,
    batch: BatchOrchestrator,
}

impl Engine {
    /// Validate `config` and wire the components together.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Config`] if the config is invalid.
    pub fn from_config(config: &EngineConfig, store: Arc<dyn DedupStore>) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::from_config(config));
        let backoff = Arc::new(BackoffController::new(config.backoff.clone()));
        let fallback = Arc::new(FallbackOrchestrator::new(Arc::clone(&limiter), backoff));
        let concurrency = ConcurrencyController::new(config.concurrency.max_concurrent);
        let batch = BatchOrchestrator::new(
            config.batch.clone(),
            Arc::clone(&fallback),
            concurrency.clone(),
            store,
        );

        info!(
            models = config.models.len(),
            premium = %config.routing.premium_model,
            free = %config.routing.free_model,
            max_concurrent = config.concurrency.max_concurrent,
            batch_size = config.batch.batch_size,
            "engine ready"
        );

        Ok(Self {
            limiter,
            fallback,
            concurrency,
            batch,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn fallback(&self) -> &Arc<FallbackOrchestrator> {
        &self.fallback
    }

    pub fn concurrency(&self) -> &ConcurrencyController {
        &self.concurrency
    }

    pub fn batch(&self) -> &BatchOrchestrator {
        &self.batch
    }

    pub fn check_limit(&self, user_id: &str, model_id: &str) -> LimitCheck {
        self.limiter.check_limit(user_id, model_id)
    }

    pub fn usage_stats(&self, user_id: &str, model_id: &str) -> UsageStats {
        self.limiter.usage_stats(user_id, model_id)
    }

    pub fn concurrency_stats(&self) -> ConcurrencyStats {
        self.concurrency.stats()
    }

    pub fn recommend(&self, item_count: usize, is_historical_bulk_sync: bool) -> ModelRecommendation {
        self.limiter
            .get_recommended_model(item_count, is_historical_bulk_sync)
    }

    pub async fn execute<E: Enrichment>(
        &self,
        provider: Arc<dyn LlmProvider>,
        enrichment: Arc<E>,
        request: BatchRequest<E::Item>,
    ) -> BatchResult {
        self.batch.execute(provider, enrichment, request).await
    }
}
