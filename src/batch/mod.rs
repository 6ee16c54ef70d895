//! Batch orchestration: dedup, group, dispatch, parse, reconcile, persist.
//!
//! [`BatchOrchestrator::execute`] never fails as a whole. Every input item ends
//! up in exactly one of `successful_results`, `failures` or `skipped`; a bad
//! batch is recorded and the run moves on to the next one.

pub mod enrichment;
pub mod parse;
pub mod prompt;

pub use enrichment::{
    Analysis, CalendarClassification, ContactInsight, Enrichment, SentimentAnalysis,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, debug, info, warn};

use crate::backoff::BackoffController;
use crate::concurrency::{ConcurrencyController, OperationMeta, Ticket};
use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::fallback::{Decision, FallbackOrchestrator, Recovery, context_key};
use crate::llm::{Completion, LlmProvider, Message};
use crate::model::{ContentHash, Priority, RateLimitStrategy, WorkItem};
use crate::store::{DedupStore, WorkSource};
use crate::telemetry::{batch as batch_span, genai, metrics};

// ---------------------------------------------------------------------------
// Request and result types
// ---------------------------------------------------------------------------

/// Items to enrich for one user.
#[derive(Debug, Clone)]
pub struct BatchRequest<T> {
    pub items: Vec<T>,
    /// Shared context included once per provider request.
    pub auxiliary_context: Option<String>,
    pub user_id: String,
    /// Route straight to the free-tier model, with no premium attempt.
    pub use_free_model: bool,
    pub priority: Priority,
}

impl<T> BatchRequest<T> {
    pub fn new(user_id: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            items,
            auxiliary_context: None,
            user_id: user_id.into(),
            use_free_model: false,
            priority: Priority::default(),
        }
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.auxiliary_context = Some(context.into());
        self
    }

    pub fn free_model(mut self, use_free_model: bool) -> Self {
        self.use_free_model = use_free_model;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub is_relevant: bool,
    pub confidence: f64,
    pub analysis: Value,
    pub model_used: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub reason: FailureReason,
}

/// Why an item did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The batch's response could not be parsed at all.
    ParseError,
    /// The response parsed but had no entry for this item.
    MissingAnalysis,
    /// The item's entry was present but failed validation.
    MalformedAnalysis(String),
    /// Rate limited with no usable fallback inside the wait bound.
    RateLimited { wait_ms: u64 },
    Provider(String),
    Timeout,
    Cancelled,
    Storage(String),
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ParseError => "parse_error",
            FailureReason::MissingAnalysis => "missing_analysis",
            FailureReason::MalformedAnalysis(_) => "malformed_analysis",
            FailureReason::RateLimited { .. } => "rate_limited",
            FailureReason::Provider(_) => "provider",
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::MalformedAnalysis(detail)
            | FailureReason::Provider(detail)
            | FailureReason::Storage(detail) => write!(f, "{}: {detail}", self.code()),
            FailureReason::RateLimited { wait_ms } => {
                write!(f, "{}: retry in {wait_ms}ms", self.code())
            }
            _ => f.write_str(self.code()),
        }
    }
}

impl From<&Error> for FailureReason {
    fn from(err: &Error) -> Self {
        match err {
            Error::RateLimited { wait_ms, .. } => FailureReason::RateLimited { wait_ms: *wait_ms },
            Error::Timeout(_) => FailureReason::Timeout,
            Error::Cancelled(_) => FailureReason::Cancelled,
            Error::MalformedResponse(_) => FailureReason::ParseError,
            Error::Storage(e) => FailureReason::Storage(e.to_string()),
            other => FailureReason::Provider(other.to_string()),
        }
    }
}

/// Complete accounting of one `execute` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub successful_results: Vec<ItemOutcome>,
    pub failures: Vec<ItemFailure>,
    /// Ids whose content hash matched the dedup ledger.
    pub skipped: Vec<String>,
    /// Provider requests issued, retries included.
    pub provider_calls: usize,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.successful_results.len() + self.failures.len() + self.skipped.len()
    }

    pub fn failure_for(&self, item_id: &str) -> Option<&FailureReason> {
        self.failures
            .iter()
            .find(|f| f.item_id == item_id)
            .map(|f| &f.reason)
    }

    fn fail_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>, reason: &FailureReason) {
        self.failures.extend(ids.into_iter().map(|id| ItemFailure {
            item_id: id.to_string(),
            reason: reason.clone(),
        }));
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// A provider call that went through.
struct Dispatched {
    completion: Completion,
    model_id: String,
}

/// Everything a dispatch needs, owned so it can run on the controller.
struct Dispatch {
    provider: Arc<dyn LlmProvider>,
    fallback: Arc<FallbackOrchestrator>,
    strategy: RateLimitStrategy,
    user_id: String,
    messages: Vec<Message>,
    item_count: usize,
    max_attempts: u32,
    timeout: Duration,
    calls: Arc<AtomicUsize>,
}

impl Dispatch {
    /// Call the provider, retrying per the strategy.
    ///
    /// Rate-limit errors back off and re-consult the fallback orchestrator.
    /// Transport errors and timeouts retry at once. Either way the loop
    /// stops after `max_attempts` calls or when cumulative waiting would
    /// pass the strategy's `max_wait`.
    async fn run(self) -> Result<Dispatched> {
        let provider_name = self.provider.name().to_string();
        let mut waited = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let remaining = self.strategy.clone().max_wait(
                self.strategy.max_wait.saturating_sub(waited),
            );
            let model_id = match self.fallback.decide(&self.user_id, &remaining).await {
                Decision::Proceed {
                    model_id,
                    waited: w,
                    ..
                } => {
                    waited += w;
                    model_id
                }
                Decision::Abort { model_id, wait } => {
                    return Err(Error::RateLimited {
                        model: model_id,
                        wait_ms: wait.as_millis() as u64,
                    });
                }
            };

            let key = context_key(&self.user_id, &model_id);
            let span =
                genai::start_chat_span(&model_id, &provider_name, attempt, self.item_count);
            self.calls.fetch_add(1, Ordering::Relaxed);
            let outcome = tokio::time::timeout(
                self.timeout,
                self.provider
                    .generate_completion(&model_id, &self.messages, true)
                    .instrument(span.clone()),
            )
            .await
            .unwrap_or(Err(Error::Timeout(self.timeout)));

            let err = match outcome {
                Ok(completion) => {
                    genai::record_token_usage(
                        &span,
                        completion.input_tokens,
                        completion.output_tokens,
                    );
                    self.fallback.limiter().record_tokens(
                        &self.user_id,
                        &model_id,
                        completion.total_tokens(),
                    );
                    self.fallback.succeeded(&key);
                    record_request(&model_id, &provider_name, "ok");
                    return Ok(Dispatched {
                        completion,
                        model_id,
                    });
                }
                Err(err) => err,
            };

            let rate_limited = BackoffController::classify(&err);
            let error_kind = match &err {
                _ if rate_limited => "rate_limited",
                Error::Timeout(_) => "timeout",
                _ => "error",
            };
            genai::record_error(&span, error_kind);
            record_request(&model_id, &provider_name, error_kind);

            if attempt >= self.max_attempts {
                warn!(model = %model_id, attempt, %err, "giving up on batch after max attempts");
                return Err(err);
            }

            if rate_limited {
                match self.fallback.recover(&key, &err, &self.strategy, waited).await {
                    Recovery::Retry { delay } => waited += delay,
                    Recovery::Propagate => return Err(err),
                }
            } else if matches!(err, Error::Provider { .. } | Error::Timeout(_)) {
                warn!(model = %model_id, attempt, %err, "provider call failed, retrying");
            } else {
                return Err(err);
            }
        }
    }
}

fn record_request(model: &str, provider: &str, result: &'static str) {
    metrics::provider_requests().add(
        1,
        &[
            KeyValue::new("model", model.to_string()),
            KeyValue::new("provider", provider.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

fn record_items(kind: &'static str, outcome: &'static str, count: usize) {
    if count > 0 {
        metrics::batch_items().add(
            count as u64,
            &[KeyValue::new("kind", kind), KeyValue::new("outcome", outcome)],
        );
    }
}

/// Drives enrichment batches through the shared engine components.
pub struct BatchOrchestrator {
    config: BatchConfig,
    fallback: Arc<FallbackOrchestrator>,
    concurrency: ConcurrencyController,
    store: Arc<dyn DedupStore>,
}

impl BatchOrchestrator {
    pub fn new(
        config: BatchConfig,
        fallback: Arc<FallbackOrchestrator>,
        concurrency: ConcurrencyController,
        store: Arc<dyn DedupStore>,
    ) -> Self {
        Self {
            config,
            fallback,
            concurrency,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn DedupStore> {
        &self.store
    }

    /// Strategy for a request: the free model alone, or premium with the
    /// free model as fallback.
    pub fn strategy_for(&self, use_free_model: bool) -> RateLimitStrategy {
        let routing = self.fallback.limiter().routing();
        let strategy = if use_free_model {
            RateLimitStrategy::new(routing.free_model.clone())
        } else {
            RateLimitStrategy::new(routing.premium_model.clone())
                .fallback(routing.free_model.clone())
        };
        strategy
            .max_wait(Duration::from_millis(self.config.max_wait_ms))
            .backoff(self.config.enable_backoff)
    }

    /// Enrich every item not already in the dedup ledger with unchanged content.
    pub async fn execute<E: Enrichment>(
        &self,
        provider: Arc<dyn LlmProvider>,
        enrichment: Arc<E>,
        request: BatchRequest<E::Item>,
    ) -> BatchResult {
        let kind = enrichment.kind();
        let mut result = BatchResult::default();
        let BatchRequest {
            items,
            auxiliary_context,
            user_id,
            use_free_model,
            priority,
        } = request;
        let submitted = items.len();

        let pending = self.filter_processed(items, &mut result).await;
        record_items(kind, "skipped", result.skipped.len());
        if pending.is_empty() {
            info!(kind, user_id = %user_id, submitted, skipped = result.skipped.len(), "nothing to enrich");
            return result;
        }

        let strategy = self.strategy_for(use_free_model);
        let calls = Arc::new(AtomicUsize::new(0));
        let batches: Vec<Vec<(E::Item, ContentHash)>> = pending
            .chunks(self.config.batch_size.max(1))
            .map(<[_]>::to_vec)
            .collect();
        info!(
            kind,
            user_id = %user_id,
            submitted,
            skipped = result.skipped.len(),
            batches = batches.len(),
            model = %strategy.primary_model,
            "executing enrichment batches"
        );

        // Submit everything up front; the controller bounds parallelism.
        let mut in_flight: Vec<(tracing::Span, Vec<(E::Item, ContentHash)>, Ticket<Dispatched>)> =
            Vec::with_capacity(batches.len());
        for (index, batch) in batches.into_iter().enumerate() {
            let items: Vec<E::Item> = batch.iter().map(|(item, _)| item.clone()).collect();
            let messages = prompt::build_messages(
                enrichment.system_prompt(),
                enrichment.response_fields(),
                &items,
                auxiliary_context.as_deref(),
            );
            let span = batch_span::start_batch_span(kind, &user_id, index, batch.len());
            let dispatch = Dispatch {
                provider: Arc::clone(&provider),
                fallback: Arc::clone(&self.fallback),
                strategy: strategy.clone(),
                user_id: user_id.clone(),
                messages,
                item_count: batch.len(),
                max_attempts: self.config.max_attempts.max(1),
                timeout: self.config.request_timeout(),
                calls: Arc::clone(&calls),
            };
            let ticket = self.concurrency.submit(
                OperationMeta::new(priority, user_id.clone(), strategy.primary_model.clone()),
                dispatch.run().instrument(span.clone()),
            );
            in_flight.push((span, batch, ticket));
        }

        for (span, batch, ticket) in in_flight {
            let outcome = ticket.wait().await;
            self.reconcile(enrichment.as_ref(), batch, outcome, &mut result)
                .instrument(span.clone())
                .await;
        }

        result.provider_calls = calls.load(Ordering::Relaxed);
        info!(
            kind,
            user_id = %user_id,
            succeeded = result.successful_results.len(),
            failed = result.failures.len(),
            skipped = result.skipped.len(),
            provider_calls = result.provider_calls,
            "enrichment finished"
        );
        result
    }

    /// Pull a user's candidates from `source` and execute them.
    ///
    /// # Errors
    /// Returns the source's error if the candidates cannot be loaded.
    pub async fn execute_from_source<E: Enrichment>(
        &self,
        provider: Arc<dyn LlmProvider>,
        enrichment: Arc<E>,
        source: &dyn WorkSource<E::Item>,
        user_id: &str,
        use_free_model: bool,
    ) -> Result<BatchResult> {
        let items = source.unprocessed_items(user_id).await?;
        let request = BatchRequest::new(user_id, items).free_model(use_free_model);
        Ok(self.execute(provider, enrichment, request).await)
    }

    /// Drop items whose stored hash matches their current content.
    async fn filter_processed<T: WorkItem>(
        &self,
        items: Vec<T>,
        result: &mut BatchResult,
    ) -> Vec<(T, ContentHash)> {
        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            let hash = item.content_hash();
            match self.store.find(item.item_id()).await {
                Ok(Some(record)) if record.content_hash == hash => {
                    debug!(item_id = item.item_id(), hash = %hash, "already processed, skipping");
                    result.skipped.push(item.item_id().to_string());
                }
                Ok(_) => pending.push((item, hash)),
                Err(e) => {
                    warn!(item_id = item.item_id(), error = %e, "dedup lookup failed");
                    result.failures.push(ItemFailure {
                        item_id: item.item_id().to_string(),
                        reason: FailureReason::Storage(e.to_string()),
                    });
                }
            }
        }
        pending
    }

    /// Fold one batch's outcome into the result.
    async fn reconcile<E: Enrichment>(
        &self,
        enrichment: &E,
        batch: Vec<(E::Item, ContentHash)>,
        outcome: Result<Dispatched>,
        result: &mut BatchResult,
    ) {
        let kind = enrichment.kind();
        let span = tracing::Span::current();
        let ids = || batch.iter().map(|(item, _)| item.item_id());

        let dispatched = match outcome {
            Ok(d) => d,
            Err(err) => {
                warn!(kind, error = %err, "batch dispatch failed");
                result.fail_all(ids(), &FailureReason::from(&err));
                record_items(kind, "failure", batch.len());
                batch_span::record_batch_outcome(&span, 0, batch.len());
                return;
            }
        };
        batch_span::record_batch_model(&span, &dispatched.model_id);

        let entries = match parse::parse_response(&dispatched.completion.text) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(kind, error = %e, response_bytes = dispatched.completion.text.len(), "could not parse batch response");
                result.fail_all(ids(), &FailureReason::ParseError);
                record_items(kind, "failure", batch.len());
                batch_span::record_batch_outcome(&span, 0, batch.len());
                return;
            }
        };
        let by_id: HashMap<String, &Value> = entries
            .iter()
            .filter_map(|entry| parse::entry_id(entry).map(|id| (id, entry)))
            .collect();

        let mut succeeded = 0;
        let mut failed = 0;
        for (item, hash) in &batch {
            let item_id = item.item_id();
            let analysis = match by_id.get(item_id) {
                None => Err(FailureReason::MissingAnalysis),
                Some(entry) => enrichment
                    .interpret(entry)
                    .map_err(FailureReason::MalformedAnalysis),
            };
            let outcome = match analysis {
                Ok(analysis) => self
                    .persist(item_id, hash, analysis, &dispatched.model_id)
                    .await
                    .map_err(|e| FailureReason::Storage(e.to_string())),
                Err(reason) => Err(reason),
            };
            match outcome {
                Ok(item_outcome) => {
                    succeeded += 1;
                    result.successful_results.push(item_outcome);
                }
                Err(reason) => {
                    failed += 1;
                    debug!(kind, item_id, %reason, "item failed");
                    result.failures.push(ItemFailure {
                        item_id: item_id.to_string(),
                        reason,
                    });
                }
            }
        }

        record_items(kind, "success", succeeded);
        record_items(kind, "failure", failed);
        batch_span::record_batch_outcome(&span, succeeded, failed);
    }

    async fn persist(
        &self,
        item_id: &str,
        hash: &ContentHash,
        analysis: Analysis,
        model_id: &str,
    ) -> Result<ItemOutcome> {
        let record = self
            .store
            .upsert(
                item_id,
                hash,
                analysis.is_relevant,
                analysis.payload.clone(),
                model_id,
            )
            .await?;
        Ok(ItemOutcome {
            item_id: record.item_id,
            is_relevant: analysis.is_relevant,
            confidence: analysis.confidence,
            analysis: analysis.payload,
            model_used: record.model_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_display_in_snake_case() {
        assert_eq!(FailureReason::ParseError.to_string(), "parse_error");
        assert_eq!(FailureReason::MissingAnalysis.to_string(), "missing_analysis");
        assert_eq!(
            FailureReason::MalformedAnalysis("missing `category`".to_string()).to_string(),
            "malformed_analysis: missing `category`"
        );
        assert_eq!(
            FailureReason::RateLimited { wait_ms: 1500 }.to_string(),
            "rate_limited: retry in 1500ms"
        );
    }

    #[test]
    fn errors_map_to_failure_reasons() {
        let limited = Error::RateLimited {
            model: "m".to_string(),
            wait_ms: 42,
        };
        assert_eq!(
            FailureReason::from(&limited),
            FailureReason::RateLimited { wait_ms: 42 }
        );
        assert_eq!(
            FailureReason::from(&Error::Timeout(Duration::from_secs(1))),
            FailureReason::Timeout
        );
        assert_eq!(FailureReason::from(&Error::provider("boom")).code(), "provider");
    }

    #[test]
    fn failure_reason_serializes_snake_case() {
        let json = serde_json::to_value(ItemFailure {
            item_id: "e2".to_string(),
            reason: FailureReason::MissingAnalysis,
        })
        .unwrap();
        assert_eq!(json["reason"], "missing_analysis");
    }
}
