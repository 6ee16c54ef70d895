//! Engine tuning loaded from TOML.
//!
//! Every section has defaults, so an empty file (or no file) yields a working
//! engine. `validate()` is the single place misconfiguration is caught; the
//! engine refuses to start on a bad document.

use crate::error::{Error, Result};
use crate::model::ModelTier;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PREMIUM_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_FREE_MODEL: &str = "claude-3-5-haiku-latest";

/// Top-level engine document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub models: BTreeMap<String, ModelConfig>,
    pub routing: RoutingConfig,
    pub concurrency: ConcurrencyConfig,
    pub backoff: BackoffConfig,
    pub batch: BatchConfig,
}

/// Per-model caps. `None` means unlimited for that dimension.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub tier: ModelTier,
    pub requests_per_hour: Option<u32>,
    pub requests_per_day: Option<u32>,
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub premium_model: String,
    pub free_model: String,
    /// Workloads above this many items go to the free tier.
    pub bulk_threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub cap_exponent: u32,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Provider attempts per batch before it is recorded as failed.
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
    /// Longest a batch may wait on rate limits and backoff combined.
    pub max_wait_ms: u64,
    pub enable_backoff: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            DEFAULT_PREMIUM_MODEL.to_string(),
            ModelConfig {
                tier: ModelTier::Premium,
                requests_per_hour: Some(50),
                requests_per_day: Some(500),
                tokens_per_day: None,
            },
        );
        models.insert(
            DEFAULT_FREE_MODEL.to_string(),
            ModelConfig {
                tier: ModelTier::Free,
                requests_per_hour: Some(200),
                requests_per_day: Some(2000),
                tokens_per_day: None,
            },
        );
        Self {
            models,
            routing: RoutingConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            backoff: BackoffConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            premium_model: DEFAULT_PREMIUM_MODEL.to_string(),
            free_model: DEFAULT_FREE_MODEL.to_string(),
            bulk_threshold: 20,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_concurrent: 5 }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            cap_exponent: 5,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_attempts: 3,
            request_timeout_secs: 120,
            max_wait_ms: 60_000,
            enable_backoff: true,
        }
    }
}

impl BatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl EngineConfig {
    /// Read and validate an engine TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Parse and validate an engine TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (role, model) in [
            ("premium_model", &self.routing.premium_model),
            ("free_model", &self.routing.free_model),
        ] {
            if !self.models.contains_key(model) {
                return Err(Error::Config(format!(
                    "routing.{role} = {model:?} has no [models] entry"
                )));
            }
        }
        if self.concurrency.max_concurrent == 0 {
            return Err(Error::Config(
                "concurrency.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(Error::Config("batch.batch_size must be at least 1".to_string()));
        }
        if self.batch.max_attempts == 0 {
            return Err(Error::Config("batch.max_attempts must be at least 1".to_string()));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(Error::Config(format!(
                "backoff.base_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.batch.batch_size, 25);
        assert_eq!(config.backoff.max_delay_ms, 30_000);
        assert_eq!(config.concurrency.max_concurrent, 5);
    }

    #[test]
    fn parses_models_and_routing() {
        let config = EngineConfig::from_toml(
            r#"
            [models.big]
            tier = "premium"
            requests_per_hour = 10
            requests_per_day = 100

            [models.small]
            tier = "free"
            requests_per_hour = 60

            [routing]
            premium_model = "big"
            free_model = "small"
            bulk_threshold = 5

            [batch]
            batch_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.models["small"].tier, ModelTier::Free);
        assert_eq!(config.models["small"].requests_per_day, None);
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.max_attempts, 3);
    }

    #[test]
    fn rejects_routing_to_unknown_model() {
        let err = EngineConfig::from_toml(
            r#"
            [routing]
            premium_model = "missing"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = EngineConfig::from_toml("[batch]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn rejects_base_delay_above_ceiling() {
        let err = EngineConfig::from_toml("[backoff]\nbase_delay_ms = 5000\nmax_delay_ms = 100\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
