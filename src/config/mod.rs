//! Typed configuration.
//!
//! Process settings and credentials come from environment variables, loaded
//! once at startup; missing required vars fail fast. Sensitive values are
//! wrapped in secrecy::SecretString to prevent log leaks. Engine tuning
//! (models, limits, batch sizes) lives in a TOML file, see [`engine`].

pub mod engine;
pub mod secrets;

pub use engine::{
    BackoffConfig, BatchConfig, ConcurrencyConfig, EngineConfig, ModelConfig, RoutingConfig,
};

use crate::error::{Error, Result};
use secrets::{SecretString, secret};
use std::path::PathBuf;

#[derive(Debug)]
pub struct Config {
    pub anthropic_api_key: SecretString,
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub engine_config_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            anthropic_api_key: secret(required_var("ANTHROPIC_API_KEY")?),
            database_url: optional_var("DATABASE_URL").map(secret),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            engine_config_path: optional_var("RAPPORT_ENGINE_CONFIG").map(PathBuf::from),
        })
    }

    /// Engine config from `RAPPORT_ENGINE_CONFIG`, or the built-in defaults.
    pub fn engine(&self) -> Result<EngineConfig> {
        match &self.engine_config_path {
            Some(path) => EngineConfig::load(path),
            None => Ok(EngineConfig::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    match optional_var(name) {
        Some(value) => Ok(value),
        None => Err(Error::Config(format!(
            "required environment variable {name} is not set"
        ))),
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
