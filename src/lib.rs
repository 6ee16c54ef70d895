//! # rapport-llm
//!
//! LLM orchestration for relationship-intelligence enrichment.
//!
//! Batches work items into provider requests, skips items whose content has
//! not changed since they were last processed, tracks per-user rate limits
//! across models, falls back or backs off when a model is limited, and bounds
//! concurrent provider calls behind a priority queue.

pub mod backoff;
pub mod batch;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod limiter;
pub mod llm;
pub mod model;
pub mod store;
pub mod telemetry;
pub mod usage;
