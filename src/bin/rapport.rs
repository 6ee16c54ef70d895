//! rapport CLI: run enrichment batches and inspect engine configuration.

use clap::{Parser, Subcommand, ValueEnum};
use rapport_llm::batch::{
    BatchRequest, BatchResult, CalendarClassification, ContactInsight, Enrichment,
    SentimentAnalysis,
};
use rapport_llm::config::{Config, EngineConfig};
use rapport_llm::db::Db;
use rapport_llm::engine::Engine;
use rapport_llm::llm::{AnthropicProvider, LlmProvider};
use rapport_llm::model::Priority;
use rapport_llm::store::{DedupStore, JsonFileSource, MemoryDedupStore, WorkSource};
use rapport_llm::telemetry::{TelemetryConfig, init_telemetry};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rapport", about = "Batch LLM enrichment with rate-limit aware routing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    /// Classify calendar events as client-relevant or not
    Calendar,
    /// Score the sentiment of interactions
    Sentiment,
    /// Summarise contacts and suggest a next action
    Insight,
}

#[derive(Subcommand)]
enum Command {
    /// Enrich a JSON file of work items
    Enrich {
        kind: Kind,
        /// JSON array of items
        #[arg(long)]
        input: PathBuf,
        /// User the work is done for (rate limits are per user)
        #[arg(long)]
        user: String,
        /// Use the free-tier model only
        #[arg(long)]
        free: bool,
        /// Shared context added to every request
        #[arg(long)]
        context: Option<String>,
        #[arg(long, default_value = "medium")]
        priority: Priority,
        /// Print only the summary, not the full JSON result
        #[arg(long)]
        quiet: bool,
    },
    /// Show which model a workload would be routed to
    Recommend {
        /// Number of items in the workload
        #[arg(long)]
        items: usize,
        /// Treat the workload as a historical bulk sync
        #[arg(long)]
        historical: bool,
        /// Engine config TOML (defaults to $RAPPORT_ENGINE_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate an engine config
    CheckConfig {
        /// Engine config TOML (defaults to $RAPPORT_ENGINE_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Enrich {
            kind,
            input,
            user,
            free,
            context,
            priority,
            quiet,
        } => {
            let config = Config::from_env()?;
            let guard = init_telemetry(TelemetryConfig {
                endpoint: config.otel_endpoint.clone(),
                service_name: "rapport".to_string(),
                log_level: config.log_level.clone(),
            })?;

            let options = RunOptions {
                input,
                user,
                free,
                context,
                priority,
            };
            let result = cmd_enrich(&config, kind, &options).await;
            guard.force_flush();
            let result = result?;

            print_summary(&result);
            if !quiet {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Ok(())
        }
        Command::Recommend {
            items,
            historical,
            config,
        } => {
            let _guard = init_local_telemetry()?;
            let engine_config = load_engine_config(config.as_deref())?;
            let engine = Engine::from_config(&engine_config, Arc::new(MemoryDedupStore::new()))?;
            let rec = engine.recommend(items, historical);
            println!("Model:     {}", rec.model_id);
            println!("Tier:      {}", rec.tier);
            println!("Reasoning: {}", rec.reasoning);
            Ok(())
        }
        Command::CheckConfig { config } => {
            let _guard = init_local_telemetry()?;
            let engine_config = load_engine_config(config.as_deref())?;
            engine_config.validate()?;
            cmd_check_config(&engine_config);
            Ok(())
        }
    }
}

struct RunOptions {
    input: PathBuf,
    user: String,
    free: bool,
    context: Option<String>,
    priority: Priority,
}

async fn cmd_enrich(
    config: &Config,
    kind: Kind,
    options: &RunOptions,
) -> anyhow::Result<BatchResult> {
    let engine_config = config.engine()?;

    let store: Arc<dyn DedupStore> = match &config.database_url {
        Some(url) => {
            let db = Db::connect(url).await?;
            db.migrate().await?;
            Arc::new(db)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, dedup ledger is in-memory for this run");
            Arc::new(MemoryDedupStore::new())
        }
    };
    let engine = Engine::from_config(&engine_config, store)?;
    let provider: Arc<dyn LlmProvider> =
        Arc::new(AnthropicProvider::new(&config.anthropic_api_key)?);

    let result = match kind {
        Kind::Calendar => run(&engine, provider, CalendarClassification, options).await?,
        Kind::Sentiment => run(&engine, provider, SentimentAnalysis, options).await?,
        Kind::Insight => run(&engine, provider, ContactInsight, options).await?,
    };
    Ok(result)
}

async fn run<E>(
    engine: &Engine,
    provider: Arc<dyn LlmProvider>,
    enrichment: E,
    options: &RunOptions,
) -> anyhow::Result<BatchResult>
where
    E: Enrichment,
    E::Item: DeserializeOwned,
{
    let source: JsonFileSource<E::Item> = JsonFileSource::new(&options.input);
    let items = source.unprocessed_items(&options.user).await?;

    let mut request = BatchRequest::new(options.user.clone(), items)
        .free_model(options.free)
        .priority(options.priority);
    if let Some(context) = &options.context {
        request = request.context(context.clone());
    }
    Ok(engine.execute(provider, Arc::new(enrichment), request).await)
}

fn print_summary(result: &BatchResult) {
    println!(
        "Succeeded: {}  Failed: {}  Skipped: {}  Provider calls: {}",
        result.successful_results.len(),
        result.failures.len(),
        result.skipped.len(),
        result.provider_calls
    );
    for failure in &result.failures {
        println!("  {:<24} {}", failure.item_id, failure.reason);
    }
}

fn cmd_check_config(config: &EngineConfig) {
    println!(
        "Routing:   premium={} free={} bulk_threshold={}",
        config.routing.premium_model, config.routing.free_model, config.routing.bulk_threshold
    );
    println!(
        "Batching:  size={} attempts={} timeout={}s max_wait={}ms backoff={}",
        config.batch.batch_size,
        config.batch.max_attempts,
        config.batch.request_timeout_secs,
        config.batch.max_wait_ms,
        config.batch.enable_backoff
    );
    println!("Workers:   max_concurrent={}", config.concurrency.max_concurrent);
    println!(
        "{:<32}  {:<8}  {:>8}  {:>8}  {:>12}",
        "MODEL", "TIER", "REQ/H", "REQ/D", "TOKENS/D"
    );
    println!("{}", "-".repeat(76));
    for (id, model) in &config.models {
        println!(
            "{:<32}  {:<8}  {:>8}  {:>8}  {:>12}",
            id,
            model.tier.to_string(),
            limit(model.requests_per_hour),
            limit(model.requests_per_day),
            limit(model.tokens_per_day),
        );
    }
    println!("\nconfig ok");
}

fn limit<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn load_engine_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let from_env = std::env::var_os("RAPPORT_ENGINE_CONFIG").map(PathBuf::from);
    match path.map(Path::to_path_buf).or(from_env) {
        Some(path) => Ok(EngineConfig::load(&path)?),
        None => Ok(EngineConfig::default()),
    }
}

fn init_local_telemetry() -> anyhow::Result<rapport_llm::telemetry::TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "rapport".to_string(),
        log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string()),
    })?)
}
