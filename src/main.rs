use std::{process, sync::Arc};

use serde_json::json;
use thiserror::Error;
use tickvault::{
    cache::{
        CacheConfig, CacheConfigError, CacheError, CacheOrchestrator, CacheStrategy, Clock,
        CodecError, JsonChangeDetector, MarketStateBoard, OrchestratorRequest, OrchestratorResult,
        StorePriority, SystemClock,
    },
    config::{self, Command, LoadError, ProbeArgs, Settings},
    infra::{error::InfraError, telemetry, warm::build_warm_tier},
    util::units::{format_bytes, format_ratio, format_seconds},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("cache configuration rejected: {0}")]
    CacheConfig(#[from] CacheConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("probe value could not be encoded: {0}")]
    Codec(#[from] CodecError),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command.unwrap_or(Command::Check) {
        Command::Check => run_check(&settings),
        Command::Probe(args) => run_probe(settings, args).await,
    }
}

fn run_check(settings: &Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(settings);
    cache_config.validate()?;

    println!(
        "hot tier     capacity={} max_ttl={} auto<= {} / {} elements",
        settings.hot_tier.capacity,
        format_seconds(settings.hot_tier.max_ttl.as_secs()),
        format_bytes(settings.hot_tier.auto_max_bytes),
        settings.hot_tier.auto_max_elements,
    );
    println!(
        "warm tier    backend={} prefix={} io_timeout={}ms",
        settings.warm_tier.backend.name(),
        settings.warm_tier.key_prefix,
        settings.warm_tier.io_timeout.as_millis(),
    );
    println!(
        "compression  threshold={} max_ratio={}",
        format_bytes(settings.compression.threshold_bytes),
        format_ratio(settings.compression.max_ratio),
    );
    println!(
        "scheduler    concurrency={} attempts={} fetch_timeout={}ms drain={}",
        settings.scheduler.max_concurrent_updates,
        settings.scheduler.max_retries,
        settings.scheduler.fetch_timeout.as_millis(),
        format_seconds(settings.scheduler.drain_timeout.as_secs()),
    );
    println!();
    println!(
        "{:<18} {:>8} {:>8} {:>8} {:>9} {:>8} {:>8} {:>8}",
        "strategy", "ttl", "min", "max", "threshold", "force", "open", "closed"
    );

    for strategy in CacheStrategy::ALL {
        let Some(entry) = cache_config.strategies.config(strategy) else {
            println!("{:<18} not cached", strategy.as_str());
            continue;
        };
        let optional = |value: Option<u64>| value.map(format_seconds).unwrap_or_else(|| "-".into());
        println!(
            "{:<18} {:>8} {:>8} {:>8} {:>9} {:>8} {:>8} {:>8}",
            strategy.as_str(),
            format_seconds(entry.ttl_seconds),
            format_seconds(entry.min_ttl_seconds),
            format_seconds(entry.max_ttl_seconds),
            format_ratio(entry.update_threshold_ratio),
            optional(entry.force_refresh_interval_seconds),
            optional(entry.open_market_ttl_seconds),
            optional(entry.closed_market_ttl_seconds),
        );
    }

    info!("Configuration is valid");
    Ok(())
}

async fn run_probe(settings: Settings, args: ProbeArgs) -> Result<(), AppError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let warm = build_warm_tier(&settings.warm_tier, Arc::clone(&clock)).await?;
    let cache = CacheOrchestrator::new(
        &CacheConfig::from(&settings),
        warm,
        clock,
        Arc::new(MarketStateBoard::new()),
        Arc::new(JsonChangeDetector::new()),
    )?;

    let probe_key = cache.storage_key(CacheStrategy::WeakTimeliness, &args.key);
    let write = cache
        .store()
        .set(
            &probe_key,
            &json!({"probe": args.key}),
            args.ttl_seconds,
            StorePriority::Auto,
        )
        .await?;
    info!(
        key = %probe_key,
        hot = write.hot,
        warm = write.warm,
        compressed = write.compressed,
        "Probe value written"
    );
    if !write.warm {
        warn!(backend = cache.store().warm_backend(), "Warm tier did not accept the probe");
    }

    let value = json!({"probe": args.key});
    let request =
        OrchestratorRequest::new(args.key.clone(), CacheStrategy::WeakTimeliness, move || {
            let value = value.clone();
            async move { Ok(value) }
        });
    let served: OrchestratorResult<serde_json::Value> = cache.fetch(request).await?;
    info!(
        hit = served.hit,
        tier = served.tier.map(|tier| tier.as_str()),
        ttl_remaining = served.ttl_remaining,
        "Probe read back"
    );

    let hot_removed = cache
        .invalidate(CacheStrategy::WeakTimeliness, &args.key)
        .await;
    let warm_left = cache.store().warm_contains(&probe_key).await;
    info!(hot_removed, warm_left, "Probe invalidated");

    let report = cache.shutdown(settings.scheduler.drain_timeout).await;
    info!(
        drained = report.drained,
        abandoned = report.abandoned,
        "Probe finished"
    );
    Ok(())
}
