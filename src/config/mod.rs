//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    num::NonZeroUsize,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    CacheStrategy, CompressionPolicy, MAX_TTL_SECONDS, StrategyConfig, StrategyTable,
};

pub use cli::{CliArgs, Command, ProbeArgs, RuntimeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tickvault";
const ENV_PREFIX: &str = "TICKVAULT";
const DEFAULT_HOT_CAPACITY: u64 = 1000;
const DEFAULT_HOT_MAX_TTL_SECS: u64 = 300;
const DEFAULT_AUTO_MAX_BYTES: u64 = 8 * 1024;
const DEFAULT_AUTO_MAX_ELEMENTS: u64 = 64;
const DEFAULT_WARM_KEY_PREFIX: &str = "tickvault:";
const DEFAULT_WARM_IO_TIMEOUT_MS: u64 = 250;
const DEFAULT_COMPRESSION_THRESHOLD_BYTES: u64 = 1024;
const DEFAULT_COMPRESSION_MAX_RATIO: f64 = 0.8;
const DEFAULT_MAX_CONCURRENT_UPDATES: u64 = 4;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HISTORY_CAPACITY: u64 = 4096;
const DEFAULT_HISTORY_WINDOW: u64 = 20;
const DEFAULT_NAMESPACE: &str = "md";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub hot_tier: HotTierSettings,
    pub warm_tier: WarmTierSettings,
    pub compression: CompressionPolicy,
    pub scheduler: SchedulerSettings,
    pub orchestrator: OrchestratorSettings,
    pub strategies: StrategyTable,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct HotTierSettings {
    pub capacity: NonZeroUsize,
    pub max_ttl: Duration,
    pub auto_max_bytes: usize,
    pub auto_max_elements: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmBackend {
    Memory,
    Redis { url: String },
    Disabled,
}

impl WarmBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis { .. } => "redis",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarmTierSettings {
    pub backend: WarmBackend,
    pub key_prefix: String,
    pub io_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_updates: NonZeroUsize,
    pub max_retries: u32,
    pub fetch_timeout: Duration,
    pub drain_timeout: Duration,
    pub history_capacity: NonZeroUsize,
    pub history_window: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub namespace: String,
    pub single_flight: bool,
    pub skip_unchanged_writes: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    hot_tier: RawHotTierSettings,
    warm_tier: RawWarmTierSettings,
    compression: RawCompressionSettings,
    scheduler: RawSchedulerSettings,
    orchestrator: RawOrchestratorSettings,
    strategies: RawStrategies,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &RuntimeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(backend) = overrides.warm_backend.as_ref() {
            self.warm_tier.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.warm_url.as_ref() {
            self.warm_tier.url = Some(url.clone());
        }
        if let Some(capacity) = overrides.hot_capacity {
            self.hot_tier.capacity = Some(capacity);
        }
        if let Some(max) = overrides.max_concurrent_updates {
            self.scheduler.max_concurrent_updates = Some(max);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            hot_tier,
            warm_tier,
            compression,
            scheduler,
            orchestrator,
            strategies,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let hot_tier = build_hot_tier_settings(hot_tier)?;
        let warm_tier = build_warm_tier_settings(warm_tier)?;
        let compression = build_compression_policy(compression)?;
        let scheduler = build_scheduler_settings(scheduler)?;
        let orchestrator = build_orchestrator_settings(orchestrator)?;
        let strategies = build_strategy_table(strategies)?;

        Ok(Self {
            logging,
            hot_tier,
            warm_tier,
            compression,
            scheduler,
            orchestrator,
            strategies,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_hot_tier_settings(hot: RawHotTierSettings) -> Result<HotTierSettings, LoadError> {
    let capacity = non_zero_usize(
        hot.capacity.unwrap_or(DEFAULT_HOT_CAPACITY),
        "hot_tier.capacity",
    )?;

    let max_ttl_seconds = hot.max_ttl_seconds.unwrap_or(DEFAULT_HOT_MAX_TTL_SECS);
    if max_ttl_seconds == 0 || max_ttl_seconds > MAX_TTL_SECONDS {
        return Err(LoadError::invalid(
            "hot_tier.max_ttl_seconds",
            format!("must be within [1, {MAX_TTL_SECONDS}]"),
        ));
    }

    let auto_max_bytes = to_usize(
        hot.auto_max_bytes.unwrap_or(DEFAULT_AUTO_MAX_BYTES),
        "hot_tier.auto_max_bytes",
    )?;
    let auto_max_elements = to_usize(
        hot.auto_max_elements.unwrap_or(DEFAULT_AUTO_MAX_ELEMENTS),
        "hot_tier.auto_max_elements",
    )?;

    Ok(HotTierSettings {
        capacity,
        max_ttl: Duration::from_secs(max_ttl_seconds),
        auto_max_bytes,
        auto_max_elements,
    })
}

fn build_warm_tier_settings(warm: RawWarmTierSettings) -> Result<WarmTierSettings, LoadError> {
    let url = warm.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let backend = match warm
        .backend
        .as_deref()
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        None | Some("memory") => WarmBackend::Memory,
        Some("disabled") => WarmBackend::Disabled,
        Some("redis") => {
            let url = url.ok_or_else(|| {
                LoadError::invalid("warm_tier.url", "required when backend is `redis`")
            })?;
            WarmBackend::Redis { url }
        }
        Some(other) => {
            return Err(LoadError::invalid(
                "warm_tier.backend",
                format!("unknown backend `{other}`; expected memory, redis or disabled"),
            ));
        }
    };

    let key_prefix = warm
        .key_prefix
        .unwrap_or_else(|| DEFAULT_WARM_KEY_PREFIX.to_string());

    let io_timeout_ms = warm.io_timeout_ms.unwrap_or(DEFAULT_WARM_IO_TIMEOUT_MS);
    if io_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "warm_tier.io_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(WarmTierSettings {
        backend,
        key_prefix,
        io_timeout: Duration::from_millis(io_timeout_ms),
    })
}

fn build_compression_policy(
    compression: RawCompressionSettings,
) -> Result<CompressionPolicy, LoadError> {
    let threshold_bytes = to_usize(
        compression
            .threshold_bytes
            .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD_BYTES),
        "compression.threshold_bytes",
    )?;

    let max_ratio = compression
        .max_ratio
        .unwrap_or(DEFAULT_COMPRESSION_MAX_RATIO);
    if !(max_ratio > 0.0 && max_ratio <= 1.0) {
        return Err(LoadError::invalid(
            "compression.max_ratio",
            format!("must be in (0, 1], got {max_ratio}"),
        ));
    }

    Ok(CompressionPolicy {
        threshold_bytes,
        max_ratio,
    })
}

fn build_scheduler_settings(
    scheduler: RawSchedulerSettings,
) -> Result<SchedulerSettings, LoadError> {
    let max_concurrent_updates = non_zero_usize(
        scheduler
            .max_concurrent_updates
            .unwrap_or(DEFAULT_MAX_CONCURRENT_UPDATES),
        "scheduler.max_concurrent_updates",
    )?;

    let max_retries = scheduler.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
    if max_retries == 0 {
        return Err(LoadError::invalid(
            "scheduler.max_retries",
            "must allow at least one attempt",
        ));
    }

    let fetch_timeout_ms = scheduler
        .fetch_timeout_ms
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_MS);
    if fetch_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "scheduler.fetch_timeout_ms",
            "must be greater than zero",
        ));
    }

    let drain_timeout_seconds = scheduler
        .drain_timeout_seconds
        .unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS);
    if drain_timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "scheduler.drain_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(SchedulerSettings {
        max_concurrent_updates,
        max_retries,
        fetch_timeout: Duration::from_millis(fetch_timeout_ms),
        drain_timeout: Duration::from_secs(drain_timeout_seconds),
        history_capacity: non_zero_usize(
            scheduler
                .history_capacity
                .unwrap_or(DEFAULT_HISTORY_CAPACITY),
            "scheduler.history_capacity",
        )?,
        history_window: non_zero_usize(
            scheduler.history_window.unwrap_or(DEFAULT_HISTORY_WINDOW),
            "scheduler.history_window",
        )?,
    })
}

fn build_orchestrator_settings(
    orchestrator: RawOrchestratorSettings,
) -> Result<OrchestratorSettings, LoadError> {
    let namespace = orchestrator
        .namespace
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    if namespace.is_empty() {
        return Err(LoadError::invalid(
            "orchestrator.namespace",
            "must not be empty",
        ));
    }

    Ok(OrchestratorSettings {
        namespace,
        single_flight: orchestrator.single_flight.unwrap_or(true),
        skip_unchanged_writes: orchestrator.skip_unchanged_writes.unwrap_or(false),
    })
}

/// Layer configured overrides onto the built-in strategy table and validate it.
fn build_strategy_table(raw: RawStrategies) -> Result<StrategyTable, LoadError> {
    let mut table = StrategyTable::default();
    let RawStrategies {
        strong_timeliness,
        weak_timeliness,
        market_aware,
        adaptive,
    } = raw;

    for (strategy, overrides) in [
        (CacheStrategy::StrongTimeliness, strong_timeliness),
        (CacheStrategy::WeakTimeliness, weak_timeliness),
        (CacheStrategy::MarketAware, market_aware),
        (CacheStrategy::Adaptive, adaptive),
    ] {
        if let Some(config) = table.config_mut(strategy) {
            overrides.apply(config);
        }
    }

    table
        .validate()
        .map_err(|err| LoadError::invalid("strategies", err.to_string()))?;
    Ok(table)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHotTierSettings {
    capacity: Option<u64>,
    max_ttl_seconds: Option<u64>,
    auto_max_bytes: Option<u64>,
    auto_max_elements: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmTierSettings {
    backend: Option<String>,
    url: Option<String>,
    key_prefix: Option<String>,
    io_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCompressionSettings {
    threshold_bytes: Option<u64>,
    max_ratio: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSchedulerSettings {
    max_concurrent_updates: Option<u64>,
    max_retries: Option<u32>,
    fetch_timeout_ms: Option<u64>,
    drain_timeout_seconds: Option<u64>,
    history_capacity: Option<u64>,
    history_window: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOrchestratorSettings {
    namespace: Option<String>,
    single_flight: Option<bool>,
    skip_unchanged_writes: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStrategies {
    strong_timeliness: RawStrategy,
    weak_timeliness: RawStrategy,
    market_aware: RawStrategy,
    adaptive: RawStrategy,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStrategy {
    ttl_seconds: Option<u64>,
    min_ttl_seconds: Option<u64>,
    max_ttl_seconds: Option<u64>,
    update_threshold_ratio: Option<f64>,
    force_refresh_interval_seconds: Option<u64>,
    min_update_interval_seconds: Option<u64>,
    open_market_ttl_seconds: Option<u64>,
    closed_market_ttl_seconds: Option<u64>,
}

impl RawStrategy {
    fn apply(self, config: &mut StrategyConfig) {
        if let Some(value) = self.ttl_seconds {
            config.ttl_seconds = value;
        }
        if let Some(value) = self.min_ttl_seconds {
            config.min_ttl_seconds = value;
        }
        if let Some(value) = self.max_ttl_seconds {
            config.max_ttl_seconds = value;
        }
        if let Some(value) = self.update_threshold_ratio {
            config.update_threshold_ratio = value;
        }
        if let Some(value) = self.force_refresh_interval_seconds {
            config.force_refresh_interval_seconds = Some(value);
        }
        if let Some(value) = self.min_update_interval_seconds {
            config.min_update_interval_seconds = value;
        }
        if let Some(value) = self.open_market_ttl_seconds {
            config.open_market_ttl_seconds = Some(value);
        }
        if let Some(value) = self.closed_market_ttl_seconds {
            config.closed_market_ttl_seconds = Some(value);
        }
    }
}

fn to_usize(value: u64, key: &'static str) -> Result<usize, LoadError> {
    usize::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(to_usize(value, key)?)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
