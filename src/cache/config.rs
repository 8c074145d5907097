//! Runtime knobs for the caching core.
//!
//! Built from [`Settings`](crate::config::Settings) by the binary, or
//! directly (usually via `Default`) when the crate is embedded.

use std::num::NonZeroUsize;
use std::time::Duration;

use super::codec::CompressionPolicy;
use super::entry::MAX_TTL_SECONDS;
use super::error::CacheConfigError;
use super::strategy::StrategyTable;

const DEFAULT_HOT_CAPACITY: usize = 1000;
const DEFAULT_HOT_MAX_TTL_SECS: u64 = 300;
const DEFAULT_AUTO_MAX_BYTES: usize = 8 * 1024;
const DEFAULT_AUTO_MAX_ELEMENTS: usize = 64;
const DEFAULT_WARM_IO_TIMEOUT_MS: u64 = 250;
const DEFAULT_MAX_CONCURRENT_UPDATES: usize = 4;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HISTORY_CAPACITY: usize = 4096;
const DEFAULT_HISTORY_WINDOW: usize = 20;
const DEFAULT_NAMESPACE: &str = "md";

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum entries in the hot tier.
    pub hot_capacity: usize,
    /// Upper bound on how long a copy may live in the hot tier.
    pub hot_max_ttl_seconds: u64,
    /// `Auto` writes go hot only at or below this serialized size...
    pub auto_max_bytes: usize,
    /// ...and at or below this many top-level elements.
    pub auto_max_elements: usize,
    /// Deadline for each warm-tier call.
    pub warm_io_timeout_ms: u64,
    pub compression: CompressionPolicy,
    /// Background refreshes allowed to run at once.
    pub max_concurrent_updates: usize,
    /// Attempts a background refresh gets before it is marked failed.
    pub max_retries: u32,
    /// Deadline for each fetch call, foreground or background.
    pub fetch_timeout_ms: u64,
    /// Keys tracked by the change-frequency history and the
    /// last-scheduled map.
    pub history_capacity: usize,
    /// Observations kept per key for change frequency.
    pub history_window: usize,
    /// Prefix of every storage key.
    pub namespace: String,
    /// Collapse concurrent misses on one key into a single fetch.
    pub single_flight: bool,
    /// Skip rewriting tiers when a background refresh brings no change.
    pub skip_unchanged_writes: bool,
    pub strategies: StrategyTable,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: DEFAULT_HOT_CAPACITY,
            hot_max_ttl_seconds: DEFAULT_HOT_MAX_TTL_SECS,
            auto_max_bytes: DEFAULT_AUTO_MAX_BYTES,
            auto_max_elements: DEFAULT_AUTO_MAX_ELEMENTS,
            warm_io_timeout_ms: DEFAULT_WARM_IO_TIMEOUT_MS,
            compression: CompressionPolicy::default(),
            max_concurrent_updates: DEFAULT_MAX_CONCURRENT_UPDATES,
            max_retries: DEFAULT_MAX_RETRIES,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_window: DEFAULT_HISTORY_WINDOW,
            namespace: DEFAULT_NAMESPACE.to_string(),
            single_flight: true,
            skip_unchanged_writes: false,
            strategies: StrategyTable::default(),
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            hot_capacity: settings.hot_tier.capacity.get(),
            hot_max_ttl_seconds: settings.hot_tier.max_ttl.as_secs(),
            auto_max_bytes: settings.hot_tier.auto_max_bytes,
            auto_max_elements: settings.hot_tier.auto_max_elements,
            warm_io_timeout_ms: duration_ms(settings.warm_tier.io_timeout),
            compression: settings.compression,
            max_concurrent_updates: settings.scheduler.max_concurrent_updates.get(),
            max_retries: settings.scheduler.max_retries,
            fetch_timeout_ms: duration_ms(settings.scheduler.fetch_timeout),
            history_capacity: settings.scheduler.history_capacity.get(),
            history_window: settings.scheduler.history_window.get(),
            namespace: settings.orchestrator.namespace.clone(),
            single_flight: settings.orchestrator.single_flight,
            skip_unchanged_writes: settings.orchestrator.skip_unchanged_writes,
            strategies: settings.strategies.clone(),
        }
    }
}

impl CacheConfig {
    /// Reject limits the core cannot run with. Called once at construction.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        let positive = [
            ("hot_capacity", self.hot_capacity as u64),
            ("hot_max_ttl_seconds", self.hot_max_ttl_seconds),
            ("warm_io_timeout_ms", self.warm_io_timeout_ms),
            ("max_concurrent_updates", self.max_concurrent_updates as u64),
            ("max_retries", u64::from(self.max_retries)),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("history_capacity", self.history_capacity as u64),
            ("history_window", self.history_window as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(CacheConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if self.hot_max_ttl_seconds > MAX_TTL_SECONDS {
            return Err(CacheConfigError::invalid(
                "hot_max_ttl_seconds",
                format!("must not exceed {MAX_TTL_SECONDS}"),
            ));
        }

        let ratio = self.compression.max_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(CacheConfigError::invalid(
                "compression.max_ratio",
                format!("must be in (0, 1], got {ratio}"),
            ));
        }

        if self.namespace.trim().is_empty() {
            return Err(CacheConfigError::invalid("namespace", "must not be empty"));
        }

        self.strategies.validate()?;
        Ok(())
    }

    pub fn hot_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.hot_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn history_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.history_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn hot_max_ttl(&self) -> Duration {
        Duration::from_secs(self.hot_max_ttl_seconds)
    }

    pub fn warm_io_timeout(&self) -> Duration {
        Duration::from_millis(self.warm_io_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
