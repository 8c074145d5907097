//! Cache strategies and the pure decisions derived from them.
//!
//! A strategy decides two things for a key: how long a freshly stored value
//! lives ([`resolve_ttl`]) and whether a cached value is close enough to
//! expiry that a background refresh should start ([`should_trigger_refresh`]).
//! Nothing here performs I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::entry::{CacheEntry, MAX_TTL_SECONDS};
use super::error::StrategyConfigError;

/// Adaptive TTL multiplier for a key whose value never changes.
const ADAPTIVE_MAX_FACTOR: f64 = 2.0;
/// Adaptive TTL multiplier for a key whose value changes on every refresh.
const ADAPTIVE_MIN_FACTOR: f64 = 0.25;

/// Policy chosen by the caller for each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Quotes and other data that must stay within seconds of the source.
    StrongTimeliness,
    /// Reference data that tolerates minutes of staleness.
    WeakTimeliness,
    /// TTL follows the trading session of the request's market.
    MarketAware,
    /// Bypass both tiers entirely.
    NoCache,
    /// TTL stretches or shrinks with how often the value actually changes.
    Adaptive,
}

impl CacheStrategy {
    pub const ALL: [CacheStrategy; 5] = [
        CacheStrategy::StrongTimeliness,
        CacheStrategy::WeakTimeliness,
        CacheStrategy::MarketAware,
        CacheStrategy::NoCache,
        CacheStrategy::Adaptive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrongTimeliness => "strong_timeliness",
            Self::WeakTimeliness => "weak_timeliness",
            Self::MarketAware => "market_aware",
            Self::NoCache => "no_cache",
            Self::Adaptive => "adaptive",
        }
    }

    /// Whether values fetched under this strategy are ever written to a tier.
    pub fn is_cached(self) -> bool {
        !matches!(self, Self::NoCache)
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == value)
            .ok_or_else(|| format!("unknown cache strategy `{value}`"))
    }
}

/// Numeric parameters for one cached strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    /// Base TTL. For `MarketAware` this is the fallback when the market's
    /// state has never been reported.
    pub ttl_seconds: u64,
    pub min_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    /// Fraction of TTL remaining below which a refresh is triggered.
    pub update_threshold_ratio: f64,
    /// Age after which `StrongTimeliness`/`MarketAware` entries always refresh.
    pub force_refresh_interval_seconds: Option<u64>,
    /// Floor between two refreshes of the same key.
    pub min_update_interval_seconds: u64,
    pub open_market_ttl_seconds: Option<u64>,
    pub closed_market_ttl_seconds: Option<u64>,
}

/// One [`StrategyConfig`] per cached strategy. `NoCache` has none.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyTable {
    pub strong_timeliness: StrategyConfig,
    pub weak_timeliness: StrategyConfig,
    pub market_aware: StrategyConfig,
    pub adaptive: StrategyConfig,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            strong_timeliness: StrategyConfig {
                ttl_seconds: 5,
                min_ttl_seconds: 1,
                max_ttl_seconds: 30,
                update_threshold_ratio: 0.5,
                force_refresh_interval_seconds: Some(30),
                min_update_interval_seconds: 1,
                open_market_ttl_seconds: None,
                closed_market_ttl_seconds: None,
            },
            weak_timeliness: StrategyConfig {
                ttl_seconds: 300,
                min_ttl_seconds: 60,
                max_ttl_seconds: 3_600,
                update_threshold_ratio: 0.2,
                force_refresh_interval_seconds: None,
                min_update_interval_seconds: 60,
                open_market_ttl_seconds: None,
                closed_market_ttl_seconds: None,
            },
            market_aware: StrategyConfig {
                ttl_seconds: 60,
                min_ttl_seconds: 5,
                max_ttl_seconds: 7_200,
                update_threshold_ratio: 0.3,
                force_refresh_interval_seconds: Some(120),
                min_update_interval_seconds: 5,
                open_market_ttl_seconds: Some(10),
                closed_market_ttl_seconds: Some(3_600),
            },
            adaptive: StrategyConfig {
                ttl_seconds: 120,
                min_ttl_seconds: 30,
                max_ttl_seconds: 900,
                update_threshold_ratio: 0.25,
                force_refresh_interval_seconds: None,
                min_update_interval_seconds: 15,
                open_market_ttl_seconds: None,
                closed_market_ttl_seconds: None,
            },
        }
    }
}

impl StrategyTable {
    pub fn config(&self, strategy: CacheStrategy) -> Option<&StrategyConfig> {
        match strategy {
            CacheStrategy::StrongTimeliness => Some(&self.strong_timeliness),
            CacheStrategy::WeakTimeliness => Some(&self.weak_timeliness),
            CacheStrategy::MarketAware => Some(&self.market_aware),
            CacheStrategy::Adaptive => Some(&self.adaptive),
            CacheStrategy::NoCache => None,
        }
    }

    pub fn config_mut(&mut self, strategy: CacheStrategy) -> Option<&mut StrategyConfig> {
        match strategy {
            CacheStrategy::StrongTimeliness => Some(&mut self.strong_timeliness),
            CacheStrategy::WeakTimeliness => Some(&mut self.weak_timeliness),
            CacheStrategy::MarketAware => Some(&mut self.market_aware),
            CacheStrategy::Adaptive => Some(&mut self.adaptive),
            CacheStrategy::NoCache => None,
        }
    }

    /// Check every configured strategy. Called once at startup; the hot
    /// path assumes a validated table and never clamps bad ranges.
    pub fn validate(&self) -> Result<(), StrategyConfigError> {
        for strategy in CacheStrategy::ALL {
            if let Some(config) = self.config(strategy) {
                validate_strategy(strategy, config)?;
            }
        }
        Ok(())
    }
}

fn validate_strategy(
    strategy: CacheStrategy,
    config: &StrategyConfig,
) -> Result<(), StrategyConfigError> {
    let positive = |field: &'static str, value: u64| {
        if value == 0 {
            Err(StrategyConfigError::new(
                strategy,
                field,
                "must be greater than zero",
            ))
        } else {
            Ok(())
        }
    };

    positive("ttl_seconds", config.ttl_seconds)?;
    positive("min_ttl_seconds", config.min_ttl_seconds)?;
    positive("max_ttl_seconds", config.max_ttl_seconds)?;

    let ratio = config.update_threshold_ratio;
    if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
        return Err(StrategyConfigError::new(
            strategy,
            "update_threshold_ratio",
            format!("must be within [0, 1], got {ratio}"),
        ));
    }

    if let Some(interval) = config.force_refresh_interval_seconds {
        positive("force_refresh_interval_seconds", interval)?;
    }

    if config.min_ttl_seconds > config.max_ttl_seconds {
        return Err(StrategyConfigError::new(
            strategy,
            "min_ttl_seconds",
            "must not exceed max_ttl_seconds",
        ));
    }
    if config.max_ttl_seconds > MAX_TTL_SECONDS {
        return Err(StrategyConfigError::new(
            strategy,
            "max_ttl_seconds",
            format!("must not exceed {MAX_TTL_SECONDS}"),
        ));
    }

    let within = |field: &'static str, value: u64| {
        if (config.min_ttl_seconds..=config.max_ttl_seconds).contains(&value) {
            Ok(())
        } else {
            Err(StrategyConfigError::new(
                strategy,
                field,
                format!(
                    "must lie within [{}, {}], got {value}",
                    config.min_ttl_seconds, config.max_ttl_seconds
                ),
            ))
        }
    };

    if strategy == CacheStrategy::Adaptive {
        if !(config.min_ttl_seconds < config.ttl_seconds
            && config.ttl_seconds < config.max_ttl_seconds)
        {
            return Err(StrategyConfigError::new(
                strategy,
                "ttl_seconds",
                format!(
                    "adaptive range requires min < base < max, got {} < {} < {}",
                    config.min_ttl_seconds, config.ttl_seconds, config.max_ttl_seconds
                ),
            ));
        }
    } else {
        within("ttl_seconds", config.ttl_seconds)?;
    }

    if strategy == CacheStrategy::MarketAware {
        let open = config.open_market_ttl_seconds.ok_or_else(|| {
            StrategyConfigError::new(strategy, "open_market_ttl_seconds", "is required")
        })?;
        let closed = config.closed_market_ttl_seconds.ok_or_else(|| {
            StrategyConfigError::new(strategy, "closed_market_ttl_seconds", "is required")
        })?;
        within("open_market_ttl_seconds", open)?;
        within("closed_market_ttl_seconds", closed)?;
    }

    Ok(())
}

/// Per-request inputs that can move a strategy's TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolveContext {
    /// Latest session state of the request's market, if known.
    pub market_open: Option<bool>,
    /// Fraction of recent refreshes that produced a meaningfully different
    /// value, in `[0, 1]`.
    pub change_frequency: Option<f64>,
}

/// TTL, in seconds, for a value about to be stored under `strategy`.
///
/// Returns 0 for `NoCache`; such values are never stored.
pub fn resolve_ttl(strategy: CacheStrategy, config: &StrategyConfig, ctx: &ResolveContext) -> u64 {
    match strategy {
        CacheStrategy::NoCache => 0,
        CacheStrategy::StrongTimeliness | CacheStrategy::WeakTimeliness => config.ttl_seconds,
        CacheStrategy::MarketAware => {
            let session_ttl = match ctx.market_open {
                Some(true) => config.open_market_ttl_seconds,
                Some(false) => config.closed_market_ttl_seconds,
                None => None,
            };
            session_ttl.unwrap_or(config.ttl_seconds)
        }
        CacheStrategy::Adaptive => {
            let factor = adaptation_factor(ctx.change_frequency);
            let scaled = (config.ttl_seconds as f64 * factor).round() as u64;
            scaled.clamp(config.min_ttl_seconds, config.max_ttl_seconds)
        }
    }
}

/// Linear map from change frequency to a TTL multiplier. Unknown history
/// leaves the base TTL untouched.
fn adaptation_factor(change_frequency: Option<f64>) -> f64 {
    match change_frequency.filter(|freq| freq.is_finite()) {
        Some(freq) => {
            let freq = freq.clamp(0.0, 1.0);
            ADAPTIVE_MAX_FACTOR - (ADAPTIVE_MAX_FACTOR - ADAPTIVE_MIN_FACTOR) * freq
        }
        None => 1.0,
    }
}

/// Whether a cached `entry` should be refreshed in the background.
///
/// `last_refresh` is when a refresh for this key was last scheduled; the
/// entry's own `stored_at` counts as a refresh too.
pub fn should_trigger_refresh(
    entry: &CacheEntry,
    strategy: CacheStrategy,
    config: &StrategyConfig,
    now: OffsetDateTime,
    last_refresh: Option<OffsetDateTime>,
) -> bool {
    if !strategy.is_cached() || entry.ttl_seconds == 0 {
        return false;
    }

    let last = last_refresh.map_or(entry.stored_at, |last| last.max(entry.stored_at));
    let since_last = (now - last).as_seconds_f64();
    if since_last < config.min_update_interval_seconds as f64 {
        return false;
    }

    let ttl = entry.ttl_seconds as f64;
    let elapsed = entry.age(now).as_seconds_f64();
    let remaining_ratio = (ttl - elapsed) / ttl;
    if remaining_ratio < config.update_threshold_ratio {
        return true;
    }

    match strategy {
        CacheStrategy::StrongTimeliness | CacheStrategy::MarketAware => config
            .force_refresh_interval_seconds
            .is_some_and(|force| elapsed >= force as f64),
        CacheStrategy::WeakTimeliness | CacheStrategy::Adaptive | CacheStrategy::NoCache => false,
    }
}

/// Strategy decisions bound to a validated [`StrategyTable`].
#[derive(Debug, Clone)]
pub struct StrategyResolver {
    table: StrategyTable,
}

impl StrategyResolver {
    pub fn new(table: StrategyTable) -> Result<Self, StrategyConfigError> {
        table.validate()?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &StrategyTable {
        &self.table
    }

    pub fn resolve_ttl(&self, strategy: CacheStrategy, ctx: &ResolveContext) -> u64 {
        self.table
            .config(strategy)
            .map_or(0, |config| resolve_ttl(strategy, config, ctx))
    }

    pub fn should_trigger_refresh(
        &self,
        entry: &CacheEntry,
        strategy: CacheStrategy,
        now: OffsetDateTime,
        last_refresh: Option<OffsetDateTime>,
    ) -> bool {
        self.table.config(strategy).is_some_and(|config| {
            should_trigger_refresh(entry, strategy, config, now, last_refresh)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use time::macros::datetime;

    use super::*;

    fn entry_stored_at(stored_at: OffsetDateTime, ttl_seconds: u64) -> CacheEntry {
        CacheEntry {
            data: Bytes::from_static(b"{}"),
            compressed: false,
            stored_at,
            ttl_seconds,
            access_count: 0,
        }
    }

    fn threshold_config() -> StrategyConfig {
        StrategyConfig {
            ttl_seconds: 60,
            min_ttl_seconds: 1,
            max_ttl_seconds: 600,
            update_threshold_ratio: 0.3,
            force_refresh_interval_seconds: None,
            min_update_interval_seconds: 5,
            open_market_ttl_seconds: None,
            closed_market_ttl_seconds: None,
        }
    }

    #[test]
    fn default_table_is_valid() {
        StrategyTable::default().validate().expect("defaults validate");
    }

    #[test]
    fn strategy_names_round_trip_through_from_str() {
        for strategy in CacheStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<CacheStrategy>(), Ok(strategy));
        }
        assert!("lazy".parse::<CacheStrategy>().is_err());
    }

    #[test]
    fn fixed_strategies_return_configured_ttl() {
        let table = StrategyTable::default();
        let ctx = ResolveContext {
            market_open: Some(false),
            change_frequency: Some(1.0),
        };
        assert_eq!(
            resolve_ttl(CacheStrategy::StrongTimeliness, &table.strong_timeliness, &ctx),
            5
        );
        assert_eq!(
            resolve_ttl(CacheStrategy::WeakTimeliness, &table.weak_timeliness, &ctx),
            300
        );
    }

    #[test]
    fn market_aware_follows_session() {
        let config = StrategyTable::default().market_aware;
        let open = ResolveContext {
            market_open: Some(true),
            ..Default::default()
        };
        let closed = ResolveContext {
            market_open: Some(false),
            ..Default::default()
        };

        assert_eq!(resolve_ttl(CacheStrategy::MarketAware, &config, &open), 10);
        assert_eq!(resolve_ttl(CacheStrategy::MarketAware, &config, &closed), 3_600);
        assert_eq!(
            resolve_ttl(CacheStrategy::MarketAware, &config, &ResolveContext::default()),
            60
        );
    }

    #[test]
    fn adaptive_ttl_stays_within_bounds_for_any_frequency() {
        let config = StrategyTable::default().adaptive;
        let samples = [
            None,
            Some(f64::NAN),
            Some(f64::INFINITY),
            Some(-3.0),
            Some(0.0),
            Some(0.1),
            Some(0.5),
            Some(0.9),
            Some(1.0),
            Some(42.0),
        ];

        for change_frequency in samples {
            let ttl = resolve_ttl(
                CacheStrategy::Adaptive,
                &config,
                &ResolveContext {
                    market_open: None,
                    change_frequency,
                },
            );
            assert!(
                (config.min_ttl_seconds..=config.max_ttl_seconds).contains(&ttl),
                "ttl {ttl} out of bounds for {change_frequency:?}"
            );
        }
    }

    #[test]
    fn adaptive_ttl_shrinks_as_values_change_more_often() {
        let config = StrategyTable::default().adaptive;
        let ttl_for = |freq: f64| {
            resolve_ttl(
                CacheStrategy::Adaptive,
                &config,
                &ResolveContext {
                    market_open: None,
                    change_frequency: Some(freq),
                },
            )
        };

        assert_eq!(ttl_for(0.0), 240);
        assert_eq!(ttl_for(1.0), 30);
        assert!(ttl_for(0.2) > ttl_for(0.8));
    }

    #[test]
    fn adaptive_requires_strict_range() {
        let mut table = StrategyTable::default();
        table.adaptive.min_ttl_seconds = table.adaptive.ttl_seconds;

        let err = table.validate().expect_err("min == base must be rejected");
        assert_eq!(err.strategy, CacheStrategy::Adaptive);
        assert_eq!(err.field, "ttl_seconds");
    }

    #[test]
    fn zero_ttl_rejected_at_validation() {
        let mut table = StrategyTable::default();
        table.weak_timeliness.ttl_seconds = 0;

        let err = table.validate().expect_err("zero ttl must be rejected");
        assert_eq!(err.strategy, CacheStrategy::WeakTimeliness);
        assert_eq!(err.field, "ttl_seconds");
        assert!(StrategyResolver::new(table).is_err());
    }

    #[test]
    fn threshold_ratio_out_of_range_rejected() {
        let mut table = StrategyTable::default();
        table.strong_timeliness.update_threshold_ratio = 1.5;
        assert!(table.validate().is_err());
    }

    #[test]
    fn fixed_ttl_must_sit_inside_its_bounds() {
        let mut table = StrategyTable::default();
        table.weak_timeliness.ttl_seconds = u64::MAX;

        let err = table.validate().expect_err("ttl above max");
        assert_eq!(err.strategy, CacheStrategy::WeakTimeliness);
        assert_eq!(err.field, "ttl_seconds");

        let mut table = StrategyTable::default();
        table.strong_timeliness.ttl_seconds = table.strong_timeliness.min_ttl_seconds;
        table.validate().expect("ttl equal to min is allowed");
    }

    #[test]
    fn ttl_ceiling_caps_every_strategy() {
        let mut table = StrategyTable::default();
        table.weak_timeliness.max_ttl_seconds = MAX_TTL_SECONDS + 1;

        let err = table.validate().expect_err("max above ceiling");
        assert_eq!(err.field, "max_ttl_seconds");

        table.weak_timeliness.max_ttl_seconds = MAX_TTL_SECONDS;
        table.weak_timeliness.ttl_seconds = MAX_TTL_SECONDS;
        table.validate().expect("ceiling itself is allowed");
    }

    #[test]
    fn session_ttls_must_sit_inside_bounds() {
        let mut table = StrategyTable::default();
        table.market_aware.open_market_ttl_seconds = Some(table.market_aware.max_ttl_seconds + 1);
        let err = table.validate().expect_err("open ttl above max");
        assert_eq!(err.field, "open_market_ttl_seconds");

        let mut table = StrategyTable::default();
        table.market_aware.closed_market_ttl_seconds = Some(1);
        let err = table.validate().expect_err("closed ttl below min");
        assert_eq!(err.field, "closed_market_ttl_seconds");
    }

    #[test]
    fn market_aware_requires_session_ttls() {
        let mut table = StrategyTable::default();
        table.market_aware.closed_market_ttl_seconds = None;

        let err = table.validate().expect_err("missing closed ttl");
        assert_eq!(err.field, "closed_market_ttl_seconds");
    }

    #[test]
    fn refresh_triggers_below_threshold_ratio() {
        let stored = datetime!(2024-03-01 14:30 UTC);
        let entry = entry_stored_at(stored, 60);
        let config = threshold_config();

        // 40s elapsed leaves a third of the TTL.
        let at_40 = stored + Duration::from_secs(40);
        assert!(!should_trigger_refresh(
            &entry,
            CacheStrategy::WeakTimeliness,
            &config,
            at_40,
            None
        ));

        // 50s elapsed leaves ~0.17 of the TTL.
        let at_50 = stored + Duration::from_secs(50);
        assert!(should_trigger_refresh(
            &entry,
            CacheStrategy::WeakTimeliness,
            &config,
            at_50,
            None
        ));
    }

    #[test]
    fn min_update_interval_suppresses_refresh_storms() {
        let stored = datetime!(2024-03-01 14:30 UTC);
        let entry = entry_stored_at(stored, 60);
        let config = threshold_config();
        let now = stored + Duration::from_secs(55);

        let just_scheduled = Some(now - Duration::from_secs(2));
        assert!(!should_trigger_refresh(
            &entry,
            CacheStrategy::WeakTimeliness,
            &config,
            now,
            just_scheduled
        ));

        let long_ago = Some(now - Duration::from_secs(30));
        assert!(should_trigger_refresh(
            &entry,
            CacheStrategy::WeakTimeliness,
            &config,
            now,
            long_ago
        ));
    }

    #[test]
    fn force_interval_applies_only_to_strong_and_market_aware() {
        let stored = datetime!(2024-03-01 14:30 UTC);
        let entry = entry_stored_at(stored, 600);
        let config = StrategyConfig {
            force_refresh_interval_seconds: Some(30),
            ..threshold_config()
        };
        let now = stored + Duration::from_secs(31);

        assert!(should_trigger_refresh(
            &entry,
            CacheStrategy::StrongTimeliness,
            &config,
            now,
            None
        ));
        assert!(should_trigger_refresh(
            &entry,
            CacheStrategy::MarketAware,
            &config,
            now,
            None
        ));
        assert!(!should_trigger_refresh(
            &entry,
            CacheStrategy::WeakTimeliness,
            &config,
            now,
            None
        ));
    }

    #[test]
    fn no_cache_never_refreshes() {
        let stored = datetime!(2024-03-01 14:30 UTC);
        let entry = entry_stored_at(stored, 60);
        let now = stored + Duration::from_secs(59);
        assert!(!should_trigger_refresh(
            &entry,
            CacheStrategy::NoCache,
            &threshold_config(),
            now,
            None
        ));

        let resolver = StrategyResolver::new(StrategyTable::default()).expect("valid table");
        assert!(!resolver.should_trigger_refresh(&entry, CacheStrategy::NoCache, now, None));
        assert_eq!(
            resolver.resolve_ttl(CacheStrategy::NoCache, &ResolveContext::default()),
            0
        );
    }
}
