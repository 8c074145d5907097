//! Two-tier cache store.
//!
//! The hot tier is a bounded in-process map; the warm tier is a remote
//! key-value store holding the backing copy of every cached value. The
//! two copies expire on their own clocks. Warm-tier trouble is logged
//! and swallowed here so callers only ever see a miss or a skipped write.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use super::clock::Clock;
use super::codec::{self, CompressionPolicy};
use super::config::CacheConfig;
use super::entry::{CacheEntry, MAX_TTL_SECONDS, saturating_deadline};
use super::error::{CacheError, CodecError, WarmTierError};
use super::hot::HotTier;
use super::warm::WarmTier;

const METRIC_HIT_TOTAL: &str = "tickvault_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "tickvault_cache_miss_total";
const METRIC_PROMOTE_TOTAL: &str = "tickvault_cache_promote_total";
const METRIC_COMPRESSED_TOTAL: &str = "tickvault_cache_compressed_total";
const METRIC_WARM_ERROR_TOTAL: &str = "tickvault_warm_error_total";
const METRIC_OP_MS: &str = "tickvault_cache_op_ms";

/// Where a write should land.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorePriority {
    /// Warm tier plus the hot tier.
    Hot,
    /// Warm tier only; any hot copy is dropped.
    Warm,
    /// Warm tier, plus the hot tier for small, low-cardinality payloads or
    /// keys that are already hot.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Warm,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub tier: Tier,
}

/// What a [`TieredCacheStore::set`] or [`TieredCacheStore::renew`] actually wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreWrite {
    pub hot: bool,
    pub warm: bool,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub hot_removed: usize,
    /// `None` when the warm tier could not be cleared.
    pub warm_removed: Option<u64>,
}

pub struct TieredCacheStore {
    hot: HotTier,
    warm: Arc<dyn WarmTier>,
    clock: Arc<dyn Clock>,
    compression: CompressionPolicy,
    hot_max_ttl: Duration,
    auto_max_bytes: usize,
    auto_max_elements: usize,
    warm_io_timeout: Duration,
}

impl TieredCacheStore {
    pub fn new(config: &CacheConfig, warm: Arc<dyn WarmTier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            hot: HotTier::new(config.hot_capacity_non_zero()),
            warm,
            clock,
            compression: config.compression,
            hot_max_ttl: config.hot_max_ttl(),
            auto_max_bytes: config.auto_max_bytes,
            auto_max_elements: config.auto_max_elements,
            warm_io_timeout: config.warm_io_timeout(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn warm_backend(&self) -> &'static str {
        self.warm.name()
    }

    /// Look `key` up in the hot tier, then the warm tier. A warm hit is
    /// promoted into the hot tier before it is returned.
    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, key: &str) -> Option<CacheHit> {
        let started = Instant::now();
        let now = self.clock.now();

        if let Some(entry) = self.hot.get(key, now) {
            counter!(METRIC_HIT_TOTAL, "tier" => "hot").increment(1);
            record_op("get", started);
            return Some(CacheHit {
                entry,
                tier: Tier::Hot,
            });
        }

        let hit = match self.read_warm(key, now).await {
            Some(mut entry) => {
                entry.access_count = 1;
                let expires_at = self.hot_expiry(&entry, now);
                self.hot
                    .insert(key.to_owned(), entry.clone(), expires_at, now);
                counter!(METRIC_HIT_TOTAL, "tier" => "warm").increment(1);
                counter!(METRIC_PROMOTE_TOTAL).increment(1);
                debug!(key, "Promoted warm-tier entry into hot tier");
                Some(CacheHit {
                    entry,
                    tier: Tier::Warm,
                })
            }
            None => {
                counter!(METRIC_MISS_TOTAL).increment(1);
                None
            }
        };

        record_op("get", started);
        hit
    }

    /// Encode `value` and write it with a TTL of `ttl_seconds`.
    ///
    /// The warm write is best-effort. A zero TTL writes nothing. TTLs above
    /// [`MAX_TTL_SECONDS`] are clamped to it.
    #[instrument(level = "debug", skip(self, value))]
    pub async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl_seconds: u64,
        priority: StorePriority,
    ) -> Result<StoreWrite, CodecError> {
        if ttl_seconds == 0 {
            return Ok(StoreWrite::default());
        }

        let started = Instant::now();
        let payload = codec::encode_payload(value, &self.compression)?;
        if payload.compressed {
            counter!(METRIC_COMPRESSED_TOTAL).increment(1);
        }

        let entry = CacheEntry {
            data: payload.bytes,
            compressed: payload.compressed,
            stored_at: self.clock.now(),
            ttl_seconds: ttl_seconds.min(MAX_TTL_SECONDS),
            access_count: 0,
        };
        let write = self
            .write_entry(key, entry, payload.raw_len, payload.elements, priority)
            .await?;
        record_op("set", started);
        Ok(write)
    }

    /// Store `previous`'s payload again, as of now, under a fresh TTL.
    ///
    /// Used when a refresh produced the same value: the bytes are reused
    /// as-is, only the expiry moves. `value` is the decoded payload and
    /// feeds the `Auto` admission check.
    #[instrument(level = "debug", skip(self, previous, value))]
    pub async fn renew(
        &self,
        key: &str,
        previous: &CacheEntry,
        value: &Value,
        ttl_seconds: u64,
        priority: StorePriority,
    ) -> Result<StoreWrite, CodecError> {
        if ttl_seconds == 0 {
            return Ok(StoreWrite::default());
        }

        let started = Instant::now();
        let raw_len = if previous.compressed {
            serde_json::to_vec(value)?.len()
        } else {
            previous.data.len()
        };
        let entry = CacheEntry {
            data: previous.data.clone(),
            compressed: previous.compressed,
            stored_at: self.clock.now(),
            ttl_seconds: ttl_seconds.min(MAX_TTL_SECONDS),
            access_count: 0,
        };
        let write = self
            .write_entry(key, entry, raw_len, codec::element_count(value), priority)
            .await?;
        record_op("renew", started);
        Ok(write)
    }

    async fn write_entry(
        &self,
        key: &str,
        entry: CacheEntry,
        raw_len: usize,
        elements: usize,
        priority: StorePriority,
    ) -> Result<StoreWrite, CodecError> {
        let now = entry.stored_at;
        let compressed = entry.compressed;
        let envelope = codec::to_warm_value(&entry)?;

        let warm = match self
            .warm_io(
                "set",
                self.warm
                    .set_ex(key, envelope, Duration::from_secs(entry.ttl_seconds)),
            )
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.note_warm_failure("set", key, &err);
                false
            }
        };

        let hot = match priority {
            StorePriority::Hot => true,
            StorePriority::Warm => {
                self.hot.remove(key);
                false
            }
            StorePriority::Auto => {
                (raw_len <= self.auto_max_bytes && elements <= self.auto_max_elements)
                    || self.hot.contains(key, now)
            }
        };
        if hot {
            let expires_at = self.hot_expiry(&entry, now);
            self.hot.insert(key.to_owned(), entry, expires_at, now);
        }

        Ok(StoreWrite {
            hot,
            warm,
            compressed,
        })
    }

    /// Remove `key` from both tiers. Returns whether a hot copy existed.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.hot.remove(key);
        if let Err(err) = self.warm_io("delete", self.warm.delete(key)).await {
            self.note_warm_failure("delete", key, &err);
        }
        removed
    }

    /// Remove every key matching the glob `pattern` from both tiers.
    pub async fn clear(&self, pattern: &str) -> Result<ClearReport, CacheError> {
        let matcher = glob::Pattern::new(pattern).map_err(|source| CacheError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;

        let hot_removed = self.hot.remove_matching(&matcher);
        let warm_removed = match self
            .warm_io("clear", self.warm.delete_matching(pattern))
            .await
        {
            Ok(count) => Some(count),
            Err(err) => {
                self.note_warm_failure("clear", pattern, &err);
                None
            }
        };

        debug!(pattern, hot_removed, ?warm_removed, "Cleared cache entries");
        Ok(ClearReport {
            hot_removed,
            warm_removed,
        })
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    pub fn hot_capacity(&self) -> usize {
        self.hot.capacity()
    }

    pub fn hot_contains(&self, key: &str) -> bool {
        self.hot.contains(key, self.clock.now())
    }

    /// Whether the warm tier holds a live, decodable copy. Errors count as absent.
    pub async fn warm_contains(&self, key: &str) -> bool {
        self.read_warm(key, self.clock.now()).await.is_some()
    }

    async fn read_warm(&self, key: &str, now: OffsetDateTime) -> Option<CacheEntry> {
        let text = match self.warm_io("get", self.warm.get(key)).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(err) => {
                self.note_warm_failure("get", key, &err);
                return None;
            }
        };

        match codec::from_warm_value(&text) {
            // The remote TTL and our clock can disagree; trust the clock.
            Ok(entry) if entry.is_expired(now) => None,
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(key, error = %err, "Discarding undecodable warm-tier entry");
                if let Err(err) = self.warm_io("delete", self.warm.delete(key)).await {
                    self.note_warm_failure("delete", key, &err);
                }
                None
            }
        }
    }

    /// The hot copy never outlives the entry, nor `hot_max_ttl`.
    fn hot_expiry(&self, entry: &CacheEntry, now: OffsetDateTime) -> OffsetDateTime {
        entry
            .expires_at()
            .min(saturating_deadline(now, self.hot_max_ttl))
    }

    async fn warm_io<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, WarmTierError>>,
    ) -> Result<T, WarmTierError> {
        match tokio::time::timeout(self.warm_io_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(WarmTierError::Timeout {
                op,
                timeout: self.warm_io_timeout,
            }),
        }
    }

    fn note_warm_failure(&self, op: &'static str, key: &str, err: &WarmTierError) {
        counter!(METRIC_WARM_ERROR_TOTAL, "op" => op).increment(1);
        warn!(
            backend = self.warm.name(),
            op,
            key,
            error = %err,
            "Warm tier call failed; continuing without it"
        );
    }
}

fn record_op(op: &'static str, started: Instant) {
    histogram!(METRIC_OP_MS, "op" => op).record(started.elapsed().as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::warm::MemoryWarmTier;

    struct Harness {
        clock: Arc<ManualClock>,
        warm: Arc<MemoryWarmTier>,
        store: TieredCacheStore,
    }

    fn harness(config: CacheConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 14:30 UTC)));
        let warm = Arc::new(MemoryWarmTier::new(clock.clone()));
        let store = TieredCacheStore::new(&config, warm.clone(), clock.clone());
        Harness { clock, warm, store }
    }

    /// Warm tier whose calls all fail, optionally after hanging.
    struct BrokenWarmTier {
        hang: AtomicBool,
    }

    #[async_trait]
    impl WarmTier for BrokenWarmTier {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, WarmTierError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Err(WarmTierError::Connection("connection refused".into()))
        }

        async fn set_ex(
            &self,
            _key: &str,
            _value: String,
            _ttl: Duration,
        ) -> Result<(), WarmTierError> {
            Err(WarmTierError::Connection("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<bool, WarmTierError> {
            Err(WarmTierError::Connection("connection refused".into()))
        }

        async fn delete_matching(&self, _pattern: &str) -> Result<u64, WarmTierError> {
            Err(WarmTierError::Connection("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn hot_priority_writes_both_tiers() {
        let h = harness(CacheConfig::default());
        let write = h
            .store
            .set("k", &json!({"px": 1}), 60, StorePriority::Hot)
            .await
            .expect("set");

        assert_eq!(
            write,
            StoreWrite {
                hot: true,
                warm: true,
                compressed: false
            }
        );
        assert!(h.store.hot_contains("k"));
        assert!(h.store.warm_contains("k").await);

        let hit = h.store.get("k").await.expect("hit");
        assert_eq!(hit.tier, Tier::Hot);
        assert_eq!(hit.entry.access_count, 1);
        assert_eq!(hit.entry.decode::<Value>().expect("decode"), json!({"px": 1}));
    }

    #[tokio::test]
    async fn auto_priority_keeps_large_payloads_out_of_hot_tier() {
        let h = harness(CacheConfig {
            auto_max_elements: 3,
            ..Default::default()
        });

        let small = h
            .store
            .set("small", &json!([1, 2]), 60, StorePriority::Auto)
            .await
            .expect("set");
        let wide = h
            .store
            .set("wide", &json!([1, 2, 3, 4]), 60, StorePriority::Auto)
            .await
            .expect("set");

        assert!(small.hot);
        assert!(!wide.hot);
        assert!(wide.warm);
        assert!(!h.store.hot_contains("wide"));
    }

    #[tokio::test]
    async fn warm_priority_drops_stale_hot_copy() {
        let h = harness(CacheConfig::default());
        h.store
            .set("k", &json!(1), 60, StorePriority::Hot)
            .await
            .expect("set");
        h.store
            .set("k", &json!(2), 60, StorePriority::Warm)
            .await
            .expect("set");

        assert!(!h.store.hot_contains("k"));
        let hit = h.store.get("k").await.expect("hit");
        assert_eq!(hit.tier, Tier::Warm);
        assert_eq!(hit.entry.decode::<Value>().expect("decode"), json!(2));
    }

    #[tokio::test]
    async fn warm_hit_is_promoted() {
        let h = harness(CacheConfig::default());
        h.store
            .set("k", &json!({"px": 1}), 60, StorePriority::Warm)
            .await
            .expect("set");
        assert!(!h.store.hot_contains("k"));

        let first = h.store.get("k").await.expect("warm hit");
        assert_eq!(first.tier, Tier::Warm);
        assert_eq!(first.entry.access_count, 1);
        assert!(h.store.hot_contains("k"));

        let second = h.store.get("k").await.expect("hot hit");
        assert_eq!(second.tier, Tier::Hot);
        assert_eq!(second.entry.access_count, 2);
    }

    #[tokio::test]
    async fn hot_and_warm_expire_independently() {
        let h = harness(CacheConfig {
            hot_max_ttl_seconds: 10,
            ..Default::default()
        });
        h.store
            .set("k", &json!(1), 60, StorePriority::Hot)
            .await
            .expect("set");

        h.clock.advance(Duration::from_secs(11));
        assert!(!h.store.hot_contains("k"));
        let hit = h.store.get("k").await.expect("warm still live");
        assert_eq!(hit.tier, Tier::Warm);

        h.clock.advance(Duration::from_secs(50));
        assert!(h.store.get("k").await.is_none());
    }

    #[tokio::test]
    async fn promoted_copy_never_outlives_the_entry() {
        let h = harness(CacheConfig::default());
        h.store
            .set("k", &json!(1), 30, StorePriority::Warm)
            .await
            .expect("set");
        h.clock.advance(Duration::from_secs(25));
        assert!(h.store.get("k").await.is_some());

        h.clock.advance(Duration::from_secs(5));
        assert!(!h.store.hot_contains("k"));
        assert!(h.store.get("k").await.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_writes_nothing() {
        let h = harness(CacheConfig::default());
        let write = h
            .store
            .set("k", &json!(1), 0, StorePriority::Hot)
            .await
            .expect("set");

        assert_eq!(write, StoreWrite::default());
        assert!(h.warm.is_empty());
        assert_eq!(h.store.hot_len(), 0);
    }

    #[tokio::test]
    async fn undecodable_warm_entry_is_a_miss_and_removed() {
        let h = harness(CacheConfig::default());
        h.warm
            .set_ex("k", "{not an envelope".into(), Duration::from_secs(60))
            .await
            .expect("seed");

        assert!(h.store.get("k").await.is_none());
        assert!(h.warm.is_empty());
    }

    #[tokio::test]
    async fn warm_entry_with_oversized_ttl_is_a_miss_and_removed() {
        let h = harness(CacheConfig::default());
        h.warm
            .set_ex(
                "k",
                r#"{"compressed":false,"data":"1","storedAt":0,"ttlSeconds":18446744073709551615}"#
                    .into(),
                Duration::from_secs(60),
            )
            .await
            .expect("seed");

        assert!(h.store.get("k").await.is_none());
        assert!(h.warm.is_empty());
        assert_eq!(h.store.hot_len(), 0);
    }

    #[tokio::test]
    async fn oversized_write_ttl_is_clamped() {
        let h = harness(CacheConfig::default());
        h.store
            .set("k", &json!(1), u64::MAX, StorePriority::Hot)
            .await
            .expect("set");

        let hit = h.store.get("k").await.expect("hit");
        assert_eq!(hit.entry.ttl_seconds, MAX_TTL_SECONDS);
        assert!(h.store.warm_contains("k").await);
    }

    #[tokio::test]
    async fn renew_reuses_bytes_and_restarts_the_clock() {
        let h = harness(CacheConfig::default());
        let value = json!({"px": 1});
        h.store
            .set("k", &value, 60, StorePriority::Auto)
            .await
            .expect("set");
        let previous = h.store.get("k").await.expect("hit").entry;

        h.clock.advance(Duration::from_secs(50));
        let write = h
            .store
            .renew("k", &previous, &value, 60, StorePriority::Auto)
            .await
            .expect("renew");
        assert!(write.hot);
        assert!(write.warm);

        h.clock.advance(Duration::from_secs(40));
        let hit = h.store.get("k").await.expect("still live");
        assert_eq!(hit.entry.data, previous.data);
        assert_eq!(hit.entry.ttl_remaining(h.clock.now()), 20);
        assert!(h.store.warm_contains("k").await);
    }

    #[tokio::test]
    async fn clear_matches_both_tiers() {
        let h = harness(CacheConfig::default());
        for key in ["md:adaptive:AAPL", "md:adaptive:MSFT", "md:market_aware:AAPL"] {
            h.store
                .set(key, &json!(1), 60, StorePriority::Hot)
                .await
                .expect("set");
        }

        let report = h.store.clear("md:adaptive:*").await.expect("clear");
        assert_eq!(report.hot_removed, 2);
        assert_eq!(report.warm_removed, Some(2));
        assert!(h.store.hot_contains("md:market_aware:AAPL"));
        assert!(h.store.get("md:adaptive:AAPL").await.is_none());
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let h = harness(CacheConfig::default());
        assert!(matches!(
            h.store.clear("md:[").await,
            Err(CacheError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn warm_outage_degrades_to_miss_and_noop() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 14:30 UTC)));
        let warm = Arc::new(BrokenWarmTier {
            hang: AtomicBool::new(false),
        });
        let store = TieredCacheStore::new(&CacheConfig::default(), warm, clock);

        assert!(store.get("k").await.is_none());
        let write = store
            .set("k", &json!({"px": 1}), 60, StorePriority::Hot)
            .await
            .expect("set survives warm outage");
        assert!(write.hot);
        assert!(!write.warm);
        assert!(store.get("k").await.is_some());
        assert!(store.delete("k").await);
        let report = store.clear("*").await.expect("clear");
        assert_eq!(report.warm_removed, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_warm_tier_times_out() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 14:30 UTC)));
        let warm = Arc::new(BrokenWarmTier {
            hang: AtomicBool::new(true),
        });
        let store = TieredCacheStore::new(&CacheConfig::default(), warm, clock);

        assert!(store.get("k").await.is_none());
    }
}
