//! Request-facing façade over the store, resolver and scheduler.
//!
//! Each call is one flow:
//!
//! 1. `NoCache` calls the fetch function and touches nothing else.
//! 2. A hit returns the cached value and, when the strategy says the entry
//!    is close to expiry, hands a refresh to the scheduler without waiting.
//! 3. A miss calls the fetch function, stores the value with a freshly
//!    resolved TTL, and returns it. Fetch errors go back to the caller.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

use super::adaptive::{ChangeDetector, ChangeHistory, JsonChangeDetector};
use super::clock::Clock;
use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::error::{CacheConfigError, CacheError, FetchError};
use super::market::MarketStateBoard;
use super::scheduler::{
    BackgroundRefreshScheduler, DrainReport, RefreshFn, RefreshRequest, ScheduleOutcome,
};
use super::store::{ClearReport, StorePriority, Tier, TieredCacheStore};
use super::strategy::{CacheStrategy, StrategyResolver};
use super::warm::WarmTier;
use super::writer::{CacheWriter, CommitOutcome, WriteTarget};

/// Caller-supplied upstream fetch.
pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    /// Market code whose session drives `MarketAware` TTLs.
    pub market: Option<String>,
    pub priority: StorePriority,
}

pub struct OrchestratorRequest<T> {
    pub cache_key: String,
    pub strategy: CacheStrategy,
    pub fetch: FetchFn<T>,
    pub metadata: RequestMetadata,
}

impl<T> OrchestratorRequest<T> {
    pub fn new<F, Fut>(cache_key: impl Into<String>, strategy: CacheStrategy, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Self {
            cache_key: cache_key.into(),
            strategy,
            fetch: Arc::new(move || fetch().boxed()),
            metadata: RequestMetadata::default(),
        }
    }

    pub fn with_market(mut self, market: impl Into<String>) -> Self {
        self.metadata.market = Some(market.into());
        self
    }

    pub fn with_priority(mut self, priority: StorePriority) -> Self {
        self.metadata.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorResult<T> {
    pub data: T,
    pub hit: bool,
    /// Tier that served a hit.
    pub tier: Option<Tier>,
    /// Seconds until the served copy expires. `None` for `NoCache`.
    pub ttl_remaining: Option<u64>,
    /// TTL the value was stored with. `None` for `NoCache`.
    pub dynamic_ttl: Option<u64>,
    pub strategy: CacheStrategy,
    pub storage_key: String,
    pub timestamp: OffsetDateTime,
    /// What happened to the refresh this hit asked for, if it asked.
    pub refresh: Option<ScheduleOutcome>,
}

pub struct CacheOrchestrator {
    namespace: String,
    single_flight: bool,
    fetch_timeout: Duration,
    clock: Arc<dyn Clock>,
    writer: Arc<CacheWriter>,
    scheduler: BackgroundRefreshScheduler,
    flights: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl CacheOrchestrator {
    /// Validate `config` and wire the store, resolver and scheduler.
    pub fn new(
        config: &CacheConfig,
        warm: Arc<dyn WarmTier>,
        clock: Arc<dyn Clock>,
        markets: Arc<MarketStateBoard>,
        detector: Arc<dyn ChangeDetector>,
    ) -> Result<Self, CacheConfigError> {
        config.validate()?;
        let resolver = StrategyResolver::new(config.strategies.clone())?;
        let store = Arc::new(TieredCacheStore::new(config, warm, Arc::clone(&clock)));
        let history = ChangeHistory::new(
            config.history_capacity_non_zero(),
            NonZeroUsize::new(config.history_window).unwrap_or(NonZeroUsize::MIN),
        );
        let writer = Arc::new(CacheWriter::new(
            store, resolver, markets, history, detector,
        ));
        let scheduler =
            BackgroundRefreshScheduler::new(config, Arc::clone(&writer), Arc::clone(&clock));

        Ok(Self {
            namespace: config.namespace.clone(),
            single_flight: config.single_flight,
            fetch_timeout: config.fetch_timeout(),
            clock,
            writer,
            scheduler,
            flights: DashMap::new(),
        })
    }

    /// Default limits, an empty market board and structural change detection.
    pub fn with_defaults(
        warm: Arc<dyn WarmTier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheConfigError> {
        Self::new(
            &CacheConfig::default(),
            warm,
            clock,
            Arc::new(MarketStateBoard::new()),
            Arc::new(JsonChangeDetector::new()),
        )
    }

    /// `{namespace}:{strategy}:{cache_key}`
    pub fn storage_key(&self, strategy: CacheStrategy, cache_key: &str) -> String {
        format!("{}:{}:{}", self.namespace, strategy, cache_key)
    }

    #[instrument(
        skip(self, request),
        fields(key = %request.cache_key, strategy = %request.strategy)
    )]
    pub async fn fetch<T>(
        &self,
        request: OrchestratorRequest<T>,
    ) -> Result<OrchestratorResult<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let storage_key = self.storage_key(request.strategy, &request.cache_key);

        if !request.strategy.is_cached() {
            let data = self.call_fetch(&storage_key, &request.fetch).await?;
            return Ok(OrchestratorResult {
                data,
                hit: false,
                tier: None,
                ttl_remaining: None,
                dynamic_ttl: None,
                strategy: request.strategy,
                storage_key,
                timestamp: self.clock.now(),
                refresh: None,
            });
        }

        if let Some(result) = self.lookup(&request, &storage_key).await {
            return Ok(result);
        }

        if !self.single_flight {
            return self.fetch_and_store(&request, storage_key).await;
        }

        // Declared first so it drops last, after this caller's handle and turn.
        let _vacate = VacateFlight {
            flights: &self.flights,
            key: &storage_key,
        };
        let flight = self.flight(&storage_key);
        let _turn = flight.lock().await;
        // Whoever held the turn before us may have stored the value.
        match self.lookup(&request, &storage_key).await {
            Some(result) => Ok(result),
            None => self.fetch_and_store(&request, storage_key.clone()).await,
        }
    }

    /// Remove one key from both tiers. Returns whether a hot copy existed.
    pub async fn invalidate(&self, strategy: CacheStrategy, cache_key: &str) -> bool {
        let storage_key = self.storage_key(strategy, cache_key);
        self.writer.history().forget(&storage_key);
        self.writer.store().delete(&storage_key).await
    }

    /// Remove every storage key matching a glob `pattern`, e.g. `"md:*:AAPL"`.
    pub async fn clear(&self, pattern: &str) -> Result<ClearReport, CacheError> {
        self.writer.store().clear(pattern).await
    }

    /// Stop background refreshes, waiting up to `timeout` for running ones.
    pub async fn shutdown(&self, timeout: Duration) -> DrainReport {
        self.scheduler.drain_and_shutdown(timeout).await
    }

    pub fn store(&self) -> &Arc<TieredCacheStore> {
        self.writer.store()
    }

    pub fn scheduler(&self) -> &BackgroundRefreshScheduler {
        &self.scheduler
    }

    pub fn resolver(&self) -> &StrategyResolver {
        self.writer.resolver()
    }

    pub fn markets(&self) -> &Arc<MarketStateBoard> {
        self.writer.markets()
    }

    pub fn history(&self) -> &ChangeHistory {
        self.writer.history()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Serve a cached copy if there is a decodable one, scheduling a refresh
    /// when the entry is due.
    async fn lookup<T>(
        &self,
        request: &OrchestratorRequest<T>,
        storage_key: &str,
    ) -> Option<OrchestratorResult<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let hit = self.writer.store().get(storage_key).await?;
        let data = match hit.entry.decode::<T>() {
            Ok(data) => data,
            Err(err) => {
                warn!(key = storage_key, error = %err, "Cached value no longer decodes; treating as miss");
                self.writer.store().delete(storage_key).await;
                return None;
            }
        };

        let now = self.clock.now();
        let refresh = self
            .writer
            .resolver()
            .should_trigger_refresh(
                &hit.entry,
                request.strategy,
                now,
                self.scheduler.last_scheduled(storage_key),
            )
            .then(|| self.schedule_refresh(request, storage_key, hit.entry.clone()));

        debug!(
            key = storage_key,
            tier = hit.tier.as_str(),
            ?refresh,
            "Cache hit"
        );
        Some(OrchestratorResult {
            data,
            hit: true,
            tier: Some(hit.tier),
            ttl_remaining: Some(hit.entry.ttl_remaining(now)),
            dynamic_ttl: Some(hit.entry.ttl_seconds),
            strategy: request.strategy,
            storage_key: storage_key.to_owned(),
            timestamp: now,
            refresh,
        })
    }

    fn schedule_refresh<T>(
        &self,
        request: &OrchestratorRequest<T>,
        storage_key: &str,
        previous: CacheEntry,
    ) -> ScheduleOutcome
    where
        T: Serialize + Send + 'static,
    {
        self.scheduler.schedule(RefreshRequest {
            storage_key: storage_key.to_owned(),
            strategy: request.strategy,
            market: request.metadata.market.clone(),
            priority: request.metadata.priority,
            fetch: as_refresh_fn(Arc::clone(&request.fetch)),
            previous: Some(previous),
        })
    }

    async fn fetch_and_store<T>(
        &self,
        request: &OrchestratorRequest<T>,
        storage_key: String,
    ) -> Result<OrchestratorResult<T>, CacheError>
    where
        T: Serialize + Send + 'static,
    {
        let data = self.call_fetch(&storage_key, &request.fetch).await?;
        let value =
            serde_json::to_value(&data).map_err(|source| CacheError::Serialization {
                key: storage_key.clone(),
                source,
            })?;

        let target = WriteTarget {
            storage_key: &storage_key,
            strategy: request.strategy,
            market: request.metadata.market.as_deref(),
            priority: request.metadata.priority,
        };
        let ttl = match self.writer.commit(&target, &value, None, false).await {
            Ok(outcome) => {
                if let CommitOutcome::Stored { write, .. } = outcome {
                    debug!(key = %storage_key, ttl = outcome.ttl(), hot = write.hot, warm = write.warm, "Cache miss stored");
                }
                outcome.ttl()
            }
            Err(err) => {
                warn!(key = %storage_key, error = %err, "Fetched value could not be cached");
                self.writer
                    .dynamic_ttl(&storage_key, request.strategy, target.market)
            }
        };

        Ok(OrchestratorResult {
            data,
            hit: false,
            tier: None,
            ttl_remaining: Some(ttl),
            dynamic_ttl: Some(ttl),
            strategy: request.strategy,
            storage_key,
            timestamp: self.clock.now(),
            refresh: None,
        })
    }

    async fn call_fetch<T>(&self, storage_key: &str, fetch: &FetchFn<T>) -> Result<T, CacheError> {
        match tokio::time::timeout(self.fetch_timeout, fetch()).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(CacheError::Fetch(err)),
            Err(_) => Err(CacheError::FetchTimeout {
                key: storage_key.to_owned(),
                timeout: self.fetch_timeout,
            }),
        }
    }

    fn flight(&self, storage_key: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.flights
                .entry(storage_key.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        )
    }
}

/// Removes a key's single-flight slot once no caller holds it. Runs on drop,
/// so a cancelled fetch cleans up too.
struct VacateFlight<'a> {
    flights: &'a DashMap<String, Arc<AsyncMutex<()>>>,
    key: &'a str,
}

impl Drop for VacateFlight<'_> {
    fn drop(&mut self) {
        self.flights
            .remove_if(self.key, |_, flight| Arc::strong_count(flight) == 1);
    }
}

/// Adapt a typed fetch into the JSON-valued form the scheduler runs.
fn as_refresh_fn<T>(fetch: FetchFn<T>) -> RefreshFn
where
    T: Serialize + Send + 'static,
{
    Arc::new(move || {
        let pending = fetch();
        async move {
            let data = pending.await?;
            serde_json::to_value(&data).map_err(FetchError::new)
        }
        .boxed()
    })
}
