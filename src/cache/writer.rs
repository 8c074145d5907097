//! Shared write path for miss fetches and background refreshes.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::adaptive::{ChangeDetector, ChangeHistory};
use super::entry::CacheEntry;
use super::error::CodecError;
use super::market::MarketStateBoard;
use super::store::{StorePriority, StoreWrite, TieredCacheStore};
use super::strategy::{CacheStrategy, ResolveContext, StrategyResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Stored { ttl: u64, write: StoreWrite },
    /// The change detector saw no meaningful change, so the previous payload
    /// was kept and only its expiry was pushed out.
    Unchanged { ttl: u64, write: StoreWrite },
}

impl CommitOutcome {
    pub fn ttl(&self) -> u64 {
        match self {
            Self::Stored { ttl, .. } | Self::Unchanged { ttl, .. } => *ttl,
        }
    }

    pub fn write(&self) -> StoreWrite {
        match self {
            Self::Stored { write, .. } | Self::Unchanged { write, .. } => *write,
        }
    }
}

/// Where and how a value is written.
#[derive(Debug, Clone, Copy)]
pub struct WriteTarget<'a> {
    pub storage_key: &'a str,
    pub strategy: CacheStrategy,
    pub market: Option<&'a str>,
    pub priority: StorePriority,
}

pub struct CacheWriter {
    store: Arc<TieredCacheStore>,
    resolver: StrategyResolver,
    markets: Arc<MarketStateBoard>,
    history: ChangeHistory,
    detector: Arc<dyn ChangeDetector>,
}

impl CacheWriter {
    pub fn new(
        store: Arc<TieredCacheStore>,
        resolver: StrategyResolver,
        markets: Arc<MarketStateBoard>,
        history: ChangeHistory,
        detector: Arc<dyn ChangeDetector>,
    ) -> Self {
        Self {
            store,
            resolver,
            markets,
            history,
            detector,
        }
    }

    pub fn store(&self) -> &Arc<TieredCacheStore> {
        &self.store
    }

    pub fn resolver(&self) -> &StrategyResolver {
        &self.resolver
    }

    pub fn markets(&self) -> &Arc<MarketStateBoard> {
        &self.markets
    }

    pub fn history(&self) -> &ChangeHistory {
        &self.history
    }

    pub fn resolve_context(&self, storage_key: &str, market: Option<&str>) -> ResolveContext {
        ResolveContext {
            market_open: market.and_then(|market| self.markets.is_open(market)),
            change_frequency: self.history.change_frequency(storage_key),
        }
    }

    /// TTL a value stored right now under `strategy` would get.
    pub fn dynamic_ttl(
        &self,
        storage_key: &str,
        strategy: CacheStrategy,
        market: Option<&str>,
    ) -> u64 {
        let ctx = self.resolve_context(storage_key, market);
        self.resolver.resolve_ttl(strategy, &ctx)
    }

    /// Record a change observation against `previous`, then store `value`
    /// with the resulting TTL.
    ///
    /// With `skip_if_unchanged`, a value the detector considers identical to
    /// `previous` is not re-encoded: `previous`'s bytes are stored again
    /// under the new TTL.
    pub async fn commit(
        &self,
        target: &WriteTarget<'_>,
        value: &Value,
        previous: Option<&CacheEntry>,
        skip_if_unchanged: bool,
    ) -> Result<CommitOutcome, CodecError> {
        let storage_key = target.storage_key;
        let changed = previous.map(|entry| match entry.decode::<Value>() {
            Ok(old) => self.detector.has_changed(&old, value),
            Err(_) => true,
        });
        if let Some(changed) = changed {
            self.history.record(storage_key, changed);
        }

        let ttl = self.dynamic_ttl(storage_key, target.strategy, target.market);
        let unchanged = previous.filter(|_| skip_if_unchanged && changed == Some(false));
        if let Some(previous) = unchanged {
            debug!(key = storage_key, ttl, "Value unchanged; renewing existing payload");
            let write = self
                .store
                .renew(storage_key, previous, value, ttl, target.priority)
                .await?;
            return Ok(CommitOutcome::Unchanged { ttl, write });
        }

        let write = self
            .store
            .set(storage_key, value, ttl, target.priority)
            .await?;
        Ok(CommitOutcome::Stored { ttl, write })
    }
}
