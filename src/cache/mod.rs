//! Strategy-driven two-tier cache for market data.
//!
//! - **Hot tier**: bounded in-process map, evicting the least-read entry
//! - **Warm tier**: remote key-value store holding the backing copy
//! - **Strategies**: per-request policy deciding TTL and when to refresh
//! - **Scheduler**: bounded background refresh, one task per key
//!
//! [`CacheOrchestrator`] is the entry point:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tickvault::cache::*;
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let warm = Arc::new(MemoryWarmTier::new(clock.clone()));
//! let cache = CacheOrchestrator::with_defaults(warm, clock)?;
//!
//! let quote = cache
//!     .fetch(
//!         OrchestratorRequest::new("quote:AAPL", CacheStrategy::MarketAware, || async {
//!             Ok(serde_json::json!({"px": 187.25}))
//!         })
//!         .with_market("US"),
//!     )
//!     .await?;
//! println!("hit={} ttl={:?}", quote.hit, quote.ttl_remaining);
//! # Ok(())
//! # }
//! ```

mod adaptive;
mod clock;
mod codec;
mod config;
mod entry;
mod error;
mod hot;
mod lock;
mod market;
mod orchestrator;
mod scheduler;
mod store;
mod strategy;
mod warm;
mod writer;

pub use adaptive::{ChangeDetector, ChangeHistory, JsonChangeDetector};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CompressionPolicy, EncodedPayload, compress, decompress, decode_payload, encode_payload};
pub use config::CacheConfig;
pub use entry::{CacheEntry, MAX_TTL_SECONDS};
pub use error::{
    CacheConfigError, CacheError, CodecError, FetchError, StrategyConfigError, WarmTierError,
};
pub use hot::HotTier;
pub use market::{MarketState, MarketStateBoard, MarketStateSource, spawn_poller};
pub use orchestrator::{
    CacheOrchestrator, FetchFn, OrchestratorRequest, OrchestratorResult, RequestMetadata,
};
pub use scheduler::{
    BackgroundRefreshScheduler, BackgroundTask, DrainReport, RefreshFn, RefreshRequest,
    ScheduleOutcome, SchedulerStats, TaskStatus,
};
pub use store::{CacheHit, ClearReport, StorePriority, StoreWrite, Tier, TieredCacheStore};
pub use strategy::{
    CacheStrategy, ResolveContext, StrategyConfig, StrategyResolver, StrategyTable, resolve_ttl,
    should_trigger_refresh,
};
pub use warm::{DisabledWarmTier, MemoryWarmTier, RedisWarmTier, WarmTier};
pub use writer::{CacheWriter, CommitOutcome, WriteTarget};
