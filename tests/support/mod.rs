#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tickvault::cache::{
    BackgroundRefreshScheduler, CacheConfig, CacheOrchestrator, Clock, FetchError,
    JsonChangeDetector, ManualClock, MarketStateBoard, MemoryWarmTier, OrchestratorRequest,
    WarmTier,
};
use time::macros::datetime;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub markets: Arc<MarketStateBoard>,
    pub cache: CacheOrchestrator,
}

pub fn harness(config: CacheConfig, warm: impl FnOnce(Arc<dyn Clock>) -> Arc<dyn WarmTier>) -> Harness {
    let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 14:30 UTC)));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let markets = Arc::new(MarketStateBoard::new());
    let cache = CacheOrchestrator::new(
        &config,
        warm(dyn_clock.clone()),
        dyn_clock,
        markets.clone(),
        Arc::new(JsonChangeDetector::new()),
    )
    .expect("valid cache config");

    Harness {
        clock,
        markets,
        cache,
    }
}

pub fn memory_warm(clock: Arc<dyn Clock>) -> Arc<dyn WarmTier> {
    Arc::new(MemoryWarmTier::new(clock))
}

/// Request whose fetch returns `{"px": n}` where `n` counts prior calls.
pub fn counting_request(
    key: &str,
    strategy: tickvault::cache::CacheStrategy,
    calls: &Arc<AtomicUsize>,
) -> OrchestratorRequest<Value> {
    let calls = Arc::clone(calls);
    OrchestratorRequest::new(key, strategy, move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, FetchError>(json!({ "px": n })) }
    })
}

pub async fn settle(scheduler: &BackgroundRefreshScheduler) {
    for _ in 0..400 {
        if scheduler.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("background refreshes did not settle");
}
