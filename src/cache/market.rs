//! Market session signal for `MarketAware` TTLs.
//!
//! The board is written by a poller on its own interval and read on every
//! request; requests never trigger a poll.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketState {
    Open,
    Closed,
}

impl MarketState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

/// Latest known session state per market code (e.g. `"US"`, `"HK"`).
#[derive(Debug, Default)]
pub struct MarketStateBoard {
    states: DashMap<String, MarketState>,
}

impl MarketStateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, market: impl Into<String>, state: MarketState) {
        self.states.insert(market.into(), state);
    }

    pub fn get(&self, market: &str) -> Option<MarketState> {
        self.states.get(market).map(|state| *state)
    }

    /// `None` when the market has never been reported.
    pub fn is_open(&self, market: &str) -> Option<bool> {
        self.get(market).map(MarketState::is_open)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Where market session states come from.
#[async_trait]
pub trait MarketStateSource: Send + Sync {
    async fn poll(&self) -> Result<Vec<(String, MarketState)>, FetchError>;
}

/// Refresh `board` from `source` every `interval` until `shutdown` fires.
///
/// The first poll runs immediately. A failed poll keeps the previous states.
pub fn spawn_poller(
    board: Arc<MarketStateBoard>,
    source: Arc<dyn MarketStateSource>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Market state poller stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match source.poll().await {
                        Ok(states) => {
                            debug!(markets = states.len(), "Polled market states");
                            for (market, state) in states {
                                board.set(market, state);
                            }
                        }
                        Err(err) => warn!(error = %err, "Market state poll failed; keeping previous states"),
                    }
                }
            }
        }
    })
}
