//! tickvault: strategy-driven tiered caching for market-data serving.
//!
//! The [`cache`] module holds the caching core; [`config`] resolves layered
//! settings and [`infra`] wires telemetry and warm-tier backends.

pub mod cache;
pub mod config;
pub mod infra;
pub mod util;
