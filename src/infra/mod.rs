//! Runtime bootstrap: telemetry and warm-tier backend wiring.

pub mod error;
pub mod telemetry;
pub mod warm;
