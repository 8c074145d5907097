//! Small formatting helpers shared by the command-line surface.

pub mod units;
