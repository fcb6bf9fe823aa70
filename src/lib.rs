//! Automated ladder market maker for a derivatives exchange.
//!
//! A streaming session mirrors the exchange's keyed tables into an
//! in-memory store; a driver loop recomputes a symmetric ladder of
//! resting orders around the current spread every tick and converges the
//! book onto it with the fewest possible exchange operations. All
//! exposure is unwound on shutdown.

pub mod config;
pub mod error;
pub mod exchange;
pub mod quoting;
pub mod store;
pub mod telemetry;
