//! Stats Module
//!
//! Per-credential usage counters with debounced persistence.

pub mod tracker;

pub use tracker::{KeyStatsEntry, KeyStatsSnapshot, ModelCount, StatsReport, StatsTracker};
