//! Store Module
//!
//! Async key-value store abstraction used for crash-recovery persistence of
//! the credential list, disabled indices, aggregation mode, rotation threshold
//! and per-credential ephemeral state.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use serde_json::Value;

/// Async key-value configuration store.
///
/// Values are arbitrary JSON documents. `get` returns `Ok(None)` when the key
/// is absent and `Err` when the read itself failed, so callers can tell
/// "defaulted because missing" apart from "defaulted because broken".
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Storage keys used by the engine.
pub mod keys {
    pub const API_KEYS: &str = "api_keys";
    pub const DISABLED_INDICES: &str = "disabled_key_indices";
    pub const DISABLED_META: &str = "disabled_key_meta";
    pub const AGGREGATION_MODE: &str = "key_aggregation_mode";
    pub const CALLS_PER_ROTATION: &str = "calls_per_rotation";
    pub const RATE_LIMITS: &str = "rate_limit_info";
    pub const KEY_STATS: &str = "key_stats";
}
