//! Credential Model
//!
//! Data types shared across the pool: credential status, aggregation mode,
//! secret masking and the import/export blob.

use crate::limiter::RateLimitSnapshot;
use crate::stats::KeyStatsSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Derived status of a credential. Never stored independently; computed from
/// the enabled flag, the rate limit window and the recorded call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Enabled and has recorded calls
    Active,
    /// Manually disabled
    Disabled,
    /// Rate limit window has no remaining quota
    Exhausted,
    /// Enabled but never used
    Unused,
    /// Rejected by the upstream (auth failure, banned)
    Invalid,
}

/// Strategy for spreading calls across the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Rotate through eligible credentials sequentially
    #[default]
    RoundRobin,
    /// Draw uniformly from the eligible set
    Random,
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMode::RoundRobin => "round_robin",
            AggregationMode::Random => "random",
        }
    }

    /// Parse a persisted mode string, falling back to round robin for
    /// anything unrecognized.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "random" => AggregationMode::Random,
            _ => AggregationMode::RoundRobin,
        }
    }
}

/// Redacted display form of a secret, safe for logs and UI.
///
/// Secrets longer than 8 characters keep the first and last 4 characters;
/// shorter ones keep the first 2. Counted in characters, not bytes, so a
/// secret with multi-byte content masks cleanly instead of panicking on a
/// char boundary.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 8 {
        let prefix: String = chars.iter().take(2).collect();
        format!("{}***", prefix)
    } else {
        let prefix: String = chars[..4].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    }
}

/// Admin-facing view of one credential with derived status
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub index: usize,
    pub masked_key: String,
    pub enabled: bool,
    pub status: KeyStatus,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_in_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_call_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_time: Option<i64>,
}

/// Result of an add/import operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// How many secrets were actually added
    pub added: usize,
    /// Masked forms of the secrets skipped as duplicates
    pub duplicates: Vec<String>,
}

/// Per-credential ephemeral state carried by [`KeyExport`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedKeyState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<KeyStatsSnapshot>,
}

/// Full export of the pool, suitable for backup and re-import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExport {
    pub keys: Vec<String>,
    #[serde(default)]
    pub disabled_indices: Vec<usize>,
    #[serde(default)]
    pub aggregation_mode: AggregationMode,
    #[serde(default = "default_calls_per_rotation")]
    pub calls_per_rotation: u32,
    #[serde(default)]
    pub key_states: HashMap<usize, PersistedKeyState>,
}

pub(crate) fn default_calls_per_rotation() -> u32 {
    100
}
