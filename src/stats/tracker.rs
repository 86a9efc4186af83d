//! Usage Statistics
//!
//! Per-credential success/failure counts with per-model breakdowns.
//! Persistence is debounced: a dirty flag plus a minimum interval between
//! writes, with `flush(true)` for deterministic saves. The engine runs the
//! background flush loop; this type never spawns tasks of its own.

use crate::error::{KeypoolError, Result};
use crate::limiter::RateLimitSnapshot;
use crate::pool::key::CredentialView;
use crate::store::{keys, ConfigStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Success/failure split for one model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCount {
    pub ok: u64,
    pub fail: u64,
}

/// Persisted per-credential counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyStatsSnapshot {
    #[serde(default)]
    pub masked_key: String,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub model_counts: HashMap<String, ModelCount>,
    /// Unix timestamp of the last recorded call, 0 when never called
    #[serde(default)]
    pub last_call_at: i64,
}

/// One credential's row in a stats report
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatsEntry {
    pub index: usize,
    pub masked_key: String,
    pub enabled: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub model_counts: HashMap<String, ModelCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_call_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSnapshot>,
}

/// Aggregate stats view for the admin layer. Totals always equal the sum over
/// the returned per-credential entries, zero-call credentials included.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub total_keys: usize,
    pub active_keys: usize,
    pub disabled_keys: usize,
    pub total_success: u64,
    pub total_failure: u64,
    pub total_calls: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<Vec<KeyStatsEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<Vec<KeyStatsEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<KeyStatsEntry>>,
}

/// Records call outcomes per credential
pub struct StatsTracker {
    stats: RwLock<HashMap<usize, KeyStatsSnapshot>>,
    store: Arc<dyn ConfigStore>,
    dirty: AtomicBool,
    last_save: Mutex<Option<Instant>>,
    save_interval: Duration,
}

impl StatsTracker {
    pub fn new(store: Arc<dyn ConfigStore>, save_interval: Duration) -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
            store,
            dirty: AtomicBool::new(false),
            last_save: Mutex::new(None),
            save_interval,
        }
    }

    /// Record one call outcome. Creates the entry lazily on first use.
    pub fn record_call(&self, index: usize, success: bool, model: &str, masked_key: &str) {
        let mut stats = self.stats.write();
        let entry = stats.entry(index).or_default();

        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }

        let model_entry = entry.model_counts.entry(model.to_string()).or_default();
        if success {
            model_entry.ok += 1;
        } else {
            model_entry.fail += 1;
        }

        entry.last_call_at = chrono::Utc::now().timestamp();
        if !masked_key.is_empty() {
            entry.masked_key = masked_key.to_string();
        }
        drop(stats);

        self.dirty.store(true, Ordering::Relaxed);
        tracing::debug!(index, success, model, "recorded call");
    }

    /// Raw counters for one credential, if any call was ever recorded
    pub fn get(&self, index: usize) -> Option<KeyStatsSnapshot> {
        self.stats.read().get(&index).cloned()
    }

    /// Total recorded calls for one credential
    pub fn call_total(&self, index: usize) -> u64 {
        self.stats
            .read()
            .get(&index)
            .map(|s| s.success_count + s.failure_count)
            .unwrap_or(0)
    }

    /// Build the aggregate report over the given credentials. With grouping,
    /// enabled credentials are listed first in their own bucket.
    pub fn get_all_stats(
        &self,
        credentials: &[CredentialView],
        rate_limits: &HashMap<usize, RateLimitSnapshot>,
        group_by_status: bool,
    ) -> StatsReport {
        let stats = self.stats.read();

        let entry_for = |cred: &CredentialView| -> KeyStatsEntry {
            let recorded = stats.get(&cred.index);
            KeyStatsEntry {
                index: cred.index,
                masked_key: cred.masked_key.clone(),
                enabled: cred.enabled,
                success_count: recorded.map(|s| s.success_count).unwrap_or(0),
                failure_count: recorded.map(|s| s.failure_count).unwrap_or(0),
                model_counts: recorded.map(|s| s.model_counts.clone()).unwrap_or_default(),
                last_call_at: recorded.and_then(|s| {
                    if s.last_call_at > 0 {
                        Some(s.last_call_at)
                    } else {
                        None
                    }
                }),
                rate_limit: rate_limits.get(&cred.index).cloned(),
            }
        };

        let mut enabled = Vec::new();
        let mut disabled = Vec::new();
        for cred in credentials {
            if cred.enabled {
                enabled.push(entry_for(cred));
            } else {
                disabled.push(entry_for(cred));
            }
        }

        let total_success: u64 = enabled
            .iter()
            .chain(disabled.iter())
            .map(|e| e.success_count)
            .sum();
        let total_failure: u64 = enabled
            .iter()
            .chain(disabled.iter())
            .map(|e| e.failure_count)
            .sum();

        let mut report = StatsReport {
            total_keys: credentials.len(),
            active_keys: enabled.len(),
            disabled_keys: disabled.len(),
            total_success,
            total_failure,
            total_calls: total_success + total_failure,
            enabled: None,
            disabled: None,
            keys: None,
        };

        if group_by_status {
            report.enabled = Some(enabled);
            report.disabled = Some(disabled);
        } else {
            enabled.extend(disabled);
            enabled.sort_by_key(|e| e.index);
            report.keys = Some(enabled);
        }
        report
    }

    /// Zero counters for one credential, or for all when `index` is `None`.
    /// The masked label survives the reset.
    pub fn reset(&self, index: Option<usize>) {
        let mut stats = self.stats.write();
        match index {
            Some(idx) => {
                if let Some(entry) = stats.get_mut(&idx) {
                    let masked = std::mem::take(&mut entry.masked_key);
                    *entry = KeyStatsSnapshot {
                        masked_key: masked,
                        ..Default::default()
                    };
                    tracing::info!(index = idx, "reset key stats");
                }
            }
            None => {
                for entry in stats.values_mut() {
                    let masked = std::mem::take(&mut entry.masked_key);
                    *entry = KeyStatsSnapshot {
                        masked_key: masked,
                        ..Default::default()
                    };
                }
                tracing::info!("reset all key stats");
            }
        }
        drop(stats);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Delete every entry whose index is not in `active_indices`; called after
    /// registry deletions and imports so orphaned entries cannot accumulate.
    pub fn cleanup_inactive(&self, active_indices: &[usize]) {
        let mut stats = self.stats.write();
        let before = stats.len();
        stats.retain(|idx, _| active_indices.contains(idx));
        let removed = before - stats.len();
        drop(stats);

        if removed > 0 {
            self.dirty.store(true, Ordering::Relaxed);
            tracing::info!(removed, "cleaned up stats for inactive keys");
        }
    }

    /// Shift stats after a registry deletion: drop `index`, move everything
    /// above it down by one. No entry is lost or duplicated.
    pub fn remove_index(&self, index: usize) {
        let mut stats = self.stats.write();
        let old = std::mem::take(&mut *stats);
        for (idx, entry) in old {
            if idx < index {
                stats.insert(idx, entry);
            } else if idx > index {
                stats.insert(idx - 1, entry);
            }
        }
        drop(stats);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Snapshot of every credential's counters
    pub fn snapshot_all(&self) -> HashMap<usize, KeyStatsSnapshot> {
        self.stats.read().clone()
    }

    /// Replace all counters from persisted snapshots
    pub fn restore(&self, snapshots: HashMap<usize, KeyStatsSnapshot>) {
        *self.stats.write() = snapshots;
    }

    /// Restore a single credential's counters, used by import
    pub fn restore_one(&self, index: usize, snapshot: KeyStatsSnapshot) {
        self.stats.write().insert(index, snapshot);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Drop every entry (override import)
    pub fn reset_all(&self) {
        self.stats.write().clear();
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Load persisted counters. Absent key means a cold start; a failed read
    /// propagates so the caller can tell the difference.
    pub async fn load(&self) -> Result<()> {
        match self.store.get(keys::KEY_STATS).await? {
            Some(value) => {
                let snapshots: HashMap<usize, KeyStatsSnapshot> = serde_json::from_value(value)
                    .map_err(|e| KeypoolError::Storage(format!("invalid stats blob: {}", e)))?;
                let count = snapshots.len();
                self.restore(snapshots);
                tracing::debug!(count, "loaded key stats");
            }
            None => tracing::debug!("no persisted key stats"),
        }
        Ok(())
    }

    /// Persist counters if dirty and the debounce interval elapsed, or
    /// unconditionally with `force`.
    pub async fn flush(&self, force: bool) -> Result<()> {
        if !force {
            if !self.dirty.load(Ordering::Relaxed) {
                return Ok(());
            }
            let mut last = self.last_save.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.save_interval {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        } else {
            *self.last_save.lock() = Some(Instant::now());
        }

        let snapshot = self.snapshot_all();
        self.dirty.store(false, Ordering::Relaxed);
        let value = serde_json::to_value(&snapshot)?;
        self.store.set(keys::KEY_STATS, value).await?;
        tracing::debug!(count = snapshot.len(), "saved key stats");
        Ok(())
    }
}
