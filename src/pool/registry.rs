//! Key Registry
//!
//! Owns the ordered credential list and the enabled/disabled flag. Every other
//! per-credential map in the crate is addressed by this registry's positional
//! index, so deletions here must be followed by `remove_index` on the rate
//! limiter, selector and stats tracker (the engine facade drives that).

use crate::error::{KeypoolError, Result};
use crate::pool::key::{mask_key, AddOutcome, AggregationMode};
use crate::store::{keys, ConfigStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Whether a secret can travel as an `Authorization` header value. Printable
/// ASCII only (space allowed, so scheme-prefixed values like `Bearer ...`
/// work); anything else would fail header construction on every dispatch
/// that draws the key.
fn is_header_safe(secret: &str) -> bool {
    secret.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// How `add_keys` / `import` treat the existing list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddMode {
    /// Append to the end, preserving existing order and state
    Append,
    /// Replace the entire list; all ephemeral state is reset
    Override,
}

/// Why and when a credential was disabled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisabledMeta {
    pub reason: String,
    pub disabled_at: i64,
}

#[derive(Debug, Default)]
struct RegistryState {
    secrets: Vec<String>,
    disabled: BTreeSet<usize>,
    disabled_meta: HashMap<usize, DisabledMeta>,
    mode: AggregationMode,
    calls_per_rotation: u32,
}

/// Registry of upstream credentials
pub struct KeyRegistry {
    state: RwLock<RegistryState>,
    store: Arc<dyn ConfigStore>,
}

impl KeyRegistry {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                calls_per_rotation: 100,
                ..Default::default()
            }),
            store,
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub fn len(&self) -> usize {
        self.state.read().secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().secrets.is_empty()
    }

    /// The raw secret at `index`, for building the Authorization header
    pub fn secret(&self, index: usize) -> Option<String> {
        self.state.read().secrets.get(index).cloned()
    }

    /// Full secret list in pool order, for export and persistence
    pub fn secrets(&self) -> Vec<String> {
        self.state.read().secrets.clone()
    }

    /// Masked display form of the secret at `index`
    pub fn masked(&self, index: usize) -> Option<String> {
        self.state.read().secrets.get(index).map(|s| mask_key(s))
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        let state = self.state.read();
        index < state.secrets.len() && !state.disabled.contains(&index)
    }

    /// Indices of enabled credentials, in pool order
    pub fn enabled_indices(&self) -> Vec<usize> {
        let state = self.state.read();
        (0..state.secrets.len())
            .filter(|i| !state.disabled.contains(i))
            .collect()
    }

    /// Indices of disabled credentials, ascending
    pub fn disabled_indices(&self) -> Vec<usize> {
        self.state.read().disabled.iter().copied().collect()
    }

    pub fn disabled_meta(&self, index: usize) -> Option<DisabledMeta> {
        self.state.read().disabled_meta.get(&index).cloned()
    }

    pub fn aggregation_mode(&self) -> AggregationMode {
        self.state.read().mode
    }

    pub fn set_aggregation_mode(&self, mode: AggregationMode) {
        self.state.write().mode = mode;
        tracing::info!(mode = mode.as_str(), "aggregation mode set");
    }

    pub fn calls_per_rotation(&self) -> u32 {
        self.state.read().calls_per_rotation
    }

    /// Rejects values below 1
    pub fn set_calls_per_rotation(&self, calls: u32) -> bool {
        if calls < 1 {
            return false;
        }
        self.state.write().calls_per_rotation = calls;
        tracing::info!(calls, "calls per rotation set");
        true
    }

    /// Add credentials. Blank secrets are dropped; in append mode, secrets
    /// already present (or repeated within the batch) are skipped and reported
    /// back in masked form. Override mode replaces the whole list and fails on
    /// an effectively empty input; resetting the other components' ephemeral
    /// state is the engine's responsibility.
    ///
    /// Every secret must be usable as an HTTP `Authorization` header value;
    /// a secret that is not (control characters, non-ASCII bytes) rejects the
    /// whole batch here rather than failing every dispatch that draws it.
    pub fn add_keys(&self, secrets: &[String], mode: AddMode) -> Result<AddOutcome> {
        let cleaned: Vec<String> = secrets
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let rejected: Vec<String> = cleaned
            .iter()
            .filter(|s| !is_header_safe(s))
            .map(|s| mask_key(s))
            .collect();
        if !rejected.is_empty() {
            return Err(KeypoolError::Config(format!(
                "keys not usable as header values: {}",
                rejected.join(", ")
            )));
        }

        let mut state = self.state.write();
        let mut added = Vec::new();
        let mut duplicates = Vec::new();

        match mode {
            AddMode::Override => {
                for secret in cleaned {
                    if added.contains(&secret) {
                        duplicates.push(mask_key(&secret));
                    } else {
                        added.push(secret);
                    }
                }
                if added.is_empty() {
                    return Err(KeypoolError::Config(
                        "override import requires a non-empty key list".to_string(),
                    ));
                }
                let count = added.len();
                state.secrets = added;
                state.disabled.clear();
                state.disabled_meta.clear();
                tracing::info!(count, "replaced all keys");
                Ok(AddOutcome {
                    added: count,
                    duplicates,
                })
            }
            AddMode::Append => {
                for secret in cleaned {
                    if state.secrets.contains(&secret) || added.contains(&secret) {
                        duplicates.push(mask_key(&secret));
                    } else {
                        added.push(secret);
                    }
                }
                let count = added.len();
                state.secrets.extend(added);
                tracing::info!(
                    appended = count,
                    skipped = duplicates.len(),
                    total = state.secrets.len(),
                    "appended keys"
                );
                Ok(AddOutcome {
                    added: count,
                    duplicates,
                })
            }
        }
    }

    /// Toggle a credential's enabled flag. Out-of-range indices are a no-op
    /// failure. Enabling clears the recorded disable reason and time;
    /// disabling records reason "manual" and the current time.
    pub fn update_status(&self, index: usize, enabled: bool) -> bool {
        let mut state = self.state.write();
        if index >= state.secrets.len() {
            return false;
        }

        if enabled {
            state.disabled.remove(&index);
            state.disabled_meta.remove(&index);
        } else {
            state.disabled.insert(index);
            state.disabled_meta.insert(
                index,
                DisabledMeta {
                    reason: "manual".to_string(),
                    disabled_at: Self::now(),
                },
            );
        }
        tracing::info!(index, enabled, "key status updated");
        true
    }

    /// Apply `update_status` to each valid index; true when any applied
    pub fn batch_update_status(&self, indices: &[usize], enabled: bool) -> bool {
        let mut state = self.state.write();
        let mut applied = 0;
        for &index in indices {
            if index >= state.secrets.len() {
                continue;
            }
            if enabled {
                state.disabled.remove(&index);
                state.disabled_meta.remove(&index);
            } else {
                state.disabled.insert(index);
                state.disabled_meta.insert(
                    index,
                    DisabledMeta {
                        reason: "manual".to_string(),
                        disabled_at: Self::now(),
                    },
                );
            }
            applied += 1;
        }
        tracing::info!(applied, enabled, "batch key status update");
        applied > 0
    }

    /// Remove the credential at `index`, shifting the disabled set and meta
    /// map down past it. Fails on out-of-range indices. The engine must follow
    /// up with `remove_index` on every dependent component.
    pub fn delete_key(&self, index: usize) -> bool {
        let mut state = self.state.write();
        if index >= state.secrets.len() {
            return false;
        }

        state.secrets.remove(index);

        let shifted: BTreeSet<usize> = state
            .disabled
            .iter()
            .filter(|&&i| i != index)
            .map(|&i| if i > index { i - 1 } else { i })
            .collect();
        state.disabled = shifted;

        let old_meta = std::mem::take(&mut state.disabled_meta);
        for (i, meta) in old_meta {
            if i < index {
                state.disabled_meta.insert(i, meta);
            } else if i > index {
                state.disabled_meta.insert(i - 1, meta);
            }
        }

        tracing::info!(index, remaining = state.secrets.len(), "deleted key");
        true
    }

    /// Restore disabled indices from an import blob, dropping out-of-range
    /// entries.
    pub fn restore_disabled(&self, indices: &[usize]) {
        let mut state = self.state.write();
        let len = state.secrets.len();
        let disabled: BTreeSet<usize> = indices.iter().copied().filter(|&i| i < len).collect();
        state.disabled_meta.retain(|i, _| disabled.contains(i));
        state.disabled = disabled;
    }

    /// Load persisted registry config. Absent keys fall back to defaults; the
    /// persisted key list may be either a JSON array or a comma-separated
    /// string. Store read failures propagate.
    pub async fn load(&self) -> Result<()> {
        let secrets = match self.store.get(keys::API_KEYS).await? {
            Some(Value::String(s)) => s
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            Some(value) => serde_json::from_value::<Vec<String>>(value)
                .map_err(|e| KeypoolError::Storage(format!("invalid key list: {}", e)))?,
            None => Vec::new(),
        };

        let disabled: BTreeSet<usize> = match self.store.get(keys::DISABLED_INDICES).await? {
            Some(value) => serde_json::from_value::<Vec<usize>>(value)
                .unwrap_or_default()
                .into_iter()
                .filter(|&i| i < secrets.len())
                .collect(),
            None => BTreeSet::new(),
        };

        let disabled_meta: HashMap<usize, DisabledMeta> =
            match self.store.get(keys::DISABLED_META).await? {
                Some(value) => serde_json::from_value(value).unwrap_or_default(),
                None => HashMap::new(),
            };

        let mode = match self.store.get(keys::AGGREGATION_MODE).await? {
            Some(Value::String(s)) => AggregationMode::parse_lossy(&s),
            _ => AggregationMode::default(),
        };

        let calls_per_rotation = match self.store.get(keys::CALLS_PER_ROTATION).await? {
            Some(value) => value.as_u64().map(|v| v as u32).filter(|&v| v >= 1).unwrap_or(100),
            None => 100,
        };

        let mut state = self.state.write();
        tracing::debug!(
            keys = secrets.len(),
            disabled = disabled.len(),
            "loaded key registry"
        );
        state.secrets = secrets;
        state.disabled_meta = disabled_meta
            .into_iter()
            .filter(|(i, _)| disabled.contains(i))
            .collect();
        state.disabled = disabled;
        state.mode = mode;
        state.calls_per_rotation = calls_per_rotation;
        Ok(())
    }

    /// Persist the registry config to the store
    pub async fn save(&self) -> Result<()> {
        let (secrets, disabled, meta, mode, calls) = {
            let state = self.state.read();
            (
                state.secrets.clone(),
                state.disabled.iter().copied().collect::<Vec<usize>>(),
                state.disabled_meta.clone(),
                state.mode,
                state.calls_per_rotation,
            )
        };

        self.store
            .set(keys::API_KEYS, serde_json::to_value(secrets)?)
            .await?;
        self.store
            .set(keys::DISABLED_INDICES, serde_json::to_value(disabled)?)
            .await?;
        self.store
            .set(keys::DISABLED_META, serde_json::to_value(meta)?)
            .await?;
        self.store
            .set(
                keys::AGGREGATION_MODE,
                Value::String(mode.as_str().to_string()),
            )
            .await?;
        self.store
            .set(keys::CALLS_PER_ROTATION, serde_json::to_value(calls)?)
            .await?;
        tracing::debug!("key registry saved");
        Ok(())
    }
}
