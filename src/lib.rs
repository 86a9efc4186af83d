//! keypool - Key-pool dispatch engine for LLM API gateways
//!
//! Owns a pool of upstream credentials, decides which credential serves each
//! outgoing request, tracks per-credential rate limit and failure state, and
//! retries against a different credential when the first choice is rejected.
//!
//! Everything hangs off [`KeyPoolEngine`], which is built explicitly at
//! startup from an async [`store::ConfigStore`] and an [`EngineConfig`];
//! there are no process-wide singletons. The HTTP front end, response
//! translation and admin UI are the embedder's concern.

use std::collections::HashMap;
use std::sync::Arc;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod pool;
pub mod stats;
pub mod store;

pub use config::EngineConfig;
pub use dispatch::{Dispatcher, UpstreamResponse};
pub use error::{KeypoolError, Result};
pub use limiter::{RateLimitSnapshot, RateLimiter};
pub use pool::{
    mask_key, AddMode, AddOutcome, AggregationMode, CredentialView, KeyExport, KeyRegistry,
    KeySelector, KeyStatus, PersistedKeyState,
};
pub use stats::{StatsReport, StatsTracker};
pub use store::{ConfigStore, MemoryStore};

use serde_json::Value;

/// The dispatch engine: credential registry, rate limiter, selector, stats
/// and dispatcher wired together behind the surface the admin/HTTP layer
/// consumes.
pub struct KeyPoolEngine {
    registry: Arc<KeyRegistry>,
    limiter: Arc<RateLimiter>,
    selector: Arc<KeySelector>,
    stats: Arc<StatsTracker>,
    dispatcher: Dispatcher,
    config: EngineConfig,
}

impl KeyPoolEngine {
    /// Build the engine and reload all persisted state from the store.
    /// Absent keys fall back to defaults; store read failures propagate so
    /// the caller can tell a cold start from a broken store.
    pub async fn load(store: Arc<dyn ConfigStore>, config: EngineConfig) -> Result<Self> {
        let registry = Arc::new(KeyRegistry::new(store.clone()));
        let limiter = Arc::new(RateLimiter::new(store.clone(), config.save_interval));
        let selector = Arc::new(KeySelector::with_failure_timeout(config.failure_timeout));
        let stats = Arc::new(StatsTracker::new(store.clone(), config.save_interval));

        registry.load().await?;
        limiter.load().await?;
        stats.load().await?;

        // Drop stats that survived a deletion the process never saw.
        let active: Vec<usize> = (0..registry.len()).collect();
        stats.cleanup_inactive(&active);

        let dispatcher = Dispatcher::new(
            registry.clone(),
            limiter.clone(),
            selector.clone(),
            stats.clone(),
            &config,
        )?;

        tracing::info!(
            keys = registry.len(),
            enabled = registry.enabled_indices().len(),
            "key pool engine loaded"
        );

        Ok(Self {
            registry,
            limiter,
            selector,
            stats,
            dispatcher,
            config,
        })
    }

    /// Execute one outbound call over the pool
    pub async fn dispatch(&self, model: &str, body: &Value) -> Result<UpstreamResponse> {
        self.dispatcher.dispatch(model, body).await
    }

    /// Add credentials. Override mode replaces the list and resets every
    /// piece of ephemeral state; append preserves both and reports skipped
    /// duplicates.
    pub async fn add_keys(&self, secrets: &[String], mode: AddMode) -> Result<AddOutcome> {
        let outcome = self.registry.add_keys(secrets, mode)?;
        if mode == AddMode::Override {
            self.limiter.reset_all();
            self.selector.reset_all();
            self.stats.reset_all();
        }
        self.registry.save().await?;
        self.flush(true).await?;
        Ok(outcome)
    }

    /// Toggle one credential. Returns false for out-of-range indices.
    pub async fn update_status(&self, index: usize, enabled: bool) -> bool {
        if !self.registry.update_status(index, enabled) {
            return false;
        }
        self.persist_registry().await;
        true
    }

    /// Toggle a batch of credentials; true when any index applied
    pub async fn batch_update_status(&self, indices: &[usize], enabled: bool) -> bool {
        if !self.registry.batch_update_status(indices, enabled) {
            return false;
        }
        self.persist_registry().await;
        true
    }

    /// Remove one credential and shift every dependent per-credential map
    /// down past it, so state never attaches to the wrong key.
    pub async fn delete_key(&self, index: usize) -> bool {
        if !self.registry.delete_key(index) {
            return false;
        }
        self.limiter.remove_index(index);
        self.selector.remove_index(index);
        self.stats.remove_index(index);

        let active: Vec<usize> = (0..self.registry.len()).collect();
        self.stats.cleanup_inactive(&active);

        self.persist_registry().await;
        if let Err(e) = self.flush(true).await {
            tracing::error!(error = %e, "failed to persist state after key deletion");
        }
        true
    }

    /// Full pool export: secrets, disabled set, mode, rotation threshold and
    /// per-credential ephemeral state.
    pub fn export(&self) -> KeyExport {
        let rate_limits = self.limiter.snapshot_all();
        let stat_snaps = self.stats.snapshot_all();

        let mut key_states: HashMap<usize, PersistedKeyState> = HashMap::new();
        for (idx, snap) in rate_limits {
            key_states.entry(idx).or_default().rate_limit = Some(snap);
        }
        for (idx, snap) in stat_snaps {
            key_states.entry(idx).or_default().stats = Some(snap);
        }

        KeyExport {
            keys: self.registry.secrets(),
            disabled_indices: self.registry.disabled_indices(),
            aggregation_mode: self.registry.aggregation_mode(),
            calls_per_rotation: self.registry.calls_per_rotation(),
            key_states,
        }
    }

    /// Import a previously exported blob. The blob is validated before any
    /// mutation. Override mode restores the disabled set, the aggregation
    /// mode, the rotation threshold and every carried per-credential state.
    /// Append mode restores carried state only for keys that are new to the
    /// pool, at their appended indices; keys skipped as duplicates keep their
    /// live counters.
    pub async fn import(&self, blob: KeyExport, mode: AddMode) -> Result<AddOutcome> {
        if blob.keys.iter().all(|k| k.trim().is_empty()) {
            return Err(KeypoolError::Config(
                "import blob field 'keys' is missing or empty".to_string(),
            ));
        }

        let prior_len = self.registry.len();
        let outcome = self.registry.add_keys(&blob.keys, mode)?;

        match mode {
            AddMode::Override => {
                self.limiter.reset_all();
                self.selector.reset_all();
                self.stats.reset_all();

                self.registry.restore_disabled(&blob.disabled_indices);
                self.registry.set_aggregation_mode(blob.aggregation_mode);
                if blob.calls_per_rotation >= 1 {
                    self.registry.set_calls_per_rotation(blob.calls_per_rotation);
                }

                let len = self.registry.len();
                for (idx, state) in blob.key_states {
                    if idx >= len {
                        continue;
                    }
                    if let Some(rl) = state.rate_limit {
                        self.limiter.restore_one(idx, rl);
                    }
                    if let Some(st) = state.stats {
                        self.stats.restore_one(idx, st);
                    }
                }
            }
            AddMode::Append => {
                // Blob indices address blob.keys; appended keys land at new
                // positions, so carried state re-bases onto where each key
                // actually ended up.
                let secrets = self.registry.secrets();
                for (pos, state) in blob.key_states {
                    let Some(key) = blob.keys.get(pos).map(|k| k.trim()) else {
                        continue;
                    };
                    let Some(idx) = secrets.iter().position(|s| s == key) else {
                        continue;
                    };
                    if idx < prior_len {
                        continue;
                    }
                    if let Some(rl) = state.rate_limit {
                        self.limiter.restore_one(idx, rl);
                    }
                    if let Some(st) = state.stats {
                        self.stats.restore_one(idx, st);
                    }
                }
            }
        }

        self.registry.save().await?;
        self.flush(true).await?;
        Ok(outcome)
    }

    /// All credentials with their derived status
    pub fn get_all_keys(&self) -> Vec<CredentialView> {
        let len = self.registry.len();
        let mut views = Vec::with_capacity(len);

        for index in 0..len {
            let enabled = self.registry.is_enabled(index);
            let exhausted = self.limiter.is_exhausted(index);
            let snap = self.limiter.snapshot(index);
            let recorded = self.stats.get(index);
            let meta = self.registry.disabled_meta(index);

            let has_calls = recorded
                .as_ref()
                .map(|s| s.success_count + s.failure_count > 0)
                .unwrap_or(false);

            let status = if !enabled {
                KeyStatus::Disabled
            } else if exhausted {
                KeyStatus::Exhausted
            } else if has_calls {
                KeyStatus::Active
            } else {
                KeyStatus::Unused
            };

            views.push(CredentialView {
                index,
                masked_key: self.registry.masked(index).unwrap_or_default(),
                enabled,
                status,
                success_count: recorded.as_ref().map(|s| s.success_count).unwrap_or(0),
                failure_count: recorded.as_ref().map(|s| s.failure_count).unwrap_or(0),
                rate_limit: snap.as_ref().map(|s| s.limit),
                remaining: snap.as_ref().map(|s| s.remaining),
                reset_at: snap.as_ref().map(|s| s.reset_at),
                reset_in_seconds: snap.as_ref().map(|s| s.reset_in_seconds),
                last_call_at: recorded.as_ref().and_then(|s| {
                    if s.last_call_at > 0 {
                        Some(s.last_call_at)
                    } else {
                        None
                    }
                }),
                disable_reason: meta.as_ref().map(|m| m.reason.clone()),
                disable_time: meta.as_ref().map(|m| m.disabled_at),
            });
        }
        views
    }

    /// Aggregate stats report, optionally grouped into enabled/disabled
    pub fn get_stats(&self, group_by_status: bool) -> StatsReport {
        let credentials = self.get_all_keys();
        let rate_limits = self.limiter.snapshot_all();
        self.stats
            .get_all_stats(&credentials, &rate_limits, group_by_status)
    }

    /// Current rate limit windows keyed by credential index
    pub fn get_rate_limit_snapshot(&self) -> HashMap<usize, RateLimitSnapshot> {
        self.limiter.snapshot_all()
    }

    pub async fn set_aggregation_mode(&self, mode: AggregationMode) {
        self.registry.set_aggregation_mode(mode);
        self.persist_registry().await;
    }

    /// Rejects values below 1
    pub async fn set_calls_per_rotation(&self, calls: u32) -> bool {
        if !self.registry.set_calls_per_rotation(calls) {
            return false;
        }
        self.persist_registry().await;
        true
    }

    /// Zero counters for one credential, or all of them
    pub async fn reset_stats(&self, index: Option<usize>) -> Result<()> {
        self.stats.reset(index);
        self.stats.flush(true).await
    }

    /// Lift a credential out of quarantine immediately
    pub fn clear_failure(&self, index: usize) {
        self.selector.clear_failure(index);
    }

    /// Persist debounced state now. With `force`, writes unconditionally.
    pub async fn flush(&self, force: bool) -> Result<()> {
        self.stats.flush(force).await?;
        self.limiter.flush(force).await?;
        Ok(())
    }

    /// Background persistence loop: ticks at the save interval and drains
    /// pending debounced writes. Abort the handle on shutdown, after a final
    /// `flush(true)`.
    pub fn spawn_persistence_task(engine: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = engine.config.save_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = engine.flush(false).await {
                    tracing::error!(error = %e, "background flush failed");
                }
            }
        })
    }

    /// Registry writes are admin-path operations; persistence failures are
    /// logged rather than failing an already-applied toggle.
    async fn persist_registry(&self) {
        if let Err(e) = self.registry.save().await {
            tracing::error!(error = %e, "failed to persist key registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn engine_with_keys(keys: &[&str]) -> KeyPoolEngine {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        let engine = KeyPoolEngine::load(store, EngineConfig::default())
            .await
            .unwrap();
        if !keys.is_empty() {
            engine
                .add_keys(
                    &keys.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    AddMode::Append,
                )
                .await
                .unwrap();
        }
        engine
    }

    #[tokio::test]
    async fn test_derived_status_counts() {
        let engine = engine_with_keys(&[
            "k0-00000000",
            "k1-00000000",
            "k2-00000000",
            "k3-00000000",
            "k4-00000000",
        ])
        .await;

        engine.batch_update_status(&[3, 4], false).await;
        engine.limiter.update(0, 100, 0, 3600);
        engine.stats.record_call(1, true, "gpt-4", "");

        let views = engine.get_all_keys();
        assert_eq!(views.len(), 5);

        let count = |status: KeyStatus| views.iter().filter(|v| v.status == status).count();
        assert_eq!(count(KeyStatus::Exhausted), 1);
        assert_eq!(count(KeyStatus::Active), 1);
        assert_eq!(count(KeyStatus::Unused), 1);
        assert_eq!(count(KeyStatus::Disabled), 2);

        assert_eq!(views[3].disable_reason.as_deref(), Some("manual"));
        assert!(views[0].masked_key.contains("..."));
    }

    #[tokio::test]
    async fn test_export_import_override_roundtrip() {
        let engine = engine_with_keys(&["k0-00000000", "k1-00000000", "k2-00000000"]).await;
        engine.update_status(1, false).await;
        engine.set_aggregation_mode(AggregationMode::Random).await;
        engine.set_calls_per_rotation(42).await;
        engine.limiter.update(0, 100, 60, 3600);
        engine.stats.record_call(2, true, "gpt-4", "k2***");

        let blob = engine.export();
        assert_eq!(blob.keys.len(), 3);

        let fresh = engine_with_keys(&[]).await;
        fresh.import(blob.clone(), AddMode::Override).await.unwrap();

        let roundtrip = fresh.export();
        assert_eq!(roundtrip.keys, blob.keys);
        assert_eq!(roundtrip.disabled_indices, vec![1]);
        assert_eq!(roundtrip.aggregation_mode, AggregationMode::Random);
        assert_eq!(roundtrip.calls_per_rotation, 42);

        // Per-key state came back attached to the same indices.
        assert_eq!(fresh.limiter.snapshot(0).unwrap().remaining, 60);
        assert_eq!(fresh.stats.get(2).unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_import_append_rebases_state_onto_new_keys_only() {
        let engine = engine_with_keys(&["k0-00000000", "k1-00000000"]).await;
        engine.stats.record_call(0, true, "gpt-4", "");
        engine.stats.record_call(0, true, "gpt-4", "");

        // A blob exported from another pool: its index 0 is a key this pool
        // already holds, its index 1 is new.
        let mut key_states = HashMap::new();
        key_states.insert(
            0,
            PersistedKeyState {
                stats: Some(stats::KeyStatsSnapshot {
                    success_count: 99,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        key_states.insert(
            1,
            PersistedKeyState {
                rate_limit: Some(RateLimitSnapshot {
                    limit: 100,
                    remaining: 31,
                    used: 69,
                    reset_at: 0,
                    reset_in_seconds: 0,
                }),
                stats: Some(stats::KeyStatsSnapshot {
                    success_count: 7,
                    failure_count: 2,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let blob = KeyExport {
            keys: vec!["k0-00000000".to_string(), "k9-00000000".to_string()],
            disabled_indices: vec![],
            aggregation_mode: AggregationMode::RoundRobin,
            calls_per_rotation: 100,
            key_states,
        };

        let outcome = engine.import(blob, AddMode::Append).await.unwrap();
        assert_eq!(outcome.added, 1);

        // The duplicate keeps its live counters, the blob's do not win.
        assert_eq!(engine.stats.get(0).unwrap().success_count, 2);
        // The new key's carried state lands at its appended index.
        assert_eq!(engine.stats.get(2).unwrap().success_count, 7);
        assert_eq!(engine.limiter.snapshot(2).unwrap().remaining, 31);
    }

    #[tokio::test]
    async fn test_import_rejects_empty_keys_without_mutation() {
        let engine = engine_with_keys(&["keep-key-00000000"]).await;

        let blob = KeyExport {
            keys: vec![],
            disabled_indices: vec![0],
            aggregation_mode: AggregationMode::Random,
            calls_per_rotation: 7,
            key_states: HashMap::new(),
        };

        let err = engine.import(blob, AddMode::Override).await.unwrap_err();
        match err {
            KeypoolError::Config(msg) => assert!(msg.contains("keys")),
            other => panic!("unexpected error: {:?}", other),
        }

        // Nothing was touched.
        assert_eq!(engine.registry.len(), 1);
        assert_eq!(engine.registry.calls_per_rotation(), 100);
        assert!(engine.registry.is_enabled(0));
    }

    #[tokio::test]
    async fn test_delete_rekeys_every_dependent_map() {
        let engine = engine_with_keys(&[
            "k0-00000000",
            "k1-00000000",
            "k2-00000000",
            "k3-00000000",
            "k4-00000000",
        ])
        .await;

        for idx in 0..5 {
            for _ in 0..=idx {
                engine.stats.record_call(idx, true, "m", "");
            }
            engine.limiter.update(idx, 100, 100 - idx as i64, 3600);
        }
        engine.selector.mark_failed(3, "test");

        assert!(engine.delete_key(2).await);

        // Below the deletion point: untouched.
        assert_eq!(engine.stats.get(0).unwrap().success_count, 1);
        assert_eq!(engine.stats.get(1).unwrap().success_count, 2);
        // Above: shifted down by exactly one, nothing lost or duplicated.
        assert_eq!(engine.stats.get(2).unwrap().success_count, 4);
        assert_eq!(engine.stats.get(3).unwrap().success_count, 5);
        assert!(engine.stats.get(4).is_none());
        assert_eq!(engine.limiter.snapshot(2).unwrap().remaining, 97);
        assert_eq!(engine.selector.failed_keys(), vec![2]);
    }

    #[tokio::test]
    async fn test_override_add_resets_ephemeral_state() {
        let engine = engine_with_keys(&["old-key-00000000"]).await;
        engine.stats.record_call(0, false, "m", "");
        engine.limiter.update(0, 10, 0, 3600);
        engine.selector.mark_failed(0, "test");

        engine
            .add_keys(&["new-key-00000000".to_string()], AddMode::Override)
            .await
            .unwrap();

        assert!(engine.stats.get(0).is_none());
        assert!(engine.limiter.snapshot(0).is_none());
        assert!(engine.selector.failed_keys().is_empty());
        assert_eq!(engine.get_all_keys()[0].status, KeyStatus::Unused);
    }

    #[tokio::test]
    async fn test_engine_reload_from_store() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::new());
        {
            let engine = KeyPoolEngine::load(store.clone(), EngineConfig::default())
                .await
                .unwrap();
            engine
                .add_keys(
                    &["k0-00000000".to_string(), "k1-00000000".to_string()],
                    AddMode::Append,
                )
                .await
                .unwrap();
            engine.update_status(1, false).await;
            engine.stats.record_call(0, true, "gpt-4", "");
            engine.flush(true).await.unwrap();
        }

        let engine = KeyPoolEngine::load(store, EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(engine.registry.len(), 2);
        assert_eq!(engine.registry.disabled_indices(), vec![1]);
        assert_eq!(engine.stats.get(0).unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_stats_report_totals_group_by_status() {
        let engine = engine_with_keys(&["k0-00000000", "k1-00000000"]).await;
        engine.update_status(1, false).await;
        engine.stats.record_call(0, true, "gpt-4", "");
        engine.stats.record_call(1, false, "gpt-4", "");

        let report = engine.get_stats(true);
        assert_eq!(report.total_keys, 2);
        assert_eq!(report.active_keys, 1);
        assert_eq!(report.disabled_keys, 1);
        assert_eq!(report.total_success, 1);
        assert_eq!(report.total_failure, 1);
        assert_eq!(report.enabled.as_ref().unwrap().len(), 1);
        assert_eq!(report.disabled.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_keys_is_config_error() {
        let engine = engine_with_keys(&[]).await;
        let err = engine.dispatch("gpt-4", &json!({})).await.unwrap_err();
        assert_eq!(err.code(), "no_available_keys");
    }
}
