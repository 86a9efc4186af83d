//! Key Selection
//!
//! Chooses which credential serves the next outbound call. Combines the
//! round-robin/random draw over the eligible set with the transient failure
//! quarantine and the proactive rotation counter. This is the only selection
//! path in the crate; callers never keep their own counters or failure maps.

use crate::pool::key::AggregationMode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Default quarantine for a credential after a retryable failure
pub const DEFAULT_FAILURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Selects credentials for dispatch
pub struct KeySelector {
    /// Monotonic counter for round-robin, taken modulo the eligible set size
    /// at each call so the set may grow or shrink between calls
    rr_counter: AtomicUsize,

    /// Quarantined credentials and when they failed. Expired marks are
    /// pruned lazily on read.
    failed: Mutex<HashMap<usize, Instant>>,

    /// Consecutive uses per credential since its last rotation
    call_counts: Mutex<HashMap<usize, u32>>,

    failure_timeout: Duration,
}

impl KeySelector {
    pub fn new() -> Self {
        Self::with_failure_timeout(DEFAULT_FAILURE_TIMEOUT)
    }

    /// Mainly for tests that cannot wait out the 60 second default
    pub fn with_failure_timeout(failure_timeout: Duration) -> Self {
        Self {
            rr_counter: AtomicUsize::new(0),
            failed: Mutex::new(HashMap::new()),
            call_counts: Mutex::new(HashMap::new()),
            failure_timeout,
        }
    }

    /// Drop failure marks older than the quarantine TTL. Caller holds the lock.
    fn prune_expired(&self, failed: &mut HashMap<usize, Instant>) {
        let timeout = self.failure_timeout;
        failed.retain(|idx, at| {
            let live = at.elapsed() < timeout;
            if !live {
                tracing::debug!(index = idx, "failure mark expired, key available again");
            }
            live
        });
    }

    /// Pick the next credential from `candidates` (already filtered to
    /// enabled, non-exhausted indices). Quarantined candidates are skipped.
    /// Returns `None` when nothing is eligible.
    pub fn select_next(&self, candidates: &[usize], mode: AggregationMode) -> Option<usize> {
        let eligible: Vec<usize> = {
            let mut failed = self.failed.lock();
            self.prune_expired(&mut failed);
            candidates
                .iter()
                .copied()
                .filter(|idx| !failed.contains_key(idx))
                .collect()
        };

        if eligible.is_empty() {
            tracing::warn!("no eligible keys to select");
            return None;
        }

        let selected = match mode {
            AggregationMode::Random => {
                use std::collections::hash_map::RandomState;
                use std::hash::{BuildHasher, Hasher};

                let hasher = RandomState::new().build_hasher();
                eligible[hasher.finish() as usize % eligible.len()]
            }
            AggregationMode::RoundRobin => {
                let i = self.rr_counter.fetch_add(1, Ordering::Relaxed);
                eligible[i % eligible.len()]
            }
        };

        let calls = {
            let mut counts = self.call_counts.lock();
            let entry = counts.entry(selected).or_insert(0);
            *entry += 1;
            *entry
        };

        tracing::debug!(index = selected, mode = mode.as_str(), calls, "selected key");
        Some(selected)
    }

    /// Quarantine a credential after a retryable failure. Does not disable
    /// it; enabling/disabling is a separate user-driven action.
    pub fn mark_failed(&self, index: usize, reason: &str) {
        self.failed.lock().insert(index, Instant::now());
        tracing::warn!(index, reason, "key marked as failed");
    }

    /// Remove a quarantine mark immediately, regardless of TTL
    pub fn clear_failure(&self, index: usize) {
        if self.failed.lock().remove(&index).is_some() {
            tracing::debug!(index, "key failure cleared");
        }
    }

    /// Whether the credential currently carries a live failure mark
    pub fn is_failed(&self, index: usize) -> bool {
        let mut failed = self.failed.lock();
        self.prune_expired(&mut failed);
        failed.contains_key(&index)
    }

    /// Indices currently quarantined
    pub fn failed_keys(&self) -> Vec<usize> {
        let mut failed = self.failed.lock();
        self.prune_expired(&mut failed);
        let mut keys: Vec<usize> = failed.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Whether to proactively switch away from `index` before it errors.
    ///
    /// Fires when the credential's consecutive-use count reached
    /// `calls_per_rotation`, or when the caller observed its remaining quota
    /// at zero or below. Either trigger alone is sufficient. On a rotation
    /// decision the counter of the credential being rotated *away from* is
    /// reset to zero.
    pub fn should_rotate(
        &self,
        index: usize,
        rate_remaining: Option<i64>,
        calls_per_rotation: u32,
    ) -> bool {
        let mut counts = self.call_counts.lock();
        let calls = counts.get(&index).copied().unwrap_or(0);

        let calls_trigger = calls >= calls_per_rotation;
        let quota_trigger = rate_remaining.is_some_and(|r| r <= 0);

        let should = calls_trigger || quota_trigger;
        if should {
            counts.insert(index, 0);
            tracing::debug!(
                index,
                calls,
                calls_per_rotation,
                ?rate_remaining,
                "key should rotate"
            );
        }
        should
    }

    /// Consecutive uses recorded for a credential since its last rotation
    pub fn call_count(&self, index: usize) -> u32 {
        self.call_counts.lock().get(&index).copied().unwrap_or(0)
    }

    /// Shift per-credential state after a registry deletion: drop `index`,
    /// move everything above it down by one.
    pub fn remove_index(&self, index: usize) {
        let mut failed = self.failed.lock();
        let old = std::mem::take(&mut *failed);
        for (idx, at) in old {
            if idx < index {
                failed.insert(idx, at);
            } else if idx > index {
                failed.insert(idx - 1, at);
            }
        }
        drop(failed);

        let mut counts = self.call_counts.lock();
        let old = std::mem::take(&mut *counts);
        for (idx, c) in old {
            if idx < index {
                counts.insert(idx, c);
            } else if idx > index {
                counts.insert(idx - 1, c);
            }
        }
    }

    /// Drop all failure marks and rotation counters (override import)
    pub fn reset_all(&self) {
        self.failed.lock().clear();
        self.call_counts.lock().clear();
        self.rr_counter.store(0, Ordering::Relaxed);
    }
}

impl Default for KeySelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RR: AggregationMode = AggregationMode::RoundRobin;

    #[test]
    fn test_round_robin_cycles_evenly() {
        let selector = KeySelector::new();
        let candidates = [0, 1, 2];

        let mut picks = HashMap::new();
        for _ in 0..9 {
            let idx = selector.select_next(&candidates, RR).unwrap();
            *picks.entry(idx).or_insert(0) += 1;
        }

        assert_eq!(picks[&0], 3);
        assert_eq!(picks[&1], 3);
        assert_eq!(picks[&2], 3);
    }

    #[test]
    fn test_round_robin_sequence() {
        let selector = KeySelector::new();
        let candidates = [0, 1, 2];

        let order: Vec<usize> = (0..6)
            .map(|_| selector.select_next(&candidates, RR).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_random_stays_in_candidate_set() {
        let selector = KeySelector::new();
        let candidates = [3, 7];
        for _ in 0..20 {
            let idx = selector
                .select_next(&candidates, AggregationMode::Random)
                .unwrap();
            assert!(candidates.contains(&idx));
        }
    }

    #[test]
    fn test_empty_candidates_select_none() {
        let selector = KeySelector::new();
        assert_eq!(selector.select_next(&[], RR), None);
    }

    #[test]
    fn test_failed_key_quarantined_until_ttl() {
        let selector = KeySelector::with_failure_timeout(Duration::from_millis(40));
        selector.mark_failed(0, "429");

        assert!(selector.is_failed(0));
        assert_eq!(selector.select_next(&[0, 1], RR), Some(1));
        assert_eq!(selector.select_next(&[0], RR), None);

        std::thread::sleep(Duration::from_millis(50));
        assert!(!selector.is_failed(0));
        assert_eq!(selector.select_next(&[0], RR), Some(0));
    }

    #[test]
    fn test_clear_failure_ignores_ttl() {
        let selector = KeySelector::new();
        selector.mark_failed(2, "transport");
        assert_eq!(selector.failed_keys(), vec![2]);

        selector.clear_failure(2);
        assert!(selector.failed_keys().is_empty());
        assert_eq!(selector.select_next(&[2], RR), Some(2));
    }

    #[test]
    fn test_eligible_set_may_shrink_between_calls() {
        let selector = KeySelector::new();
        assert_eq!(selector.select_next(&[0, 1, 2], RR), Some(0));
        assert_eq!(selector.select_next(&[0, 1, 2], RR), Some(1));
        // Counter is modulo the fresh set size, not the old one.
        assert_eq!(selector.select_next(&[0, 1], RR), Some(0));
        assert_eq!(selector.select_next(&[0, 1], RR), Some(1));
    }

    #[test]
    fn test_should_rotate_on_call_threshold() {
        let selector = KeySelector::new();
        for _ in 0..3 {
            selector.select_next(&[0], RR);
        }

        assert!(!selector.should_rotate(0, None, 4));
        selector.select_next(&[0], RR);
        assert!(selector.should_rotate(0, None, 4));
        // Reset applied to the key rotated away from.
        assert_eq!(selector.call_count(0), 0);
    }

    #[test]
    fn test_should_rotate_on_zero_remaining() {
        let selector = KeySelector::new();
        selector.select_next(&[5], RR);

        assert!(selector.should_rotate(5, Some(0), 100));
        assert_eq!(selector.call_count(5), 0);
        assert!(!selector.should_rotate(5, Some(3), 100));
    }

    #[test]
    fn test_remove_index_shifts_state() {
        let selector = KeySelector::new();
        selector.mark_failed(1, "x");
        selector.mark_failed(3, "y");
        selector.select_next(&[2], RR);

        selector.remove_index(1);

        assert_eq!(selector.failed_keys(), vec![2]);
        assert_eq!(selector.call_count(1), 1);
        assert_eq!(selector.call_count(2), 0);
    }
}
