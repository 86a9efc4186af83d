//! Rate Limit Tracking
//!
//! Per-credential rate limit windows derived from upstream response headers.
//! Windows reset lazily: the expiry check happens on the next read or write
//! after `reset_at`, inside the same lock acquisition, so no background sweep
//! is needed and no two callers can both observe and reset a stale window.

use crate::error::{KeypoolError, Result};
use crate::store::{keys, ConfigStore};
use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reset scheduled when an exhausted window arrives without a reset time
const FALLBACK_RESET_SECS: i64 = 60;

/// One credential's rate limit window
#[derive(Debug, Clone)]
struct RateLimitWindow {
    limit: u64,
    remaining: i64,
    used: u64,
    /// Absolute unix timestamp at which the window resets
    reset_at: i64,
}

impl RateLimitWindow {
    /// Restore the full quota once the reset time has passed. Must be called
    /// with the window lock held so check and reset are one atomic unit.
    fn maybe_reset(&mut self, now: i64) -> bool {
        if self.reset_at > 0 && now >= self.reset_at {
            self.remaining = self.limit as i64;
            self.used = 0;
            self.reset_at = 0;
            return true;
        }
        false
    }

    fn is_exhausted(&self) -> bool {
        self.remaining <= 0
    }
}

/// Serializable view of one window, used for snapshots, export and persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: u64,
    pub remaining: i64,
    pub used: u64,
    pub reset_at: i64,
    /// Seconds until reset, clamped at zero; derived at snapshot time
    #[serde(default)]
    pub reset_in_seconds: i64,
}

/// Rate limit values parsed from upstream response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: i64,
    pub reset: i64,
}

/// Parse `x-ratelimit-limit` / `x-ratelimit-remaining` / `x-ratelimit-reset`
/// from a response. Returns `None` unless both limit and remaining are present.
pub fn parse_rate_limit_headers(headers: &HeaderMap) -> Option<RateLimitHeaders> {
    let get_num = |name: &str| -> Option<i64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(|f| f as i64)
    };

    let limit = get_num("x-ratelimit-limit")?;
    let remaining = get_num("x-ratelimit-remaining")?;
    let reset = get_num("x-ratelimit-reset").unwrap_or(0);

    Some(RateLimitHeaders {
        limit: limit.max(0) as u64,
        remaining,
        reset,
    })
}

/// Tracks rate limit windows for every credential in the pool, keyed by the
/// registry's positional index.
pub struct RateLimiter {
    windows: RwLock<HashMap<usize, RateLimitWindow>>,
    store: Arc<dyn ConfigStore>,
    dirty: AtomicBool,
    last_save: Mutex<Option<Instant>>,
    save_interval: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn ConfigStore>, save_interval: Duration) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            store,
            dirty: AtomicBool::new(false),
            last_save: Mutex::new(None),
            save_interval,
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Record rate limit values observed on an upstream response.
    ///
    /// Reset-time convention: a `reset` value greater than half the current
    /// unix timestamp is treated as an absolute timestamp and used as-is;
    /// anything smaller is treated as "seconds until reset" and added to now.
    /// An exhausted window with no usable reset value gets a fallback reset
    /// one minute out; without it the key would be filtered from selection
    /// forever, since only selected keys receive the response that refreshes
    /// their window.
    pub fn update(&self, index: usize, limit: u64, remaining: i64, reset: i64) {
        let now = Self::now();
        let reset_at = if reset > 0 {
            if reset > now / 2 {
                reset
            } else {
                now + reset
            }
        } else if remaining <= 0 {
            now + FALLBACK_RESET_SECS
        } else {
            0
        };

        let window = RateLimitWindow {
            limit,
            remaining,
            used: limit.saturating_sub(remaining.max(0) as u64),
            reset_at,
        };

        tracing::debug!(
            index,
            limit,
            remaining,
            reset_in = (reset_at - now).max(0),
            "updated rate limit window"
        );

        self.windows.write().insert(index, window);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Whether the credential's current window has no quota left. A credential
    /// with no recorded window is not exhausted. Performs the lazy reset first.
    pub fn is_exhausted(&self, index: usize) -> bool {
        let now = Self::now();
        let mut windows = self.windows.write();
        match windows.get_mut(&index) {
            Some(w) => {
                if w.maybe_reset(now) {
                    tracing::info!(index, limit = w.limit, "rate limit window reset");
                    self.dirty.store(true, Ordering::Relaxed);
                }
                w.is_exhausted()
            }
            None => false,
        }
    }

    /// First non-exhausted index in the given order. When every candidate is
    /// exhausted, degrades to the one with the earliest reset time. Returns
    /// `None` only for an empty candidate list.
    pub fn get_next_available(&self, indices: &[usize]) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let now = Self::now();
        let mut windows = self.windows.write();

        for &idx in indices {
            match windows.get_mut(&idx) {
                Some(w) => {
                    if w.maybe_reset(now) {
                        self.dirty.store(true, Ordering::Relaxed);
                    }
                    if !w.is_exhausted() {
                        return Some(idx);
                    }
                }
                None => return Some(idx),
            }
        }

        // All exhausted: soonest to recover wins.
        let earliest = indices
            .iter()
            .filter_map(|&idx| windows.get(&idx).map(|w| (idx, w.reset_at)))
            .min_by_key(|&(_, reset_at)| reset_at)
            .map(|(idx, _)| idx);

        if let Some(idx) = earliest {
            tracing::warn!(index = idx, "all keys exhausted, degrading to earliest reset");
        }
        earliest.or_else(|| indices.first().copied())
    }

    /// Snapshot of one credential's window, with the lazy reset applied
    pub fn snapshot(&self, index: usize) -> Option<RateLimitSnapshot> {
        let now = Self::now();
        let mut windows = self.windows.write();
        let w = windows.get_mut(&index)?;
        if w.maybe_reset(now) {
            self.dirty.store(true, Ordering::Relaxed);
        }
        Some(Self::to_snapshot(w, now))
    }

    /// Snapshot of every recorded window, keyed by credential index
    pub fn snapshot_all(&self) -> HashMap<usize, RateLimitSnapshot> {
        let now = Self::now();
        let mut windows = self.windows.write();
        let mut result = HashMap::with_capacity(windows.len());
        for (&idx, w) in windows.iter_mut() {
            if w.maybe_reset(now) {
                self.dirty.store(true, Ordering::Relaxed);
            }
            result.insert(idx, Self::to_snapshot(w, now));
        }
        result
    }

    fn to_snapshot(w: &RateLimitWindow, now: i64) -> RateLimitSnapshot {
        RateLimitSnapshot {
            limit: w.limit,
            remaining: w.remaining,
            used: w.used,
            reset_at: w.reset_at,
            reset_in_seconds: if w.reset_at > 0 {
                (w.reset_at - now).max(0)
            } else {
                0
            },
        }
    }

    /// Replace all windows from persisted snapshots
    pub fn restore(&self, snapshots: HashMap<usize, RateLimitSnapshot>) {
        let mut windows = self.windows.write();
        windows.clear();
        for (idx, s) in snapshots {
            windows.insert(
                idx,
                RateLimitWindow {
                    limit: s.limit,
                    remaining: s.remaining,
                    used: s.used,
                    reset_at: s.reset_at,
                },
            );
        }
    }

    /// Restore a single credential's window, used by import
    pub fn restore_one(&self, index: usize, s: RateLimitSnapshot) {
        self.windows.write().insert(
            index,
            RateLimitWindow {
                limit: s.limit,
                remaining: s.remaining,
                used: s.used,
                reset_at: s.reset_at,
            },
        );
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Drop the window at `index` and shift every higher-indexed window down
    /// by one, keeping window state attached to the right credential after a
    /// registry deletion.
    pub fn remove_index(&self, index: usize) {
        let mut windows = self.windows.write();
        let old = std::mem::take(&mut *windows);
        for (idx, w) in old {
            if idx < index {
                windows.insert(idx, w);
            } else if idx > index {
                windows.insert(idx - 1, w);
            }
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Clear every window (override import, full reset)
    pub fn reset_all(&self) {
        self.windows.write().clear();
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Load persisted windows from the store. Absent key means a cold start;
    /// a failed read propagates so the caller can tell the difference.
    pub async fn load(&self) -> Result<()> {
        match self.store.get(keys::RATE_LIMITS).await? {
            Some(value) => {
                let snapshots: HashMap<usize, RateLimitSnapshot> =
                    serde_json::from_value(value).map_err(|e| {
                        KeypoolError::Storage(format!("invalid rate limit blob: {}", e))
                    })?;
                let count = snapshots.len();
                self.restore(snapshots);
                tracing::debug!(count, "loaded rate limit windows");
            }
            None => tracing::debug!("no persisted rate limit windows"),
        }
        Ok(())
    }

    /// Persist windows if dirty and the debounce interval elapsed, or
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
        self.store.set(keys::RATE_LIMITS, value).await?;
        tracing::debug!(count = snapshot.len(), "saved rate limit windows");
        Ok(())
    }
}
