//! In-process counters for the memoizer.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Lock-free counters updated on every memoizer operation.
#[derive(Debug)]
pub struct MemoStats {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    stores: AtomicU64,
    fetch_errors: AtomicU64,
    expired: AtomicU64,
    swept: AtomicU64,
    created_at: SystemTime,
}

impl MemoStats {
    /// All counters at zero, uptime starting now.
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            fetch_errors: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            swept: AtomicU64::new(0),
            created_at: SystemTime::now(),
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a caller that started a new fetch wave.
    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a caller that attached to an in-flight fetch.
    pub(crate) fn record_joined(&self) {
        self.joined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an entry dropped lazily because it expired before lookup.
    pub(crate) fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_swept(&self, count: u64) {
        self.swept.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self, entries: usize, in_flight: usize) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let joined = self.joined.load(Ordering::Relaxed);
        let lookups = hits + misses + joined;

        let hit_rate = if lookups > 0 {
            (hits + joined) as f64 / lookups as f64
        } else {
            0.0
        };

        let uptime = SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
            .as_secs();

        StatsSnapshot {
            lookups,
            hits,
            misses,
            joined,
            stores: self.stores.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            entries,
            in_flight,
            hit_rate,
            uptime_seconds: uptime,
        }
    }
}

impl Default for MemoStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of [`MemoStats`].
///
/// `hit_rate` counts callers that joined an in-flight fetch as hits, since
/// they did not cause an upstream call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    /// `hits + misses + joined`.
    pub lookups: u64,
    /// Served from a live entry.
    pub hits: u64,
    /// Started a fetch.
    pub misses: u64,
    /// Waited on a fetch started by another caller.
    pub joined: u64,
    /// Successful fetches written to the cache.
    pub stores: u64,
    /// Fetches that failed or panicked. Each counts once per wave.
    pub fetch_errors: u64,
    /// Entries dropped when a lookup found them expired.
    pub expired: u64,
    /// Entries evicted by the cleanup sweep or `purge_expired`.
    pub swept: u64,
    /// Stored entries, expired ones not yet evicted included.
    pub entries: usize,
    /// Keys with a fetch currently running.
    pub in_flight: usize,
    /// `(hits + joined) / lookups`, or zero before the first lookup.
    pub hit_rate: f64,
    /// Seconds since the memoizer was created.
    pub uptime_seconds: u64,
}
