//! Single-flight, time-expiring key/value store.
//!
//! [`Memoizer::memoize`] either returns a live cached value, attaches the
//! caller to a fetch already running for the same key, or starts a new fetch.
//! Each fetch runs on its own tokio task, so the callers waiting on it (the
//! one that started it included) can be dropped without cancelling it for the
//! others.
//!
//! Only successful results are stored. A failed fetch is handed to every
//! caller that was waiting on it and then forgotten, so the next caller
//! starts a new fetch.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio::time::Instant;

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::error::MemoError;
use crate::stats::{MemoStats, StatsSnapshot};
use crate::sweeper::{Sweep, Sweeper};

/// Disables expiration when passed to [`Memoizer::new`].
pub const NO_EXPIRATION: Duration = Duration::ZERO;

/// Disables the periodic cleanup sweep when passed to [`Memoizer::new`].
pub const NO_CLEANUP: Duration = Duration::ZERO;

type WaveResult<V> = Shared<BoxFuture<'static, Result<V, MemoError>>>;

/// A stored value and its timing metadata. Only the memoizer creates these.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    /// `None` when the entry never expires.
    ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    fn new(value: V, inserted_at: Instant, ttl: Option<Duration>) -> Self {
        Self {
            value,
            inserted_at,
            ttl,
        }
    }

    /// An entry is expired once `ttl` has elapsed since it was stored.
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.inserted_at) >= ttl)
    }
}

/// Outstanding fetch for one key.
struct InFlight<V> {
    wave: u64,
    result: WaveResult<V>,
}

/// How a [`Memoized`] value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Served from a live cache entry.
    Hit,
    /// This caller started the fetch.
    Fetched,
    /// This caller waited on a fetch another caller started.
    Joined,
}

/// Value returned by [`Memoizer::memoize`].
#[derive(Debug, Clone)]
pub struct Memoized<V> {
    /// The cached or freshly fetched value.
    pub value: V,
    /// Whether the value came from a hit, this caller's fetch or a join.
    pub source: Source,
}

impl<V> Memoized<V> {
    /// True unless this caller triggered the upstream call itself.
    pub fn is_cached(&self) -> bool {
        !matches!(self.source, Source::Fetched)
    }

    /// Discards the [`Source`].
    pub fn into_value(self) -> V {
        self.value
    }
}

struct Store<V> {
    entries: DashMap<String, CacheEntry<V>>,
    in_flight: DashMap<String, InFlight<V>>,
    expiration: Option<Duration>,
    next_wave: AtomicU64,
    stats: MemoStats,
}

impl<V> Store<V>
where
    V: Clone,
{
    /// Returns the live value for `key`, dropping it first if it expired.
    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }

        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.stats.record_expired();
        }
        None
    }

    fn insert(&self, key: String, value: V) {
        let entry = CacheEntry::new(value, Instant::now(), self.expiration);
        self.entries.insert(key, entry);
        self.stats.record_store();
    }

    fn purge_expired(&self) -> usize {
        if self.expiration.is_none() {
            return 0;
        }

        let now = Instant::now();
        let mut evicted = 0usize;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                evicted += 1;
            }
            keep
        });
        self.stats.record_swept(evicted as u64);
        evicted
    }
}

impl<V> Sweep for Store<V>
where
    V: Clone + Send + Sync,
{
    fn sweep(&self) -> usize {
        self.purge_expired()
    }
}

/// Clears the in-flight marker for one wave, even if the fetch panics or its
/// task is torn down.
struct InFlightGuard<V> {
    store: Arc<Store<V>>,
    key: String,
    wave: u64,
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        let wave = self.wave;
        self.store
            .in_flight
            .remove_if(&self.key, |_, in_flight| in_flight.wave == wave);
    }
}

/// Memoizing cache with single-flight fetches and optional expiration.
///
/// Each instance owns its own state; there is no process-wide cache. Entry
/// count is unbounded, so with expiration disabled the store grows for as
/// long as new keys are fetched.
pub struct Memoizer<V> {
    store: Arc<Store<V>>,
    cleanup_interval: Option<Duration>,
    sweeper: Option<Sweeper>,
}

impl<V> Memoizer<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a memoizer.
    ///
    /// A zero `expiration` keeps entries forever ([`NO_EXPIRATION`]). A zero
    /// `cleanup_interval` disables the background sweep ([`NO_CLEANUP`]);
    /// expired entries are then only dropped when looked up. The sweep is
    /// spawned on the current tokio runtime and only when both durations are
    /// positive, since nothing can expire otherwise.
    pub fn new(expiration: Duration, cleanup_interval: Duration) -> Self {
        let expiration = positive(expiration);
        let cleanup_interval = positive(cleanup_interval);

        let store = Arc::new(Store {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            expiration,
            next_wave: AtomicU64::new(0),
            stats: MemoStats::new(),
        });

        let sweeper = match (expiration, cleanup_interval) {
            (Some(_), Some(interval)) => {
                let target = Arc::downgrade(&store) as Weak<dyn Sweep>;
                Sweeper::spawn(interval, target)
            }
            _ => None,
        };

        Self {
            store,
            cleanup_interval,
            sweeper,
        }
    }

    /// Returns the cached value for `key`, or runs `fetch` to produce it.
    ///
    /// Concurrent callers for the same key share one execution of `fetch`
    /// and all receive its result, error included. `fetch` is only called by
    /// the caller that starts a wave; on a hit or a join it is dropped
    /// before this call waits on anything.
    pub async fn memoize<F, Fut>(
        &self,
        key: impl Into<String>,
        fetch: F,
    ) -> Result<Memoized<V>, MemoError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, MemoError>> + Send + 'static,
    {
        let key = key.into();

        if let Some(value) = self.store.lookup(&key) {
            return Ok(self.hit(&key, value));
        }

        let (result, leader) = match self.store.in_flight.entry(key.clone()) {
            Entry::Occupied(in_flight) => (in_flight.get().result.clone(), None),
            Entry::Vacant(slot) => {
                // A wave stores its entry before clearing its marker, so
                // re-checking under the shard lock cannot miss a result.
                if let Some(value) = self.store.lookup(&key) {
                    drop(slot);
                    return Ok(self.hit(&key, value));
                }

                let wave = self.store.next_wave.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                let result: WaveResult<V> = async move {
                    rx.await.unwrap_or(Err(MemoError::FetchCancelled))
                }
                .boxed()
                .shared();

                slot.insert(InFlight {
                    wave,
                    result: result.clone(),
                });

                let guard = InFlightGuard {
                    store: Arc::clone(&self.store),
                    key: key.clone(),
                    wave,
                };
                (result, Some((guard, tx)))
            }
        };

        let source = match leader {
            Some((guard, tx)) => {
                self.store.stats.record_miss();

                #[cfg(feature = "metrics")]
                counter!("tower_http_memo.miss").increment(1);

                #[cfg(feature = "tracing")]
                debug!(key = %key, wave = guard.wave, "memo miss, starting fetch");

                tokio::spawn(run_wave(guard, fetch(), tx));
                Source::Fetched
            }
            None => {
                // Release whatever the unused fetch holds before waiting.
                drop(fetch);
                self.store.stats.record_joined();

                #[cfg(feature = "metrics")]
                counter!("tower_http_memo.joined").increment(1);

                #[cfg(feature = "tracing")]
                debug!(key = %key, "memo join, waiting on in-flight fetch");

                Source::Joined
            }
        };

        let value = result.await?;
        Ok(Memoized { value, source })
    }

    fn hit(&self, key: &str, value: V) -> Memoized<V> {
        self.store.stats.record_hit();

        #[cfg(feature = "metrics")]
        counter!("tower_http_memo.hit").increment(1);

        #[cfg(feature = "tracing")]
        debug!(key = %key, "memo hit");

        #[cfg(not(feature = "tracing"))]
        let _ = key;

        Memoized {
            value,
            source: Source::Hit,
        }
    }

    /// Returns the live value for `key` without fetching.
    pub fn get(&self, key: &str) -> Option<V> {
        self.store.lookup(key)
    }

    /// Removes the entry for `key`, returning its value if it was live.
    ///
    /// A fetch already in flight for `key` is unaffected and will store its
    /// result when it completes.
    pub fn remove(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.store
            .entries
            .remove(key)
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(_, entry)| entry.value)
    }

    /// Drops every stored entry. In-flight fetches are unaffected.
    pub fn clear(&self) {
        self.store.entries.clear();
    }

    /// Runs one cleanup sweep immediately and returns the evicted count.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    /// Number of stored entries, expired ones not yet evicted included.
    pub fn len(&self) -> usize {
        self.store.entries.len()
    }

    /// True when no entries are stored, expired ones included.
    pub fn is_empty(&self) -> bool {
        self.store.entries.is_empty()
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.store.in_flight.len()
    }

    /// Configured entry lifetime, `None` when entries never expire.
    pub fn expiration(&self) -> Option<Duration> {
        self.store.expiration
    }

    /// Configured sweep period, `None` when the sweep is disabled. The sweep
    /// may still be off when this is set; see [`Memoizer::is_sweeping`].
    pub fn cleanup_interval(&self) -> Option<Duration> {
        self.cleanup_interval
    }

    /// Whether the background cleanup sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.as_ref().is_some_and(Sweeper::is_running)
    }

    /// Point-in-time counters plus the current entry and in-flight counts.
    pub fn stats(&self) -> StatsSnapshot {
        self.store.stats.snapshot(self.len(), self.in_flight())
    }

    /// Stops the cleanup sweep and waits for it to exit.
    ///
    /// Dropping the memoizer also stops the sweep, without waiting.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.shutdown().await;
        }
    }
}

/// Drives one fetch to completion and publishes its result.
async fn run_wave<V, Fut>(
    guard: InFlightGuard<V>,
    fetch: Fut,
    tx: oneshot::Sender<Result<V, MemoError>>,
) where
    V: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<V, MemoError>> + Send + 'static,
{
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let result = match AssertUnwindSafe(fetch).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            #[cfg(feature = "tracing")]
            warn!(key = %guard.key, "memo fetch panicked");
            Err(MemoError::FetchPanicked)
        }
    };

    #[cfg(feature = "metrics")]
    histogram!("tower_http_memo.fetch_latency").record(start.elapsed().as_secs_f64());

    match &result {
        Ok(value) => {
            guard.store.insert(guard.key.clone(), value.clone());

            #[cfg(feature = "metrics")]
            counter!("tower_http_memo.store").increment(1);

            #[cfg(feature = "tracing")]
            debug!(key = %guard.key, "memo stored");
        }
        Err(_err) => {
            guard.store.stats.record_fetch_error();

            #[cfg(feature = "metrics")]
            counter!("tower_http_memo.fetch_error").increment(1);

            #[cfg(feature = "tracing")]
            debug!(key = %guard.key, error = %_err, "memo fetch failed, result not stored");
        }
    }

    // Clear the marker before waking waiters: late callers then either see
    // the stored entry or start a fresh wave after a failure.
    drop(guard);
    let _ = tx.send(result);
}

fn positive(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
