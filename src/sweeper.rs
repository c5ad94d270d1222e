//! Background eviction of expired entries.
//!
//! A [`Sweeper`] owns one tokio task that wakes every `interval` and asks its
//! target to drop whatever has expired. The task holds only a weak reference
//! to the target, so it never keeps a cache alive, and it stops on the first
//! of: an explicit [`Sweeper::shutdown`], the sweeper being dropped, or the
//! target being dropped.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[cfg(feature = "metrics")]
use metrics::counter;

#[cfg(feature = "tracing")]
use tracing::{debug, info, instrument, warn};

/// Something the sweeper can purge.
pub(crate) trait Sweep: Send + Sync {
    /// Removes expired entries and returns how many were evicted.
    fn sweep(&self) -> usize;
}

pub(crate) struct Sweeper {
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Starts the sweep task on the current tokio runtime.
    ///
    /// Returns `None` when called outside a runtime; expired entries are then
    /// only dropped lazily on lookup.
    pub(crate) fn spawn(interval: Duration, target: Weak<dyn Sweep>) -> Option<Self> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                #[cfg(feature = "tracing")]
                warn!("no tokio runtime available, cleanup sweep disabled");
                return None;
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = handle.spawn(sweep_task(interval, target, shutdown_rx));

        #[cfg(feature = "tracing")]
        info!(interval_ms = interval.as_millis() as u64, "cleanup sweep started");

        Some(Self {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task_handle: Mutex::new(Some(task)),
        })
    }

    /// Stops the task and waits for it to exit.
    pub(crate) async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.task_handle.lock().await.take() {
            let _ = handle.await;
        }

        #[cfg(feature = "tracing")]
        info!("cleanup sweep stopped");
    }

    pub(crate) fn is_running(&self) -> bool {
        match self.task_handle.try_lock() {
            Ok(guard) => guard.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(_) => true,
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        // Best effort: we cannot await the task here, only signal it.
        if let Ok(mut tx_guard) = self.shutdown_tx.try_lock() {
            if let Some(tx) = tx_guard.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg_attr(feature = "tracing", instrument(skip_all, name = "memo_sweep_task"))]
async fn sweep_task(
    period: Duration,
    target: Weak<dyn Sweep>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(target) = target.upgrade() else {
                    #[cfg(feature = "tracing")]
                    debug!("cache dropped, stopping sweep");
                    break;
                };

                let evicted = target.sweep();

                #[cfg(feature = "metrics")]
                counter!("tower_http_memo.swept").increment(evicted as u64);

                #[cfg(feature = "tracing")]
                debug!(evicted, "cleanup sweep finished");

                #[cfg(not(any(feature = "metrics", feature = "tracing")))]
                let _ = evicted;
            }
            _ = &mut shutdown_rx => {
                #[cfg(feature = "tracing")]
                debug!("received shutdown signal, stopping sweep");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTarget {
        sweeps: AtomicUsize,
    }

    impl Sweep for CountingTarget {
        fn sweep(&self) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    fn target() -> Arc<CountingTarget> {
        Arc::new(CountingTarget {
            sweeps: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn sweeps_periodically_until_shutdown() {
        let target = target();
        let weak: Weak<dyn Sweep> = Arc::downgrade(&target) as Weak<dyn Sweep>;
        let sweeper = Sweeper::spawn(Duration::from_millis(10), weak).expect("inside runtime");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(target.sweeps.load(Ordering::SeqCst) >= 2);
        assert!(sweeper.is_running());

        sweeper.shutdown().await;
        assert!(!sweeper.is_running());

        let after = target.sweeps.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn stops_when_target_is_dropped() {
        let target = target();
        let weak: Weak<dyn Sweep> = Arc::downgrade(&target) as Weak<dyn Sweep>;
        let sweeper = Sweeper::spawn(Duration::from_millis(5), weak).expect("inside runtime");

        drop(target);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!sweeper.is_running());
    }

    #[test]
    fn spawn_outside_runtime_is_disabled() {
        let target = target();
        let weak: Weak<dyn Sweep> = Arc::downgrade(&target) as Weak<dyn Sweep>;
        assert!(Sweeper::spawn(Duration::from_millis(5), weak).is_none());
    }
}
