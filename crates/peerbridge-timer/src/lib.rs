//! One-shot timer service for peerbridge.
//!
//! Every timeout-driven protocol (session handshake, keep-alive) schedules
//! its checks through a [`TimerService`]. The service is an explicit value,
//! cloned by handle into whoever needs it, and shut down explicitly by its
//! owner: shutting down cancels every pending callback and makes later
//! `set_timeout` calls inert.
//!
//! # Integration
//!
//! ```ignore
//! let timer = TimerService::new();
//! let handle = timer.set_timeout(Duration::from_secs(20), move || {
//!     // runs on its own task unless cancelled first
//! });
//! handle.cancel();
//! timer.shutdown();
//! ```
//!
//! Callbacks run on their own spawned tasks, so anything they touch must be
//! `Send` and synchronised.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// TimerService
// ---------------------------------------------------------------------------

/// Schedules delayed callbacks.
///
/// Cheap to clone; all clones share the same shutdown state.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

struct Inner {
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
    pending: AtomicUsize,
}

impl TimerService {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        debug!("timer service created");
        Self {
            inner: Arc::new(Inner {
                shutdown_tx,
                shut_down: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
            }),
        }
    }

    /// Runs `callback` once after `delay`, unless cancelled or the service
    /// shuts down first.
    ///
    /// Must be called from within a Tokio runtime. After shutdown this
    /// schedules nothing and returns an inert handle.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            trace!(?delay, "timer service shut down, timeout ignored");
            return TimeoutHandle { task: None };
        }

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let guard = PendingGuard::new(Arc::clone(&self.inner));
        let task = tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                () = shut_down(&mut shutdown_rx) => {
                    trace!("timeout cancelled by shutdown");
                }
                () = tokio::time::sleep(delay) => callback(),
            }
        });

        TimeoutHandle {
            task: Some(task.abort_handle()),
        }
    }

    /// Sleeps for `delay`. Returns `false` early if the service shuts down
    /// first (or already had).
    pub async fn sleep(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return false;
        }
        tokio::select! {
            biased;
            () = shut_down(&mut shutdown_rx) => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Cancels every pending callback and refuses new ones.
    ///
    /// Returns `true` only for the call that actually shut the service
    /// down; later calls are no-ops returning `false`.
    pub fn shutdown(&self) -> bool {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.shutdown_tx.send_replace(true);
        debug!(
            pending = self.pending(),
            "timer service shut down"
        );
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Number of scheduled callbacks that have neither fired nor been
    /// cancelled.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("shut_down", &self.is_shut_down())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Resolves once the shutdown flag is set.
async fn shut_down(rx: &mut watch::Receiver<bool>) {
    // The sender lives in `Inner`, which every caller keeps alive.
    let _ = rx.wait_for(|down| *down).await;
}

/// Keeps the pending count honest however the timer task ends (fired,
/// cancelled, aborted).
struct PendingGuard(Arc<Inner>);

impl PendingGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.pending.fetch_add(1, Ordering::AcqRel);
        Self(inner)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// TimeoutHandle
// ---------------------------------------------------------------------------

/// Handle to one scheduled callback.
///
/// Dropping the handle does not cancel the callback.
#[derive(Debug)]
pub struct TimeoutHandle {
    task: Option<AbortHandle>,
}

impl TimeoutHandle {
    /// Prevents the callback from running if it has not started yet.
    pub fn cancel(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Whether the callback has run, been cancelled, or was never
    /// scheduled.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(AbortHandle::is_finished)
    }
}
