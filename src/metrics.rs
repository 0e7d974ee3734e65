//! Counters exposed by the runtime
//!
//! Plain atomics shared via `Arc`; the embedding application decides how (or
//! whether) to scrape them into an exporter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters maintained by one watch loop
#[derive(Debug, Default)]
pub struct WatchMetrics {
    /// Whether the subscription task is currently running
    pub running: AtomicBool,
    /// Change events received from the server
    pub events_seen: AtomicU64,
    /// Errors observed on the subscription (restart class and fatal alike)
    pub errors_seen: AtomicU64,
    /// Clean server-side closes of the subscription
    pub closes_seen: AtomicU64,
}

impl WatchMetrics {
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub(crate) fn event(&self) {
        self.events_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn close(&self) {
        self.closes_seen.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Counters maintained by one dispatcher
#[derive(Debug, Default)]
pub struct ControllerMetrics {
    /// Reconcile invocations (including ones that returned an error)
    pub reconciles: AtomicU64,
    /// Reconcile invocations that returned an error
    pub reconcile_errors: AtomicU64,
    /// Finalization passes that left at least one identifier behind
    pub finalize_errors: AtomicU64,
    /// Delete-callback invocations
    pub deletes: AtomicU64,
    /// Timer firings that reached the dispatcher
    pub requeues: AtomicU64,
    /// Events classified as unchanged and skipped
    pub unchanged: AtomicU64,
}

impl ControllerMetrics {
    pub(crate) fn add(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
