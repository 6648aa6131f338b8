//! Deferred Watcher Scheduler
//!
//! Watchers configured for post-flush delivery are not invoked inside
//! `set`. Instead a thunk capturing the values to deliver is queued here,
//! keyed by watcher identity. Re-enqueuing the same watcher before a flush
//! replaces its pending thunk, so N rapid writes produce at most one
//! callback invocation per watcher per flush cycle.
//!
//! The host (typically a render loop) decides when to call
//! [`flush_watchers`] — for example once per UI update cycle — so deferred
//! watchers batch with that loop's cadence.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{error, trace};

use super::node::WatcherId;

type Thunk = Box<dyn FnOnce() + Send>;

static QUEUE: OnceLock<Mutex<IndexMap<WatcherId, Thunk>>> = OnceLock::new();

fn queue() -> &'static Mutex<IndexMap<WatcherId, Thunk>> {
    QUEUE.get_or_init(|| Mutex::new(IndexMap::new()))
}

/// Queue `thunk` for `watcher`, replacing any thunk already pending for it.
///
/// Replacement keeps the watcher's original position in the queue, so flush
/// order is the order of first enqueue.
pub(crate) fn enqueue(watcher: WatcherId, thunk: Thunk) {
    let mut pending = queue().lock();
    let replaced = pending.insert(watcher, thunk).is_some();
    trace!(watcher = %watcher, replaced, "deferred watcher enqueued");
}

/// Drop any pending thunk for `watcher`. Called when a watcher is stopped.
pub(crate) fn cancel(watcher: WatcherId) {
    queue().lock().shift_remove(&watcher);
}

/// Number of watchers with a pending deferred delivery.
pub fn pending_count() -> usize {
    queue().lock().len()
}

/// Drain and execute all pending deferred callbacks in enqueue order.
///
/// The queue is swapped out before execution: thunks that themselves
/// enqueue new deferred work land in a fresh queue and are picked up by the
/// next flush, keeping the latency of this one bounded. A panicking thunk
/// is caught and logged so it cannot prevent later thunks from running.
pub fn flush_watchers() {
    let pending = std::mem::take(&mut *queue().lock());
    if pending.is_empty() {
        return;
    }
    trace!(count = pending.len(), "flushing deferred watchers");
    for (watcher, thunk) in pending {
        if catch_unwind(AssertUnwindSafe(thunk)).is_err() {
            error!(watcher = %watcher, "deferred watcher callback panicked");
        }
    }
}

/// Serializes tests that touch the global queue. The harness runs tests on
/// parallel threads, and the queue is process-wide.
#[cfg(test)]
pub(crate) static TEST_QUEUE_LOCK: Mutex<()> = Mutex::new(());
