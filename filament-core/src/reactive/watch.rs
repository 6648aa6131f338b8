//! Watchers and Effects
//!
//! A watcher is an external callback attached to a reactive node, fired
//! with `(new, old)` when the node changes. Delivery is configurable:
//!
//! - **Sync** (default): the callback runs inside `set`, after the value
//!   lock is released, in the order watchers were registered.
//! - **Post**: the callback is queued on the [`scheduler`](super::scheduler)
//!   and runs on the next [`flush_watchers`](super::scheduler::flush_watchers).
//!   Rapid writes coalesce: the watcher fires at most once per flush, with
//!   the latest new value and the old value from before the first coalesced
//!   write.
//!
//! Deep comparison (structural equality or a caller-supplied comparator)
//! can suppress notifications when the value did not actually change.
//!
//! [`watch_effect`] combines tracking with watching: it runs a closure once
//! inside a tracking frame, subscribes to everything the closure read, and
//! re-runs it (re-tracking from scratch) whenever any of those nodes is
//! invalidated.
//!
//! Callback panics are caught at the invocation site. One failing observer
//! cannot corrupt a cell's state, stop its sibling observers, or crash the
//! caller of `set`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use super::node::{Dependency, NodeId, WatcherId};
use super::scheduler;
use super::tracker::TrackFrame;

/// When a watcher's callback is delivered relative to the triggering write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Run synchronously inside `set`, after the value lock is released.
    #[default]
    Sync,
    /// Queue on the scheduler; runs on the next `flush_watchers` call.
    Post,
}

type Comparator<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Configuration for [`Cell::watch`](super::cell::Cell::watch) and
/// [`Computed::watch`](super::computed::Computed::watch).
pub struct WatchOptions<T> {
    pub(crate) immediate: bool,
    pub(crate) flush: FlushMode,
    pub(crate) compare: Option<Comparator<T>>,
}

impl<T> Default for WatchOptions<T> {
    fn default() -> Self {
        Self {
            immediate: false,
            flush: FlushMode::Sync,
            compare: None,
        }
    }
}

impl<T> WatchOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the callback once at registration with `(current, current)`.
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Defer delivery to the next `flush_watchers` call, coalescing rapid
    /// writes into a single invocation.
    pub fn post_flush(mut self) -> Self {
        self.flush = FlushMode::Post;
        self
    }

    /// Skip notification when the new value equals the last one observed,
    /// using structural equality.
    pub fn deep(mut self) -> Self
    where
        T: PartialEq,
    {
        self.compare = Some(Arc::new(|a: &T, b: &T| a == b));
        self
    }

    /// Skip notification when `eq(new, last_observed)` returns true.
    pub fn compare_with<F>(mut self, eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.compare = Some(Arc::new(eq));
        self
    }
}

impl<T> std::fmt::Debug for WatchOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchOptions")
            .field("immediate", &self.immediate)
            .field("flush", &self.flush)
            .field("deep", &self.compare.is_some())
            .finish()
    }
}

/// A registered observer: callback plus delivery configuration.
pub(crate) struct Watcher<T> {
    id: WatcherId,
    callback: Box<dyn Fn(&T, &T) + Send + Sync>,
    flush: FlushMode,
    compare: Option<Comparator<T>>,
    /// Last value this watcher observed; comparison bookkeeping only,
    /// never used for dependency tracking. `None` unless comparing.
    last_seen: Mutex<Option<T>>,
    /// Old value captured at the first coalesced write since the last
    /// flush. Cleared when the deferred thunk runs.
    pending_old: Mutex<Option<T>>,
}

impl<T> Watcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new<F>(callback: F, options: WatchOptions<T>, current: Option<T>) -> Arc<Self>
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let last_seen = options.compare.is_some().then_some(current).flatten();
        Arc::new(Self {
            id: WatcherId::new(),
            callback: Box::new(callback),
            flush: options.flush,
            compare: options.compare,
            last_seen: Mutex::new(last_seen),
            pending_old: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> WatcherId {
        self.id
    }

    /// Deliver `(new, old)` according to this watcher's configuration.
    pub(crate) fn dispatch(this: &Arc<Self>, new: &T, old: &T) {
        if let Some(eq) = &this.compare {
            let mut last = this.last_seen.lock();
            let unchanged = last.as_ref().map_or(false, |prev| eq(new, prev));
            // The last-observed value advances whether or not we notify.
            *last = Some(new.clone());
            if unchanged {
                return;
            }
        }

        match this.flush {
            FlushMode::Sync => this.invoke(new, old),
            FlushMode::Post => {
                let delivered_old = this
                    .pending_old
                    .lock()
                    .get_or_insert_with(|| old.clone())
                    .clone();
                let new = new.clone();
                let this = Arc::clone(this);
                scheduler::enqueue(
                    this.id,
                    Box::new(move || {
                        this.pending_old.lock().take();
                        this.invoke(&new, &delivered_old);
                    }),
                );
            }
        }
    }

    /// Run the callback, catching panics so one failing observer cannot
    /// break the write path or its sibling observers.
    pub(crate) fn invoke(&self, new: &T, old: &T) {
        if catch_unwind(AssertUnwindSafe(|| (self.callback)(new, old))).is_err() {
            error!(watcher = %self.id, "watcher callback panicked");
        }
    }
}

/// The observers registered on a single node, in registration order.
///
/// Dispatch snapshots the list under lock and invokes callbacks after the
/// lock is released, so a callback may re-enter the node (including writing
/// to it) without deadlocking.
pub(crate) struct ObserverSet<T> {
    watchers: Mutex<IndexMap<WatcherId, Arc<Watcher<T>>>>,
}

impl<T> ObserverSet<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            watchers: Mutex::new(IndexMap::new()),
        }
    }

    pub(crate) fn insert(&self, watcher: Arc<Watcher<T>>) {
        self.watchers.lock().entry(watcher.id()).or_insert(watcher);
    }

    pub(crate) fn remove(&self, id: WatcherId) {
        self.watchers.lock().shift_remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    pub(crate) fn dispatch(&self, new: &T, old: &T) {
        let snapshot: Vec<Arc<Watcher<T>>> = self.watchers.lock().values().cloned().collect();
        for watcher in snapshot {
            Watcher::dispatch(&watcher, new, old);
        }
    }
}

/// Handle returned by `watch`. Deregisters the watcher on [`stop`].
///
/// `stop` is idempotent; calling it again (or racing two calls) is safe.
/// Dropping the handle does **not** deregister — the registration's
/// lifetime is explicit.
pub struct WatchHandle {
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl WatchHandle {
    pub(crate) fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Mutex::new(Some(Box::new(cleanup))),
        }
    }

    /// Deregister the watcher and drop any pending deferred delivery.
    pub fn stop(&self) {
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
    }

    /// True once [`stop`](Self::stop) has run.
    pub fn is_stopped(&self) -> bool {
        self.cleanup.lock().is_none()
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Internal node behind [`watch_effect`].
///
/// Participates in the graph as a leaf dependent: it subscribes to every
/// node its closure reads and re-runs the closure when any of them is
/// invalidated. It has no value and no dependents of its own.
struct EffectInner {
    id: NodeId,
    me: Weak<EffectInner>,
    run: Box<dyn Fn() + Send + Sync>,
    /// Current subscriptions, replaced wholesale after each successful run.
    deps: Mutex<Vec<Arc<dyn Dependency>>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl EffectInner {
    fn as_dependency(&self) -> Option<Arc<dyn Dependency>> {
        self.me.upgrade().map(|inner| inner as Arc<dyn Dependency>)
    }

    /// Run the closure inside a tracking frame and re-subscribe to the
    /// fresh dependency set. A failed run (panic, cycle, depth) leaves the
    /// previous subscriptions in place.
    fn execute(&self) {
        if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let frame = match TrackFrame::begin(self.id) {
            Ok(frame) => frame,
            Err(err) => {
                error!(effect = %self.id, %err, "effect run rejected");
                return;
            }
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.run)()));
        let reads = frame.finish();
        match outcome {
            Ok(()) => self.resubscribe(reads),
            Err(_) => error!(effect = %self.id, "effect closure panicked"),
        }
    }

    /// Replace the subscription set: unsubscribe from nodes no longer
    /// read, subscribe to newly read ones.
    fn resubscribe(&self, reads: Vec<Arc<dyn Dependency>>) {
        let me = match self.as_dependency() {
            Some(me) => me,
            None => return,
        };
        let old = std::mem::replace(&mut *self.deps.lock(), reads.clone());
        for dep in &old {
            if !reads.iter().any(|read| read.node_id() == dep.node_id()) {
                dep.remove_dependent(self.id);
            }
        }
        for dep in &reads {
            dep.add_dependent(&me);
        }
        debug!(effect = %self.id, deps = reads.len(), "effect resubscribed");
    }

    fn stop(&self) {
        if self.stopped.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let deps = std::mem::take(&mut *self.deps.lock());
        for dep in deps {
            dep.remove_dependent(self.id);
        }
    }
}

impl Dependency for EffectInner {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn invalidate(&self) {
        self.execute();
    }

    fn add_dependent(&self, _dependent: &Arc<dyn Dependency>) {
        // Effects are leaves; nothing can read them.
    }

    fn remove_dependent(&self, _id: NodeId) {}

    fn value_erased(&self) -> Option<Box<dyn std::any::Any + Send>> {
        None
    }
}

/// A running auto-tracked effect. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WatchEffect {
    inner: Arc<EffectInner>,
}

impl WatchEffect {
    /// Stop the effect, removing all of its current subscriptions.
    ///
    /// Idempotent; after `stop` the effect never runs again.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// True once the effect has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of nodes the effect is currently subscribed to.
    pub fn dependency_count(&self) -> usize {
        self.inner.deps.lock().len()
    }
}

impl std::fmt::Debug for WatchEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEffect")
            .field("id", &self.inner.id)
            .field("dependency_count", &self.dependency_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Run `f` once inside a tracking frame, subscribe to everything it read,
/// and re-run it whenever any subscribed node is invalidated.
///
/// The dependency set is rebuilt from scratch on every run, so conditional
/// reads change the subscriptions between runs. Panics inside `f` are
/// caught per-invocation: one failing run neither stops the effect nor
/// crashes whichever `set` call triggered it.
pub fn watch_effect<F>(f: F) -> WatchEffect
where
    F: Fn() + Send + Sync + 'static,
{
    let inner = Arc::new_cyclic(|me| EffectInner {
        id: NodeId::new(),
        me: me.clone(),
        run: Box::new(f),
        deps: Mutex::new(Vec::new()),
        stopped: std::sync::atomic::AtomicBool::new(false),
    });
    inner.execute();
    WatchEffect { inner }
}
