//! Computed Values
//!
//! A `Computed` is a lazily-evaluated, cached derived value. Its closure is
//! not run at construction: the first `get` evaluates it inside a tracking
//! frame, caches the result, and subscribes the node to everything the
//! closure read. Subsequent `get` calls return the cache until an upstream
//! node invalidates it.
//!
//! # State Machine
//!
//! ```text
//! Uninitialized --(first get)--> Cached
//! Cached --(invalidate)--> Stale        (last value retained for watchers)
//! Stale --(get: recompute)--> Cached
//! ```
//!
//! Invalidation is push-based and eager; recomputation is pull-based and
//! lazy. Each recomputation re-derives the dependency set from scratch:
//! edges from a previous, differently-shaped run are discarded before
//! re-subscribing, so conditional reads do not leave stale subscriptions.
//!
//! # Concurrency
//!
//! `get` uses check-recompute-check around a compute gate: concurrent
//! readers of a dirty node do not redundantly recompute. Exactly one
//! recomputation occurs per dirty-to-cached transition, and every
//! concurrent caller observes the value it produced.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::error::ReactiveError;
use super::node::{Dependency, DependentSet, NodeId};
use super::scheduler;
use super::tracker::{self, TrackFrame};
use super::watch::{ObserverSet, WatchHandle, WatchOptions, Watcher};

enum State<T> {
    /// Never computed.
    Uninitialized,
    /// Cache is valid and equals what the closure would currently return.
    Cached(T),
    /// An upstream node changed; the retained value is the previous cache,
    /// kept only for watcher old-value delivery.
    Stale(T),
}

/// A lazily evaluated, cached, auto-tracked derived value.
///
/// Cheap to clone; clones share the cache and graph node.
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

pub(crate) struct ComputedInner<T> {
    id: NodeId,
    me: Weak<ComputedInner<T>>,
    compute: Box<dyn Fn() -> T + Send + Sync>,
    state: Mutex<State<T>>,
    /// Bumped on every invalidation. A recomputation that races with an
    /// invalidation (its reads predate the write) detects the bump and
    /// stores its result as stale rather than masking the invalidation.
    epoch: AtomicU64,
    /// Serializes recomputation; never held while user code runs upstream
    /// locks of the same node.
    compute_gate: Mutex<()>,
    /// Nodes read during the last successful run (strong edges upstream).
    deps: Mutex<Vec<Arc<dyn Dependency>>>,
    dependents: DependentSet,
    observers: ObserverSet<T>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new computed value. The closure is not invoked here; the
    /// first `get` evaluates it.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new_cyclic(|me| ComputedInner {
                id: NodeId::new(),
                me: me.clone(),
                compute: Box::new(compute),
                state: Mutex::new(State::Uninitialized),
                epoch: AtomicU64::new(0),
                compute_gate: Mutex::new(()),
                deps: Mutex::new(Vec::new()),
                dependents: DependentSet::new(),
                observers: ObserverSet::new(),
            }),
        }
    }

    /// Get the computed value's graph-node identity.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value, recomputing if the cache is stale.
    ///
    /// # Errors
    ///
    /// [`ReactiveError::CircularDependency`] when this node is, directly or
    /// indirectly, evaluating itself on the calling thread, and
    /// [`ReactiveError::MaxDepthExceeded`] when evaluation would exceed the
    /// tracking depth bound. A failed evaluation leaves the previous
    /// cached or stale state untouched.
    pub fn try_get(&self) -> Result<T, ReactiveError> {
        if tracker::is_tracking() {
            if let Some(dep) = self.inner.as_dependency() {
                tracker::track(&dep);
            }
        }
        if let Some(value) = self.inner.cached() {
            return Ok(value);
        }
        self.inner.recompute()
    }

    /// Get the current value, recomputing if the cache is stale.
    ///
    /// # Panics
    ///
    /// Panics on a circular dependency or tracking-depth overflow. Use
    /// [`try_get`](Self::try_get) to handle those as values.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("computed evaluation failed: {err}"),
        }
    }

    /// True once a value has been computed (cached or stale).
    pub fn has_value(&self) -> bool {
        !matches!(*self.inner.state.lock(), State::Uninitialized)
    }

    /// True when the next `get` will run the closure.
    pub fn is_dirty(&self) -> bool {
        !matches!(*self.inner.state.lock(), State::Cached(_))
    }

    /// Register a watcher, fired after each recomputation that produces a
    /// value, with `(new, old)`. Old-value delivery starts from the second
    /// computation.
    pub fn watch<F>(&self, callback: F, options: WatchOptions<T>) -> WatchHandle
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let immediate = options.immediate;
        let watcher = Watcher::new(callback, options, self.try_get().ok());
        let watcher_id = watcher.id();
        self.inner.observers.insert(watcher.clone());

        if immediate {
            if let Ok(current) = self.try_get() {
                watcher.invoke(&current, &current);
            }
        }

        let inner = Arc::downgrade(&self.inner);
        WatchHandle::new(move || {
            if let Some(computed) = inner.upgrade() {
                computed.observers.remove(watcher_id);
            }
            scheduler::cancel(watcher_id);
        })
    }

    /// Number of graph nodes currently subscribed to this value.
    pub fn dependent_count(&self) -> usize {
        self.inner.dependents.len()
    }

    /// Number of nodes this value currently depends on.
    pub fn dependency_count(&self) -> usize {
        self.inner.deps.lock().len()
    }
}

impl<T> ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn as_dependency(&self) -> Option<Arc<dyn Dependency>> {
        self.me.upgrade().map(|inner| inner as Arc<dyn Dependency>)
    }

    fn cached(&self) -> Option<T> {
        match &*self.state.lock() {
            State::Cached(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Check-recompute-check: re-test the cache under the gate so that of
    /// N concurrent readers of a dirty node, exactly one runs the closure.
    fn recompute(&self) -> Result<T, ReactiveError> {
        // Same-thread re-entrancy would deadlock on the gate; reject it as
        // the cycle it is before blocking.
        if tracker::on_active_stack(self.id) {
            return Err(ReactiveError::CircularDependency(self.id));
        }

        let _gate = self.compute_gate.lock();
        if let Some(value) = self.cached() {
            return Ok(value);
        }

        let epoch_before = self.epoch.load(Ordering::Acquire);
        let frame = TrackFrame::begin(self.id)?;
        let value = (self.compute)();
        let reads = frame.finish();
        trace!(computed = %self.id, deps = reads.len(), "recomputed");
        self.resubscribe(reads);

        let old = {
            let mut state = self.state.lock();
            let old = match &*state {
                State::Cached(prev) | State::Stale(prev) => Some(prev.clone()),
                State::Uninitialized => None,
            };
            if self.epoch.load(Ordering::Acquire) == epoch_before {
                *state = State::Cached(value.clone());
            } else {
                // An invalidation raced with this run; the result is a
                // consistent snapshot for our caller but must not be
                // cached as current.
                *state = State::Stale(value.clone());
            }
            old
        };
        drop(_gate);

        if let Some(old) = old {
            self.observers.dispatch(&value, &old);
        }
        Ok(value)
    }

    /// Replace the previous dependency set with the fresh read-set:
    /// unsubscribe from nodes no longer read, subscribe to new ones.
    fn resubscribe(&self, reads: Vec<Arc<dyn Dependency>>) {
        let me = match self.as_dependency() {
            Some(me) => me,
            None => return,
        };
        // A self-read is already reported as a cycle at the read site;
        // never subscribe to ourselves.
        let reads: Vec<Arc<dyn Dependency>> = reads
            .into_iter()
            .filter(|dep| dep.node_id() != self.id)
            .collect();

        let old = std::mem::replace(&mut *self.deps.lock(), reads.clone());
        for dep in &old {
            if !reads.iter().any(|read| read.node_id() == dep.node_id()) {
                dep.remove_dependent(self.id);
            }
        }
        for dep in &reads {
            dep.add_dependent(&me);
        }
        debug!(computed = %self.id, deps = reads.len(), "resubscribed");
    }
}

impl<T> Dependency for ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let first_transition = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Uninitialized) {
                State::Cached(value) => {
                    *state = State::Stale(value);
                    true
                }
                other => {
                    // Already stale or never computed; cascading again
                    // would revisit the same subtree.
                    *state = other;
                    false
                }
            }
        };
        if first_transition {
            trace!(computed = %self.id, "invalidated");
            super::node::invalidate_dependents(&self.dependents);
        }
    }

    fn add_dependent(&self, dependent: &Arc<dyn Dependency>) {
        self.dependents.insert(dependent);
    }

    fn remove_dependent(&self, id: NodeId) {
        self.dependents.remove(id);
    }

    fn value_erased(&self) -> Option<Box<dyn Any + Send>> {
        match self.cached() {
            Some(value) => Some(Box::new(value)),
            None => self
                .recompute()
                .ok()
                .map(|value| Box::new(value) as Box<dyn Any + Send>),
        }
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("has_value", &self.has_value())
            .field("dirty", &self.is_dirty())
            .field("dependent_count", &self.dependent_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::cell::Cell;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn computes_lazily_and_caches() {
        let calls = Arc::new(AtomicI32::new(0));

        let calls_c = calls.clone();
        let computed = Computed::new(move || {
            calls_c.fetch_add(1, Ordering::SeqCst);
            42
        });

        // Not run at construction.
        assert!(!computed.has_value());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // N gets, one computation.
        assert_eq!(computed.get(), 42);
        assert_eq!(computed.get(), 42);
        assert_eq!(computed.get(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(computed.has_value());
        assert!(!computed.is_dirty());
    }

    #[test]
    fn recomputes_after_upstream_write() {
        let cell = Cell::new(5);
        let calls = Arc::new(AtomicI32::new(0));

        let (cell_c, calls_c) = (cell.clone(), calls.clone());
        let doubled = Computed::new(move || {
            calls_c.fetch_add(1, Ordering::SeqCst);
            cell_c.get() * 2
        });

        assert_eq!(doubled.get(), 10);
        assert_eq!(cell.dependent_count(), 1);

        cell.set(10);
        assert!(doubled.is_dirty());

        assert_eq!(doubled.get(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_edges_are_unsubscribed_on_retrack() {
        let toggle = Cell::new(true);
        let a = Cell::new(1);
        let b = Cell::new(10);

        let (toggle_c, a_c, b_c) = (toggle.clone(), a.clone(), b.clone());
        let picked = Computed::new(move || {
            if toggle_c.get() {
                a_c.get()
            } else {
                b_c.get()
            }
        });

        assert_eq!(picked.get(), 1);
        assert_eq!(a.dependent_count(), 1);
        assert_eq!(b.dependent_count(), 0);
        assert_eq!(picked.dependency_count(), 2);

        toggle.set(false);
        assert_eq!(picked.get(), 10);
        assert_eq!(a.dependent_count(), 0);
        assert_eq!(b.dependent_count(), 1);

        // A write to the abandoned branch no longer dirties the node.
        a.set(999);
        assert!(!picked.is_dirty());
    }

    #[test]
    fn self_read_is_reported_as_cycle() {
        let slot: Arc<Mutex<Option<Computed<i32>>>> = Arc::new(Mutex::new(None));
        let seen: Arc<Mutex<Option<ReactiveError>>> = Arc::new(Mutex::new(None));

        let (slot_c, seen_c) = (slot.clone(), seen.clone());
        let looped = Computed::new(move || {
            let guard = slot_c.lock();
            match guard.as_ref() {
                Some(me) => match me.try_get() {
                    Ok(value) => value + 1,
                    Err(err) => {
                        *seen_c.lock() = Some(err);
                        -1
                    }
                },
                None => 0,
            }
        });
        *slot.lock() = Some(looped.clone());

        assert_eq!(looped.get(), -1);
        assert_eq!(
            *seen.lock(),
            Some(ReactiveError::CircularDependency(looped.id()))
        );
    }

    #[test]
    fn mutual_cycle_is_reported_not_looped() {
        let slot: Arc<Mutex<Option<Computed<i32>>>> = Arc::new(Mutex::new(None));
        let seen: Arc<Mutex<Option<ReactiveError>>> = Arc::new(Mutex::new(None));

        // `slot` holds `first`; `second` reads it back, closing the loop.
        let (slot_c, seen_c) = (slot.clone(), seen.clone());
        let second = Computed::new(move || {
            let guard = slot_c.lock();
            match guard.as_ref() {
                Some(first) => match first.try_get() {
                    Ok(value) => value + 1,
                    Err(err) => {
                        *seen_c.lock() = Some(err);
                        -1
                    }
                },
                None => 0,
            }
        });

        let second_c = second.clone();
        let first = Computed::new(move || second_c.try_get().unwrap_or(-100) + 1);
        *slot.lock() = Some(first.clone());

        // first -> second -> first: the innermost read of `first` is the
        // cycle, and the error surfaces at that read site.
        assert_eq!(first.get(), 0);
        assert_eq!(
            *seen.lock(),
            Some(ReactiveError::CircularDependency(first.id()))
        );
    }

    #[test]
    fn failed_evaluation_leaves_prior_cache() {
        let cell = Cell::new(1);
        let slot: Arc<Mutex<Option<Computed<i32>>>> = Arc::new(Mutex::new(None));

        let (cell_c, slot_c) = (cell.clone(), slot.clone());
        let computed = Computed::new(move || {
            let base = cell_c.get();
            if base > 100 {
                // Degenerate self-read; fails with a cycle error.
                let guard = slot_c.lock();
                if let Some(me) = guard.as_ref() {
                    if me.try_get().is_err() {
                        panic!("evaluation failed");
                    }
                }
            }
            base * 2
        });
        *slot.lock() = Some(computed.clone());

        assert_eq!(computed.get(), 2);

        cell.set(200);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| computed.get()));
        assert!(result.is_err());

        // Still stale, not corrupted: a later good write recovers.
        cell.set(3);
        assert_eq!(computed.get(), 6);
    }

    #[test]
    fn erased_value_recomputes_and_downcasts() {
        let cell = Cell::new(4);

        let cell_c = cell.clone();
        let squared = Computed::new(move || cell_c.get() * cell_c.get());

        let erased = squared.inner.value_erased().unwrap();
        assert_eq!(*erased.downcast::<i32>().unwrap(), 16);
    }

    #[test]
    fn clone_shares_cache() {
        let calls = Arc::new(AtomicI32::new(0));

        let calls_c = calls.clone();
        let a = Computed::new(move || {
            calls_c.fetch_add(1, Ordering::SeqCst);
            7
        });
        let b = a.clone();

        assert_eq!(a.get(), 7);
        assert_eq!(b.get(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn watcher_fires_on_recomputation() {
        let cell = Cell::new(1);

        let cell_c = cell.clone();
        let tripled = Computed::new(move || cell_c.get() * 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        let handle = tripled.watch(
            move |new: &i32, old: &i32| {
                seen_c.lock().push((*new, *old));
            },
            WatchOptions::new(),
        );

        cell.set(2);
        assert_eq!(tripled.get(), 6);
        assert_eq!(*seen.lock(), vec![(6, 3)]);

        handle.stop();
    }
}
