//! Cell Implementation
//!
//! A `Cell` is the fundamental reactive primitive: a thread-safe mutable
//! storage location, and a source node of the dependency graph.
//!
//! # How Cells Work
//!
//! 1. When a cell is read inside a tracking frame (a computed value or
//!    effect being evaluated), the cell registers itself with that frame,
//!    and the evaluating node later subscribes as a dependent.
//!
//! 2. When the cell's value changes, staleness is pushed through the graph
//!    (dependents are invalidated recursively) and registered watchers are
//!    notified with `(new, old)`.
//!
//! # Thread Safety
//!
//! The value lives behind an `RwLock`: any number of concurrent readers
//! against a stable snapshot, at most one writer completing at a time.
//! Dependent and observer lists are snapshotted under their own locks and
//! iterated after release, so no lock is ever held across a callback — a
//! watcher may write back into the same cell without deadlocking.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::node::{invalidate_dependents, Dependency, DependentSet, NodeId};
use super::scheduler;
use super::tracker;
use super::watch::{ObserverSet, WatchHandle, WatchOptions, Watcher};

/// A reactive cell holding a value of type `T`.
///
/// Cheap to clone; clones share the same storage and graph node.
///
/// # Example
///
/// ```rust,ignore
/// let count = Cell::new(0);
///
/// // Read the value (registers a dependency when tracked)
/// let value = count.get();
///
/// // Update the value (invalidates dependents, notifies watchers)
/// count.set(5);
/// ```
pub struct Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

pub(crate) struct CellInner<T> {
    id: NodeId,
    value: RwLock<T>,
    dependents: DependentSet,
    observers: ObserverSet<T>,
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new cell with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: NodeId::new(),
                value: RwLock::new(value),
                dependents: DependentSet::new(),
                observers: ObserverSet::new(),
            }),
        }
    }

    /// Get the cell's graph-node identity.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If the calling thread is inside a tracking frame, the cell registers
    /// itself as read by that frame.
    pub fn get(&self) -> T {
        if tracker::is_tracking() {
            let dep: Arc<dyn Dependency> = self.inner.clone();
            tracker::track(&dep);
        }
        self.inner.value.read().clone()
    }

    /// Get the current value without establishing a reactive dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Set a new value, invalidate dependents, and notify watchers.
    ///
    /// The exclusive lock covers only the value swap. Invalidation cascades
    /// and watcher callbacks run after it is released, so a callback may
    /// re-enter this cell. Watchers in post-flush mode are only enqueued
    /// here, not executed.
    pub fn set(&self, value: T) {
        let old = {
            let mut guard = self.inner.value.write();
            std::mem::replace(&mut *guard, value.clone())
        };
        trace!(cell = %self.inner.id, "cell written");

        self.inner.invalidate();
        self.inner.observers.dispatch(&value, &old);
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let new_value = {
            let guard = self.inner.value.read();
            f(&guard)
        };
        self.set(new_value);
    }

    /// Register a watcher on this cell. See [`WatchOptions`] for delivery
    /// configuration. The returned handle deregisters it on `stop`.
    pub fn watch<F>(&self, callback: F, options: WatchOptions<T>) -> WatchHandle
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let immediate = options.immediate;
        let watcher = Watcher::new(callback, options, Some(self.get_untracked()));
        let watcher_id = watcher.id();
        self.inner.observers.insert(watcher.clone());

        if immediate {
            let current = self.get_untracked();
            watcher.invoke(&current, &current);
        }

        let inner = Arc::downgrade(&self.inner);
        WatchHandle::new(move || {
            if let Some(cell) = inner.upgrade() {
                cell.observers.remove(watcher_id);
            }
            scheduler::cancel(watcher_id);
        })
    }

    /// Number of graph nodes currently subscribed to this cell.
    pub fn dependent_count(&self) -> usize {
        self.inner.dependents.len()
    }

    /// Number of registered watchers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }
}

impl<T> Dependency for CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn invalidate(&self) {
        invalidate_dependents(&self.dependents);
    }

    fn add_dependent(&self, dependent: &Arc<dyn Dependency>) {
        self.dependents.insert(dependent);
    }

    fn remove_dependent(&self, id: NodeId) {
        self.dependents.remove(id);
    }

    fn value_erased(&self) -> Option<Box<dyn Any + Send>> {
        Some(Box::new(self.value.read().clone()))
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Cell<T>
where
    T: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .field("dependent_count", &self.dependent_count())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn cell_get_and_set() {
        let cell = Cell::new(0);
        assert_eq!(cell.get(), 0);

        cell.set(42);
        assert_eq!(cell.get(), 42);
    }

    #[test]
    fn cell_update() {
        let cell = Cell::new(10);
        cell.update(|v| v + 5);
        assert_eq!(cell.get(), 15);
    }

    #[test]
    fn cell_clone_shares_state() {
        let a = Cell::new(0);
        let b = a.clone();

        a.set(42);
        assert_eq!(b.get(), 42);

        b.set(100);
        assert_eq!(a.get(), 100);
    }

    #[test]
    fn watchers_fire_in_registration_order() {
        let cell = Cell::new(0);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for label in ["first", "second", "third"] {
            let order = order.clone();
            handles.push(cell.watch(
                move |new: &i32, old: &i32| {
                    order.lock().push((label, *new, *old));
                },
                WatchOptions::new(),
            ));
        }

        cell.set(7);
        assert_eq!(
            *order.lock(),
            vec![("first", 7, 0), ("second", 7, 0), ("third", 7, 0)]
        );
    }

    #[test]
    fn stopped_watcher_no_longer_fires() {
        let cell = Cell::new(0);
        let fired = Arc::new(AtomicI32::new(0));

        let fired_c = fired.clone();
        let handle = cell.watch(
            move |_new: &i32, _old: &i32| {
                fired_c.fetch_add(1, Ordering::SeqCst);
            },
            WatchOptions::new(),
        );

        cell.set(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        handle.stop();
        handle.stop(); // idempotent
        assert!(handle.is_stopped());

        cell.set(2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cell.observer_count(), 0);
    }

    #[test]
    fn watcher_may_write_back_into_the_cell() {
        // Notify-outside-lock: a reentrant set from a callback must not
        // deadlock. Clamp the value to 10 from inside the watcher.
        let cell = Cell::new(0);

        let cell_c = cell.clone();
        let _handle = cell.watch(
            move |new: &i32, _old: &i32| {
                if *new > 10 {
                    cell_c.set(10);
                }
            },
            WatchOptions::new(),
        );

        cell.set(50);
        assert_eq!(cell.get(), 10);
    }

    #[test]
    fn add_dependent_is_idempotent() {
        let cell = Cell::new(1);
        let other = Cell::new(2);

        let dep: Arc<dyn Dependency> = other.inner.clone();
        cell.inner.add_dependent(&dep);
        cell.inner.add_dependent(&dep);

        assert_eq!(cell.dependent_count(), 1);

        cell.inner.remove_dependent(other.id());
        assert_eq!(cell.dependent_count(), 0);
    }

    #[test]
    fn erased_value_downcasts_to_concrete_type() {
        let cell = Cell::new(String::from("reactive"));

        let erased = cell.inner.value_erased().unwrap();
        let concrete = erased.downcast::<String>().unwrap();
        assert_eq!(*concrete, "reactive");
    }

    #[test]
    fn panicking_watcher_does_not_stop_siblings() {
        let cell = Cell::new(0);
        let fired = Arc::new(AtomicI32::new(0));

        let _bad = cell.watch(
            |_new: &i32, _old: &i32| panic!("broken observer"),
            WatchOptions::new(),
        );
        let fired_c = fired.clone();
        let _good = cell.watch(
            move |_new: &i32, _old: &i32| {
                fired_c.fetch_add(1, Ordering::SeqCst);
            },
            WatchOptions::new(),
        );

        cell.set(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cell.get(), 1);
    }
}
