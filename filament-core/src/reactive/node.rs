//! Node Identities and the Dependency Contract
//!
//! Every participant in the dependency graph — cells, computed values, and
//! effect nodes — implements the [`Dependency`] trait. The trait is the
//! narrow, type-erased contract the rest of the engine works against:
//!
//! - `invalidate` marks the node stale and propagates to its dependents.
//! - `add_dependent` / `remove_dependent` maintain the reverse edges used
//!   for that propagation.
//! - `value_erased` exposes the current value without generics, for callers
//!   that hold a `dyn Dependency` and re-specialize via a checked downcast.
//!
//! Concrete nodes are generic (`Cell<T>`, `Computed<T>`), but a computed's
//! dependency list mixes nodes of arbitrary held types, so edges are stored
//! as `Weak<dyn Dependency>`. Downstream nodes hold strong references to
//! what they read; upstream nodes hold only weak back-edges, which keeps the
//! graph free of reference cycles.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a registered watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

impl WatcherId {
    /// Generate a new unique watcher ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WatcherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The contract every reactive node implements.
///
/// Implemented by the inner state of `Cell<T>`, `Computed<T>`, and effect
/// nodes. All methods must be safe to call concurrently.
pub trait Dependency: Send + Sync {
    /// The node's unique identity.
    fn node_id(&self) -> NodeId;

    /// Mark this node stale and propagate staleness to all dependents.
    ///
    /// Propagation is push-based and eager; recomputation stays pull-based
    /// and lazy. Implementations must not hold internal locks while
    /// invalidating dependents.
    fn invalidate(&self);

    /// Register `dependent` to be invalidated when this node changes.
    ///
    /// Idempotent: registering the same node twice must not duplicate
    /// notifications.
    fn add_dependent(&self, dependent: &Arc<dyn Dependency>);

    /// Remove a previously registered dependent. No-op if absent.
    fn remove_dependent(&self, id: NodeId);

    /// Type-erased read of the current value.
    ///
    /// Returns `None` when the node has no value to offer (effect nodes, or
    /// a computed whose evaluation failed). Callers that know the concrete
    /// type re-specialize with `downcast`.
    fn value_erased(&self) -> Option<Box<dyn Any + Send>>;
}

/// Reverse edges of a node: the dependents to invalidate when it changes.
///
/// Keyed by [`NodeId`] so registration is idempotent, while preserving
/// registration order. Edges are weak; dead entries are pruned whenever a
/// snapshot is taken.
pub(crate) struct DependentSet {
    edges: Mutex<IndexMap<NodeId, Weak<dyn Dependency>>>,
}

impl DependentSet {
    pub(crate) fn new() -> Self {
        Self {
            edges: Mutex::new(IndexMap::new()),
        }
    }

    /// Register a dependent. Re-registering an existing node is a no-op.
    pub(crate) fn insert(&self, dependent: &Arc<dyn Dependency>) {
        let mut edges = self.edges.lock();
        edges
            .entry(dependent.node_id())
            .or_insert_with(|| Arc::downgrade(dependent));
    }

    pub(crate) fn remove(&self, id: NodeId) {
        self.edges.lock().shift_remove(&id);
    }

    /// Take a stable snapshot of the live dependents, pruning dead edges.
    ///
    /// Callers iterate the snapshot after the internal lock is released, so
    /// invalidation callbacks may freely re-enter the graph.
    pub(crate) fn snapshot(&self) -> SmallVec<[Arc<dyn Dependency>; 4]> {
        let mut edges = self.edges.lock();
        edges.retain(|_, weak| weak.strong_count() > 0);
        edges.values().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.edges.lock().len()
    }
}

/// Invalidate every live dependent in `set`, outside of any caller lock.
pub(crate) fn invalidate_dependents(set: &DependentSet) {
    for dependent in set.snapshot() {
        dependent.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubNode {
        id: NodeId,
        invalidations: std::sync::atomic::AtomicUsize,
    }

    impl StubNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: NodeId::new(),
                invalidations: std::sync::atomic::AtomicUsize::new(0),
            })
        }
    }

    impl Dependency for StubNode {
        fn node_id(&self) -> NodeId {
            self.id
        }

        fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }

        fn add_dependent(&self, _dependent: &Arc<dyn Dependency>) {}

        fn remove_dependent(&self, _id: NodeId) {}

        fn value_erased(&self) -> Option<Box<dyn Any + Send>> {
            None
        }
    }

    #[test]
    fn node_ids_are_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn insert_is_idempotent() {
        let set = DependentSet::new();
        let node = StubNode::new();
        let dep: Arc<dyn Dependency> = node.clone();

        set.insert(&dep);
        set.insert(&dep);
        set.insert(&dep);

        assert_eq!(set.len(), 1);

        invalidate_dependents(&set);
        assert_eq!(node.invalidations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_prunes_dropped_dependents() {
        let set = DependentSet::new();
        let keep = StubNode::new();
        let keep_dep: Arc<dyn Dependency> = keep.clone();
        set.insert(&keep_dep);

        {
            let gone = StubNode::new();
            let gone_dep: Arc<dyn Dependency> = gone.clone();
            set.insert(&gone_dep);
            assert_eq!(set.len(), 2);
        }

        let live = set.snapshot();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].node_id(), keep.id);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_deletes_edge() {
        let set = DependentSet::new();
        let node = StubNode::new();
        let dep: Arc<dyn Dependency> = node.clone();

        set.insert(&dep);
        set.remove(node.id);

        assert_eq!(set.len(), 0);
        invalidate_dependents(&set);
        assert_eq!(node.invalidations.load(Ordering::SeqCst), 0);
    }
}
