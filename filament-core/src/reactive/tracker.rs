//! Dependency Tracker
//!
//! The tracker discovers, per evaluation, exactly the set of nodes a
//! computation reads. Dependencies are never declared up front: a computed
//! value runs its closure once inside a tracking frame, and every cell or
//! computed read during that run registers itself with the frame.
//!
//! # Per-Thread Stacks
//!
//! Each concurrently-scheduled thread gets its own stack of frames, stored
//! in a concurrent map keyed by `ThreadId`. Unrelated threads evaluating
//! unrelated computations never see each other's frames or contend on a
//! shared lock. A global atomic counter of "any tracking active anywhere"
//! gates the map lookup so the common case — a plain `get()` outside any
//! computation — costs a single relaxed load.
//!
//! # Cycle and Depth Guards
//!
//! A node may not appear twice in a thread's active stack: that means the
//! computation is, directly or indirectly, evaluating itself, and
//! [`ReactiveError::CircularDependency`] is returned instead of looping or
//! overflowing the call stack. Independently, the stack is bounded at
//! [`MAX_TRACK_DEPTH`] frames to reject runaway chains of nested computeds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::trace;

use super::error::ReactiveError;
use super::node::{Dependency, NodeId};

/// Maximum number of nested tracking frames per thread.
pub const MAX_TRACK_DEPTH: usize = 100;

/// Count of active frames across all threads.
///
/// Fast-reject gate: when zero, no tracking is active anywhere and reads
/// skip the per-thread lookup entirely.
static ACTIVE_FRAMES: AtomicUsize = AtomicUsize::new(0);

static STACKS: OnceLock<DashMap<ThreadId, Vec<Frame>>> = OnceLock::new();

fn stacks() -> &'static DashMap<ThreadId, Vec<Frame>> {
    STACKS.get_or_init(DashMap::new)
}

/// One in-flight evaluation: the node being evaluated and the deduplicated
/// set of nodes it has read so far.
struct Frame {
    node: NodeId,
    reads: SmallVec<[Arc<dyn Dependency>; 8]>,
}

/// RAII guard for an active tracking frame.
///
/// Obtained from [`TrackFrame::begin`]; consumed by [`TrackFrame::finish`],
/// which returns the accumulated read-set. If the guard is dropped without
/// `finish` (the computation panicked), the frame is popped and the reads
/// are discarded, leaving the stack consistent.
#[derive(Debug)]
pub struct TrackFrame {
    node: NodeId,
    finished: bool,
}

impl TrackFrame {
    /// Push a frame for `node` onto the calling thread's stack.
    ///
    /// # Errors
    ///
    /// - [`ReactiveError::CircularDependency`] if `node` already appears
    ///   anywhere in this thread's active stack.
    /// - [`ReactiveError::MaxDepthExceeded`] if the stack is already at
    ///   [`MAX_TRACK_DEPTH`] frames.
    pub fn begin(node: NodeId) -> Result<Self, ReactiveError> {
        {
            let mut stack = stacks().entry(thread::current().id()).or_default();
            if stack.iter().any(|frame| frame.node == node) {
                return Err(ReactiveError::CircularDependency(node));
            }
            if stack.len() >= MAX_TRACK_DEPTH {
                return Err(ReactiveError::depth_exceeded());
            }
            stack.push(Frame {
                node,
                reads: SmallVec::new(),
            });
        }
        ACTIVE_FRAMES.fetch_add(1, Ordering::Relaxed);
        trace!(node = %node, "tracking frame pushed");
        Ok(Self {
            node,
            finished: false,
        })
    }

    /// Pop the frame and return its accumulated read-set.
    ///
    /// This is the fresh dependency list a computed value uses to
    /// re-subscribe itself after recomputation.
    pub fn finish(mut self) -> Vec<Arc<dyn Dependency>> {
        self.finished = true;
        let reads = pop_frame(self.node)
            .map(|frame| frame.reads.into_vec())
            .unwrap_or_default();
        trace!(node = %self.node, reads = reads.len(), "tracking frame finished");
        reads
    }
}

impl Drop for TrackFrame {
    fn drop(&mut self) {
        // Panic-safety: a computation that unwinds still pops its frame.
        if !self.finished {
            pop_frame(self.node);
        }
    }
}

fn pop_frame(node: NodeId) -> Option<Frame> {
    let tid = thread::current().id();
    let frame = {
        let mut stack = stacks().get_mut(&tid)?;
        let frame = stack.pop();
        debug_assert!(
            frame.as_ref().map_or(true, |f| f.node == node),
            "tracking frame mismatch: expected {node}",
        );
        if stack.is_empty() {
            drop(stack);
            stacks().remove(&tid);
        }
        frame
    };
    if frame.is_some() {
        ACTIVE_FRAMES.fetch_sub(1, Ordering::Relaxed);
    }
    frame
}

/// True iff the calling thread has at least one active frame.
pub fn is_tracking() -> bool {
    if ACTIVE_FRAMES.load(Ordering::Relaxed) == 0 {
        return false;
    }
    stacks()
        .get(&thread::current().id())
        .map_or(false, |stack| !stack.is_empty())
}

/// Record `dep` as read by the current (top) frame, deduplicated.
///
/// No-op when the calling thread is not tracking; a plain top-level read
/// never registers a dependency.
pub fn track(dep: &Arc<dyn Dependency>) {
    if ACTIVE_FRAMES.load(Ordering::Relaxed) == 0 {
        return;
    }
    let tid = thread::current().id();
    if let Some(mut stack) = stacks().get_mut(&tid) {
        if let Some(frame) = stack.last_mut() {
            let id = dep.node_id();
            if !frame.reads.iter().any(|seen| seen.node_id() == id) {
                frame.reads.push(Arc::clone(dep));
            }
        }
    }
}

/// True iff `node` appears anywhere in the calling thread's active stack.
///
/// Used by computed values to reject same-thread re-entrant evaluation
/// before blocking on their compute gate.
pub fn on_active_stack(node: NodeId) -> bool {
    if ACTIVE_FRAMES.load(Ordering::Relaxed) == 0 {
        return false;
    }
    stacks()
        .get(&thread::current().id())
        .map_or(false, |stack| stack.iter().any(|frame| frame.node == node))
}
