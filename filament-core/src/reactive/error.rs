//! Error types for the reactive engine.
//!
//! Evaluation errors are returned to the computation that triggered the
//! problematic read, never swallowed: a failed recomputation leaves the
//! node's previous cached or stale state untouched.

use thiserror::Error;

use super::node::NodeId;
use super::tracker::MAX_TRACK_DEPTH;

/// Errors surfaced by dependency tracking during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A computation attempted to read a node that is already being
    /// evaluated somewhere in the current thread's active call chain.
    #[error("circular dependency: node {0} is already being evaluated on this thread")]
    CircularDependency(NodeId),

    /// The tracking stack reached its depth bound. Guards against unbounded
    /// chains of nested computed values, independent of true cycles.
    #[error("tracking depth limit of {limit} frames exceeded")]
    MaxDepthExceeded {
        /// The fixed stack bound ([`MAX_TRACK_DEPTH`]).
        limit: usize,
    },
}

impl ReactiveError {
    pub(crate) fn depth_exceeded() -> Self {
        Self::MaxDepthExceeded {
            limit: MAX_TRACK_DEPTH,
        }
    }
}
