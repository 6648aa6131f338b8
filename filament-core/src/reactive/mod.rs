//! Reactive Primitives
//!
//! This module implements the core reactive engine: cells, computed values,
//! watchers, and effects, plus the dependency tracker and the deferred
//! watcher scheduler that tie them together.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A [`Cell`] is a thread-safe container for mutable state. When a cell is
//! read while a computation is being tracked, it automatically registers
//! the computation as a dependent. When the cell's value changes, staleness
//! propagates through the dependency graph and watchers fire.
//!
//! ## Computed values
//!
//! A [`Computed`] is a derived value that caches its result. Dependencies
//! are not declared up front: they are discovered by running the closure
//! once and observing which nodes it reads. Invalidation is eager;
//! recomputation happens lazily on the next read.
//!
//! ## Watchers and effects
//!
//! Watchers are external callbacks attached to a node, delivered either
//! synchronously inside `set` or batched through [`flush_watchers`].
//! [`watch_effect`] is an auto-tracked side-effecting computation that
//! re-runs whenever anything it read changes.
//!
//! This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is the model used by SolidJS, Vue 3, and
//! Leptos.

mod cell;
mod computed;
mod error;
mod node;
mod scheduler;
mod tracker;
mod watch;

pub use cell::Cell;
pub use computed::Computed;
pub use error::ReactiveError;
pub use node::{Dependency, NodeId, WatcherId};
pub use scheduler::{flush_watchers, pending_count};
pub use tracker::{is_tracking, TrackFrame, MAX_TRACK_DEPTH};
pub use watch::{watch_effect, FlushMode, WatchEffect, WatchHandle, WatchOptions};
