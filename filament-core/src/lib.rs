//! Filament Core
//!
//! This crate provides the reactive engine beneath the Filament UI
//! framework:
//!
//! - Reactive primitives (cells, computed values, watchers, effects)
//! - Automatic runtime dependency tracking with cycle and depth detection
//! - Push-based invalidation with pull-based, cached recomputation
//! - A coalescing scheduler for deferred watcher delivery
//!
//! The UI-composition layer (component trees, lifecycle, rendering) lives
//! in other crates and consumes this engine through the `reactive` module's
//! narrow surface. The engine itself has no I/O: every operation is
//! in-process and non-blocking apart from brief internal mutual exclusion.
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_core::reactive::{Cell, Computed, WatchOptions, flush_watchers};
//!
//! let count = Cell::new(5);
//!
//! let count_for_doubled = count.clone();
//! let doubled = Computed::new(move || count_for_doubled.get() * 2);
//! assert_eq!(doubled.get(), 10);
//!
//! let handle = count.watch(
//!     |new, old| println!("count: {old} -> {new}"),
//!     WatchOptions::new().post_flush(),
//! );
//!
//! count.set(10);              // invalidates `doubled`, queues the watcher
//! assert_eq!(doubled.get(), 20);
//! flush_watchers();           // prints "count: 5 -> 10"
//! handle.stop();
//! ```

pub mod reactive;
