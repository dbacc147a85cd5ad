//! Low-level primitives underneath the tree engine.
//!
//! Includes positioned file I/O, the page cache and the lock coordinating
//! writers, checkpoints and crash cleanup.

/// Tree-level locks and writer-mode coordination.
pub mod concurrency;

/// I/O abstractions over files and memory.
pub mod io;

/// Page cache with optimistic read cursors and latched write cursors.
pub mod pager;
