//! Lifecycle callbacks.

use std::time::Duration;

use crate::types::{Result, TreeError};

/// Counters reported when a crash-generation cleanup completes.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct CleanupStats {
    /// Pages looked at, whatever their type.
    pub pages_visited: u64,
    /// Pages that were tree nodes.
    pub tree_nodes: u64,
    /// Pointer pairs that had a crashed slot zeroed.
    pub cleaned_crash_pointers: u64,
    /// Wall time the cleanup took.
    pub duration: Duration,
}

/// Receives tree lifecycle events. Every method defaults to doing nothing.
pub trait Monitor: Send + Sync {
    /// A checkpoint made the current generation durable.
    fn checkpoint_completed(&self) {}

    /// The file was empty and a new tree is being created.
    fn no_store_file(&self) {}

    /// A crash-generation cleanup was registered at open.
    fn cleanup_registered(&self) {}

    /// The cleanup started running.
    fn cleanup_started(&self) {}

    /// The cleanup visited every page. An error here fails the cleanup.
    fn cleanup_finished(&self, _stats: &CleanupStats) -> Result<()> {
        Ok(())
    }

    /// The tree closed while a cleanup was pending or running.
    fn cleanup_closed(&self) {}

    /// The cleanup failed.
    fn cleanup_failed(&self, _error: &TreeError) {}

    /// Whether the tree was cleanly closed before this open.
    fn startup_state(&self, _clean: bool) {}

    /// The root split and the tree grew a level.
    fn tree_growth(&self) {}

    /// The root had a single child and the tree lost a level.
    fn tree_shrink(&self) {}
}

/// Monitor that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMonitor;

impl Monitor for NoMonitor {}
