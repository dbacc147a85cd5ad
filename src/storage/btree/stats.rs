use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct TreeStatsSnapshot {
    /// Number of leaf splits performed
    pub leaf_splits: u64,
    /// Number of internal node splits performed
    pub internal_splits: u64,
    /// Number of leaf merges performed
    pub leaf_merges: u64,
    /// Number of entries moved between leaves by rebalancing
    pub leaf_rebalances: u64,
    /// Number of successor nodes created
    pub successors: u64,
    /// Number of new roots created by a root split
    pub tree_growths: u64,
    /// Number of roots removed because they had a single child
    pub tree_shrinks: u64,
    /// Number of times a seek had to re-read a node
    pub seek_retries: u64,
    /// Number of times a seek restarted from a newer root
    pub root_catchups: u64,
}

/// Thread-safe statistics for one tree.
#[derive(Default, Debug)]
pub struct TreeStats {
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    leaf_merges: AtomicU64,
    leaf_rebalances: AtomicU64,
    successors: AtomicU64,
    tree_growths: AtomicU64,
    tree_shrinks: AtomicU64,
    seek_retries: AtomicU64,
    root_catchups: AtomicU64,
}

impl TreeStats {
    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal node splits.
    pub fn internal_splits(&self) -> u64 {
        self.internal_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf merges.
    pub fn leaf_merges(&self) -> u64 {
        self.leaf_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf rebalances.
    pub fn leaf_rebalances(&self) -> u64 {
        self.leaf_rebalances.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of successors created.
    pub fn successors(&self) -> u64 {
        self.successors.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of times the tree grew a level.
    pub fn tree_growths(&self) -> u64 {
        self.tree_growths.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of times the tree lost a level.
    pub fn tree_shrinks(&self) -> u64 {
        self.tree_shrinks.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of seek retries.
    pub fn seek_retries(&self) -> u64 {
        self.seek_retries.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root catch-ups done by seeks.
    pub fn root_catchups(&self) -> u64 {
        self.root_catchups.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_merges(&self) {
        self.leaf_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_rebalances(&self) {
        self.leaf_rebalances.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_successors(&self) {
        self.successors.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_tree_growths(&self) {
        self.tree_growths.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_tree_shrinks(&self) {
        self.tree_shrinks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_seek_retries(&self) {
        self.seek_retries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_catchups(&self) {
        self.root_catchups.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            internal_splits: self.internal_splits(),
            leaf_merges: self.leaf_merges(),
            leaf_rebalances: self.leaf_rebalances(),
            successors: self.successors(),
            tree_growths: self.tree_growths(),
            tree_shrinks: self.tree_shrinks(),
            seek_retries: self.seek_retries(),
            root_catchups: self.root_catchups(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "genbtree::stats",
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            leaf_merges = snapshot.leaf_merges,
            leaf_rebalances = snapshot.leaf_rebalances,
            successors = snapshot.successors,
            tree_growths = snapshot.tree_growths,
            tree_shrinks = snapshot.tree_shrinks,
            seek_retries = snapshot.seek_retries,
            root_catchups = snapshot.root_catchups,
            "tree stats snapshot"
        );
    }
}
