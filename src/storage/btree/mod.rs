#![forbid(unsafe_code)]

//! Generation-safe on-disk B+ tree.
//!
//! Writers never modify a node that a checkpoint made durable; they write a
//! successor copy instead and redirect pointers through generation-safe
//! pointer pairs. Readers run without locks and retry when they observe a
//! concurrent change.

mod checker;
mod cleaner;
mod freelist;
mod gspp;
mod layout;
mod logic;
mod merger;
mod meta;
mod monitor;
mod multi_root;
mod node;
mod partition;
mod propagation;
mod seek;
mod state;
mod stats;
mod tree;

pub use checker::{CheckVisitor, Violation, ViolationCollector, MIN_TREE_NODE_ID};
pub use cleaner::{CleanupExecutor, CleanupJob, CleanupState, InlineExecutor, ThreadedExecutor};
pub use layout::{BytesLayout, Layout, U64Layout};
pub use merger::{Combine, KeepExisting, MergeResult, Overwrite, RemoveOnMatch, ValueMerger};
pub use meta::TreeMeta;
pub use monitor::{CleanupStats, Monitor, NoMonitor};
pub use multi_root::{DataTree, MultiRootTree};
pub use node::FormatKind;
pub use seek::Seeker;
pub use stats::TreeStatsSnapshot;
pub use tree::{
    overwrite_header, read_header, CleanupMode, ParallelWriter, Tree, TreeOptions, Writer,
};

#[cfg(test)]
mod tests;
