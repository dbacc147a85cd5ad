//! Crash-safe on-disk B+ tree.
//!
//! A tree file holds either one tree or many data trees under a root
//! mapping. Changes become durable at checkpoints; anything written after
//! the last checkpoint is discarded on the next open by cleaning up pointers
//! that carry a crashed generation.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::btree::{MultiRootTree, Tree, TreeOptions};
pub use types::{Result, TreeError};
