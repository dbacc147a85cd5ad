#![forbid(unsafe_code)]

//! Shared identifiers, the generation context and the crate-wide error type.

use std::fmt;

pub mod checksum;

pub use checksum::{gsp_checksum, page_crc32, Checksum, Crc32Fast};

/// Identifier of a page within a paged file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl PageId {
    /// Returns the byte offset of this page for the given page size.
    pub fn offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Smallest generation a written pointer slot may carry.
pub const MIN_GENERATION: u64 = 1;

/// Stable/unstable generation pair threaded through every tree operation.
///
/// Pages written at `unstable` may be modified in place; anything at or below
/// `stable` is immutable and must be copied to a successor before it changes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Generation {
    /// Last generation made durable by a checkpoint.
    pub stable: u64,
    /// Generation currently being written.
    pub unstable: u64,
}

impl Generation {
    /// Creates a generation context, validating `stable < unstable`.
    pub fn new(stable: u64, unstable: u64) -> Result<Self> {
        if stable < MIN_GENERATION || unstable <= stable {
            return Err(TreeError::TreeInconsistency(format!(
                "invalid generation pair stable={stable} unstable={unstable}"
            )));
        }
        Ok(Self { stable, unstable })
    }

    /// Generation pair of a freshly created tree.
    pub fn initial() -> Self {
        Self {
            stable: MIN_GENERATION,
            unstable: MIN_GENERATION + 1,
        }
    }

    /// The pair after a checkpoint: the unstable generation becomes stable.
    pub fn next_checkpoint(self) -> Self {
        Self {
            stable: self.unstable,
            unstable: self.unstable + 1,
        }
    }

    /// The pair used after opening a tree; writes from a crashed session
    /// carry a generation strictly between `stable` and the new unstable.
    pub fn after_open(self) -> Self {
        Self {
            stable: self.stable,
            unstable: self.unstable + 1,
        }
    }

    /// Returns true if pages of `generation` were written by a session that
    /// never reached a checkpoint.
    pub fn is_crashed(self, generation: u64) -> bool {
        generation > self.stable && generation != self.unstable
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stable={} unstable={}", self.stable, self.unstable)
    }
}

/// Errors surfaced by the tree engine.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Structural corruption detected while traversing or mutating the tree.
    #[error("tree inconsistency: {0}")]
    TreeInconsistency(String),
    /// On-disk metadata disagrees with the caller's configuration.
    #[error("metadata mismatch: {0}")]
    MetadataMismatch(String),
    /// A data tree with the given root key does not exist.
    #[error("data tree {0} not found")]
    DataTreeNotFound(u64),
    /// A data tree with the given root key already exists.
    #[error("data tree {0} already exists")]
    DataTreeAlreadyExists(u64),
    /// Attempted to delete a data tree that still holds entries.
    #[error("data tree {0} is not empty")]
    DataTreeNotEmpty(u64),
    /// The crash-generation cleanup failed and the tree is still dirty.
    #[error("cleanup failed: {0}")]
    CleanupFailed(String),
    /// Programmer error such as acquiring two writers at once.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The paged file was closed underneath an operation.
    #[error("paged file closed")]
    FileClosed,
    /// Malformed bytes that cannot be decoded.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Options could not be parsed.
    #[error("config: {0}")]
    Config(String),
}

impl TreeError {
    /// Builds a tree inconsistency error from any displayable message.
    pub fn inconsistency(message: impl fmt::Display) -> Self {
        TreeError::TreeInconsistency(message.to_string())
    }
}

/// Convenience alias for results produced by the engine.
pub type Result<T> = std::result::Result<T, TreeError>;
