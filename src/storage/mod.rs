//! Persistent index structures.

/// Generation-safe B+ tree over a paged file.
pub mod btree;
