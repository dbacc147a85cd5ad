#![forbid(unsafe_code)]

//! Page cache the tree engine reads and writes through.

mod cursor;
mod frame;
mod paged_file;

pub use cursor::{PageCursor, PageRead, PageWrite, PfMode};
pub use paged_file::PagedFile;
