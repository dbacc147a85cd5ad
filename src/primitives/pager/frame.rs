use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One cached page: its bytes behind a latch plus the bookkeeping readers use
/// to detect that the page changed underneath them.
pub(crate) struct Frame {
    pub buf: Arc<RwLock<Box<[u8]>>>,
    version: AtomicU64,
    dirty: AtomicBool,
}

impl Frame {
    pub fn new(bytes: Box<[u8]>) -> Self {
        Self {
            buf: Arc::new(RwLock::new(bytes)),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Called while the exclusive latch is still held.
    pub fn mark_written(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Called while the shared latch is held so no write can slip in between.
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}
