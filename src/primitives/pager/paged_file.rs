use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::cursor::{PageCursor, PfMode};
use super::frame::Frame;
use crate::primitives::io::FileIo;
use crate::types::{PageId, Result, TreeError};

/// Page cache over a [`FileIo`].
///
/// Every page touched stays cached until [`PagedFile::close`]. Pages are only
/// written back by [`PagedFile::flush`] and [`PagedFile::flush_and_force`], so
/// the file on disk reflects exactly what the last flush wrote.
#[derive(Clone)]
pub struct PagedFile {
    pub(crate) inner: Arc<PagedFileInner>,
}

pub(crate) struct PagedFileInner {
    io: Arc<dyn FileIo>,
    page_size: usize,
    frames: RwLock<HashMap<u64, Arc<Frame>>>,
    closed: AtomicBool,
    flush_lock: Mutex<()>,
}

impl PagedFile {
    /// Maps `io` with the given page size.
    pub fn open(io: Arc<dyn FileIo>, page_size: usize) -> Result<Self> {
        if page_size == 0 || page_size > u16::MAX as usize + 1 {
            return Err(TreeError::InvalidArgument("page size out of range"));
        }
        Ok(Self {
            inner: Arc::new(PagedFileInner {
                io,
                page_size,
                frames: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                flush_lock: Mutex::new(()),
            }),
        })
    }

    /// Size of every page in bytes.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// The underlying file.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.inner.io
    }

    /// Returns an unpositioned cursor; position it with [`PageCursor::next`].
    pub fn cursor(&self, mode: PfMode) -> PageCursor {
        PageCursor::new(self.clone(), mode)
    }

    /// Acquires a cursor positioned at `page_id`.
    pub fn acquire(&self, page_id: PageId, mode: PfMode) -> Result<PageCursor> {
        let mut cursor = self.cursor(mode);
        cursor.next(page_id)?;
        Ok(cursor)
    }

    /// Whether [`PagedFile::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Highest page id that exists in the cache or on disk, plus one.
    pub fn page_count(&self) -> Result<u64> {
        let on_disk = self.inner.io.len()? / self.inner.page_size as u64;
        let cached = self
            .inner
            .frames
            .read()
            .keys()
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        Ok(on_disk.max(cached))
    }

    /// Writes every dirty page back to the file without syncing.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.inner.flush_lock.lock();
        let mut dirty: Vec<(u64, Arc<Frame>)> = self
            .inner
            .frames
            .read()
            .iter()
            .filter(|(_, frame)| frame.is_dirty())
            .map(|(id, frame)| (*id, Arc::clone(frame)))
            .collect();
        dirty.sort_by_key(|(id, _)| *id);
        let page_size = self.inner.page_size;
        for (id, frame) in dirty {
            let copy = {
                let buf = frame.buf.read();
                frame.clear_dirty();
                buf.to_vec()
            };
            if let Err(err) = self.inner.io.write_at(PageId(id).offset(page_size), &copy) {
                // Leave the page dirty so a retried flush writes it again.
                let _latch = frame.buf.write();
                frame.mark_written();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Writes every dirty page back and syncs the file.
    pub fn flush_and_force(&self) -> Result<()> {
        self.flush()?;
        self.inner.io.sync_all()
    }

    /// Unmaps the file. Cursors still in use fail with [`TreeError::FileClosed`]
    /// on their next access. Dirty pages that were not flushed are dropped.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.frames.write().clear();
        tracing::debug!(target: "genbtree::pager", "paged file closed");
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TreeError::FileClosed);
        }
        Ok(())
    }

    pub(crate) fn frame(&self, page_id: PageId) -> Result<Arc<Frame>> {
        self.ensure_open()?;
        if let Some(frame) = self.inner.frames.read().get(&page_id.0) {
            return Ok(Arc::clone(frame));
        }
        let mut frames = self.inner.frames.write();
        if self.is_closed() {
            return Err(TreeError::FileClosed);
        }
        if let Some(frame) = frames.get(&page_id.0) {
            return Ok(Arc::clone(frame));
        }
        let page_size = self.inner.page_size;
        let mut bytes = vec![0u8; page_size].into_boxed_slice();
        let offset = page_id.offset(page_size);
        if offset + page_size as u64 <= self.inner.io.len()? {
            self.inner.io.read_at(offset, &mut bytes)?;
        }
        let frame = Arc::new(Frame::new(bytes));
        frames.insert(page_id.0, Arc::clone(&frame));
        Ok(frame)
    }
}
