use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use super::frame::Frame;
use super::paged_file::PagedFile;
use crate::types::{PageId, Result, TreeError};

/// Latch mode a cursor was acquired with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PfMode {
    /// Optimistic reads against a private snapshot of the page.
    Read,
    /// Exclusive page latches taken per access.
    Write,
}

/// Cursor over the pages of a [`PagedFile`].
///
/// A read cursor copies the page under the shared latch when positioned and
/// serves every read from that copy; [`PageCursor::should_retry`] reports
/// whether the page changed since and refreshes the copy if so. A write cursor
/// hands out short-lived latch guards via [`PageCursor::read`] and
/// [`PageCursor::write`]; holding two guards on the same page deadlocks.
pub struct PageCursor {
    file: PagedFile,
    mode: PfMode,
    current: Option<PageId>,
    frame: Option<Arc<Frame>>,
    snapshot: Vec<u8>,
    version: u64,
}

impl PageCursor {
    pub(crate) fn new(file: PagedFile, mode: PfMode) -> Self {
        Self {
            file,
            mode,
            current: None,
            frame: None,
            snapshot: Vec::new(),
            version: 0,
        }
    }

    /// Moves the cursor to `page_id`.
    pub fn next(&mut self, page_id: PageId) -> Result<()> {
        let frame = self.file.frame(page_id)?;
        self.current = Some(page_id);
        if self.mode == PfMode::Read {
            Self::copy_from(&frame, &mut self.snapshot, &mut self.version);
        }
        self.frame = Some(frame);
        Ok(())
    }

    /// Page the cursor is positioned at.
    pub fn page_id(&self) -> PageId {
        self.current.unwrap_or_default()
    }

    /// Mode this cursor was acquired with.
    pub fn mode(&self) -> PfMode {
        self.mode
    }

    /// The paged file this cursor reads from.
    pub fn paged_file(&self) -> &PagedFile {
        &self.file
    }

    /// A new unpositioned cursor over the same file with the same mode.
    pub fn open_linked(&self) -> PageCursor {
        PageCursor::new(self.file.clone(), self.mode)
    }

    /// Snapshot bytes of a read cursor.
    pub fn data(&self) -> &[u8] {
        &self.snapshot
    }

    /// Returns true if the page changed since the snapshot was taken. The
    /// snapshot is refreshed so the caller can simply redo its reads.
    pub fn should_retry(&mut self) -> Result<bool> {
        self.file.ensure_open()?;
        let Some(frame) = self.frame.as_ref() else {
            return Ok(false);
        };
        if frame.version() == self.version {
            return Ok(false);
        }
        let frame = Arc::clone(frame);
        Self::copy_from(&frame, &mut self.snapshot, &mut self.version);
        Ok(true)
    }

    /// Shared latch on the current page.
    pub fn read(&self) -> Result<PageRead> {
        let frame = self.positioned()?;
        Ok(PageRead {
            guard: frame.buf.read_arc(),
        })
    }

    /// Exclusive latch on the current page. The write becomes visible to
    /// readers when the guard drops.
    pub fn write(&self) -> Result<PageWrite> {
        if self.mode != PfMode::Write {
            return Err(TreeError::IllegalState("write through a read cursor"));
        }
        let frame = self.positioned()?;
        Ok(PageWrite {
            guard: frame.buf.write_arc(),
            frame: Arc::clone(frame),
        })
    }

    fn positioned(&self) -> Result<&Arc<Frame>> {
        self.file.ensure_open()?;
        self.frame
            .as_ref()
            .ok_or(TreeError::IllegalState("cursor is not positioned"))
    }

    fn copy_from(frame: &Frame, snapshot: &mut Vec<u8>, version: &mut u64) {
        let buf = frame.buf.read();
        *version = frame.version();
        snapshot.clear();
        snapshot.extend_from_slice(&buf);
    }
}

/// Shared page latch.
pub struct PageRead {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl Deref for PageRead {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive page latch; bumps the page version on release.
pub struct PageWrite {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    frame: Arc<Frame>,
}

impl Deref for PageWrite {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageWrite {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl Drop for PageWrite {
    fn drop(&mut self) {
        self.frame.mark_written();
    }
}
