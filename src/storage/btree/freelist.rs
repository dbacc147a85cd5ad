//! Page id allocation.
//!
//! Released ids are appended to a chain of free-list pages together with the
//! generation they were released in. An id is handed out again only once that
//! generation is stable, so no reader of a stable tree can still reach it.
//!
//! ```text
//! [0] page type  [8..16] next page id  [16..] (generation u64, id u64) entries
//! ```

use parking_lot::Mutex;

use super::node::{read_u64, write_u64, PAGE_TYPE_FREELIST, PAGE_TYPE_OFFSET};
use crate::primitives::pager::{PagedFile, PfMode};
use crate::types::{Generation, PageId, Result, TreeError};

const NEXT_PAGE_OFFSET: usize = 8;
const HEADER_LENGTH: usize = 16;
const ENTRY_SIZE: usize = 16;

/// Source of page ids for tree nodes, offload pages and free-list pages.
pub trait IdProvider: Send + Sync {
    /// Returns an id that no reader can reach.
    fn acquire_new_id(&self, gen: Generation) -> Result<PageId>;
    /// Gives `id` back; it becomes reusable after the next checkpoint.
    fn release_id(&self, id: PageId, gen: Generation) -> Result<()>;
    /// Visits every released id that has not been handed out again.
    fn visit_free_ids(&self, visitor: &mut dyn FnMut(PageId)) -> Result<()>;
}

/// Persisted free-list positions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FreeListMeta {
    /// Highest id ever handed out.
    pub last_id: PageId,
    /// Page new entries are appended to.
    pub write_page: PageId,
    /// Page the next reusable entry is read from.
    pub read_page: PageId,
    /// Next entry slot on the write page.
    pub write_pos: usize,
    /// Next entry slot on the read page.
    pub read_pos: usize,
}

/// Free list backed by pages of the tree file.
pub struct FreeList {
    file: PagedFile,
    per_page: usize,
    meta: Mutex<FreeListMeta>,
}

impl FreeList {
    /// Initializes an empty free list on `first_page`, which also becomes the
    /// highest allocated id.
    pub fn create(file: PagedFile, first_page: PageId) -> Result<Self> {
        let list = Self::restore(
            file,
            FreeListMeta {
                last_id: first_page,
                write_page: first_page,
                read_page: first_page,
                write_pos: 0,
                read_pos: 0,
            },
        )?;
        list.initialize_page(first_page)?;
        Ok(list)
    }

    /// Resumes a free list from persisted positions.
    pub fn restore(file: PagedFile, meta: FreeListMeta) -> Result<Self> {
        let per_page = (file.page_size().saturating_sub(HEADER_LENGTH)) / ENTRY_SIZE;
        if per_page < 2 {
            return Err(TreeError::InvalidArgument("page size too small for free list"));
        }
        if meta.write_pos >= per_page || meta.read_pos > per_page {
            return Err(TreeError::inconsistency(format!(
                "free list positions out of range: {meta:?}"
            )));
        }
        Ok(Self {
            file,
            per_page,
            meta: Mutex::new(meta),
        })
    }

    /// Current positions, persisted by checkpoints.
    pub fn meta(&self) -> FreeListMeta {
        *self.meta.lock()
    }

    /// Highest id handed out so far.
    pub fn last_id(&self) -> PageId {
        self.meta.lock().last_id
    }

    /// Visits the free-list pages from the read page to the write page.
    pub fn visit_pages(&self, visitor: &mut dyn FnMut(PageId)) -> Result<()> {
        let meta = self.meta();
        let mut page = meta.read_page;
        loop {
            visitor(page);
            if page == meta.write_page {
                return Ok(());
            }
            page = self.next_page(page)?;
        }
    }

    fn initialize_page(&self, id: PageId) -> Result<()> {
        let cursor = self.file.acquire(id, PfMode::Write)?;
        let mut page = cursor.write()?;
        page.fill(0);
        page[PAGE_TYPE_OFFSET] = PAGE_TYPE_FREELIST;
        Ok(())
    }

    fn next_page(&self, id: PageId) -> Result<PageId> {
        let cursor = self.file.acquire(id, PfMode::Write)?;
        let page = cursor.read()?;
        Self::check_page(&page, id)?;
        Ok(PageId(read_u64(&page, NEXT_PAGE_OFFSET)))
    }

    fn entry(&self, id: PageId, pos: usize) -> Result<(u64, PageId)> {
        let cursor = self.file.acquire(id, PfMode::Write)?;
        let page = cursor.read()?;
        Self::check_page(&page, id)?;
        let at = HEADER_LENGTH + pos * ENTRY_SIZE;
        Ok((read_u64(&page, at), PageId(read_u64(&page, at + 8))))
    }

    fn check_page(page: &[u8], id: PageId) -> Result<()> {
        if page[PAGE_TYPE_OFFSET] != PAGE_TYPE_FREELIST {
            return Err(TreeError::inconsistency(format!(
                "page {id} in the free list chain has page type {}",
                page[PAGE_TYPE_OFFSET]
            )));
        }
        Ok(())
    }

    fn append(&self, meta: &mut FreeListMeta, id: PageId, gen: Generation) -> Result<()> {
        {
            let cursor = self.file.acquire(meta.write_page, PfMode::Write)?;
            let mut page = cursor.write()?;
            let at = HEADER_LENGTH + meta.write_pos * ENTRY_SIZE;
            write_u64(&mut page, at, gen.unstable);
            write_u64(&mut page, at + 8, id.0);
        }
        meta.write_pos += 1;
        if meta.write_pos == self.per_page {
            // Chain pages always come from fresh ids so the append cannot recurse.
            let next = PageId(meta.last_id.0 + 1);
            meta.last_id = next;
            self.initialize_page(next)?;
            let cursor = self.file.acquire(meta.write_page, PfMode::Write)?;
            write_u64(&mut cursor.write()?, NEXT_PAGE_OFFSET, next.0);
            meta.write_page = next;
            meta.write_pos = 0;
        }
        Ok(())
    }

    fn take_reusable(&self, meta: &mut FreeListMeta, gen: Generation) -> Result<Option<PageId>> {
        loop {
            if meta.read_page == meta.write_page && meta.read_pos >= meta.write_pos {
                return Ok(None);
            }
            if meta.read_pos >= self.per_page {
                let drained = meta.read_page;
                meta.read_page = self.next_page(drained)?;
                meta.read_pos = 0;
                self.append(meta, drained, gen)?;
                continue;
            }
            let (generation, id) = self.entry(meta.read_page, meta.read_pos)?;
            if generation > gen.stable {
                return Ok(None);
            }
            meta.read_pos += 1;
            return Ok(Some(id));
        }
    }
}

impl IdProvider for FreeList {
    fn acquire_new_id(&self, gen: Generation) -> Result<PageId> {
        let mut meta = self.meta.lock();
        if let Some(id) = self.take_reusable(&mut meta, gen)? {
            return Ok(id);
        }
        meta.last_id = PageId(meta.last_id.0 + 1);
        Ok(meta.last_id)
    }

    fn release_id(&self, id: PageId, gen: Generation) -> Result<()> {
        let mut meta = self.meta.lock();
        self.append(&mut meta, id, gen)
    }

    fn visit_free_ids(&self, visitor: &mut dyn FnMut(PageId)) -> Result<()> {
        let meta = self.meta();
        let (mut page, mut pos) = (meta.read_page, meta.read_pos);
        loop {
            if page == meta.write_page && pos >= meta.write_pos {
                return Ok(());
            }
            if pos >= self.per_page {
                page = self.next_page(page)?;
                pos = 0;
                continue;
            }
            visitor(self.entry(page, pos)?.1);
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use std::sync::Arc;

    fn free_list(page_size: usize) -> Result<FreeList> {
        let file = PagedFile::open(Arc::new(MemFileIo::new()), page_size)?;
        FreeList::create(file, PageId(4))
    }

    fn free_ids(list: &FreeList) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        list.visit_free_ids(&mut |id| ids.push(id.0))?;
        Ok(ids)
    }

    #[test]
    fn ids_are_reused_only_after_a_checkpoint() -> Result<()> {
        let list = free_list(256)?;
        let gen = Generation::initial();
        assert_eq!(list.acquire_new_id(gen)?, PageId(5));
        assert_eq!(list.acquire_new_id(gen)?, PageId(6));
        list.release_id(PageId(5), gen)?;
        assert_eq!(list.acquire_new_id(gen)?, PageId(7));
        assert_eq!(free_ids(&list)?, vec![5]);

        let next = gen.next_checkpoint();
        assert_eq!(list.acquire_new_id(next)?, PageId(5));
        assert!(free_ids(&list)?.is_empty());
        Ok(())
    }

    #[test]
    fn drained_pages_return_to_the_list() -> Result<()> {
        let list = free_list(64)?;
        let gen = Generation::initial();
        for id in 10..=16 {
            list.release_id(PageId(id), gen)?;
        }
        let mut pages = Vec::new();
        list.visit_pages(&mut |id| pages.push(id.0))?;
        assert_eq!(pages, vec![4, 5, 6]);

        let next = gen.next_checkpoint();
        let reused: Vec<u64> = (0..7)
            .map(|_| list.acquire_new_id(next).map(|id| id.0))
            .collect::<Result<_>>()?;
        assert_eq!(reused, (10..=16).collect::<Vec<_>>());
        // The drained chain pages were released in the current generation.
        assert_eq!(list.acquire_new_id(next)?, PageId(8));
        assert_eq!(free_ids(&list)?, vec![4, 5]);

        let later = next.next_checkpoint();
        assert_eq!(list.acquire_new_id(later)?, PageId(4));
        assert_eq!(list.acquire_new_id(later)?, PageId(5));
        Ok(())
    }

    #[test]
    fn restore_rejects_bad_positions() -> Result<()> {
        let list = free_list(64)?;
        let mut meta = list.meta();
        meta.write_pos = 99;
        let file = PagedFile::open(Arc::new(MemFileIo::new()), 64)?;
        assert!(FreeList::restore(file, meta).is_err());
        Ok(())
    }
}
