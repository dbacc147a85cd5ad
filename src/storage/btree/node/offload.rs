//! Out-of-line value pages.
//!
//! ```text
//! [0] page type  [1..4] reserved  [4..8] length u32  [8..] value bytes
//! ```

use super::{read_u32, write_u32, PAGE_TYPE_OFFLOAD, PAGE_TYPE_OFFSET};
use crate::primitives::pager::{PageCursor, PfMode};
use crate::storage::btree::freelist::IdProvider;
use crate::types::{Generation, PageId, Result, TreeError};

/// Bytes an offload reference takes inside a leaf.
pub const REFERENCE_SIZE: usize = 8;
const LENGTH_OFFSET: usize = 4;
const HEADER_LENGTH: usize = 8;

/// Largest value one offload page holds.
pub fn capacity(page_size: usize) -> usize {
    page_size - HEADER_LENGTH
}

/// Writes `value` to a freshly acquired page and returns its id.
pub fn store(
    cursor: &mut PageCursor,
    ids: &dyn IdProvider,
    value: &[u8],
    gen: Generation,
) -> Result<PageId> {
    let page_size = cursor.paged_file().page_size();
    if value.len() > capacity(page_size) {
        return Err(TreeError::InvalidArgument("value larger than an offload page"));
    }
    let id = ids.acquire_new_id(gen)?;
    cursor.next(id)?;
    let mut page = cursor.write()?;
    page.fill(0);
    page[PAGE_TYPE_OFFSET] = PAGE_TYPE_OFFLOAD;
    write_u32(&mut page, LENGTH_OFFSET, value.len() as u32);
    page[HEADER_LENGTH..HEADER_LENGTH + value.len()].copy_from_slice(value);
    Ok(id)
}

/// Value bytes of an offload page.
pub fn value(buf: &[u8]) -> Result<&[u8]> {
    if buf[PAGE_TYPE_OFFSET] != PAGE_TYPE_OFFLOAD {
        return Err(TreeError::inconsistency(format!(
            "expected offload page but found page type {}",
            buf[PAGE_TYPE_OFFSET]
        )));
    }
    let len = read_u32(buf, LENGTH_OFFSET) as usize;
    buf.get(HEADER_LENGTH..HEADER_LENGTH + len)
        .ok_or(TreeError::Corruption("offload length beyond page"))
}

/// Reads the value at `id` through a write-mode cursor.
pub fn load(cursor: &mut PageCursor, id: PageId, into: &mut Vec<u8>) -> Result<()> {
    cursor.next(id)?;
    into.clear();
    match cursor.mode() {
        PfMode::Read => into.extend_from_slice(value(cursor.data())?),
        PfMode::Write => into.extend_from_slice(value(&cursor.read()?)?),
    }
    Ok(())
}

/// Gives the page back once no reader of the stable generation can see it.
pub fn free(ids: &dyn IdProvider, id: PageId, gen: Generation) -> Result<()> {
    ids.release_id(id, gen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::primitives::pager::PagedFile;
    use crate::storage::btree::freelist::FreeList;
    use std::sync::Arc;

    #[test]
    fn stored_value_reads_back() -> Result<()> {
        let file = PagedFile::open(Arc::new(MemFileIo::new()), 256)?;
        let ids = FreeList::create(file.clone(), PageId(4))?;
        let gen = Generation::initial();
        let mut cursor = file.cursor(PfMode::Write);
        let value = vec![0xab; 200];
        let id = store(&mut cursor, &ids, &value, gen)?;
        let mut out = Vec::new();
        load(&mut cursor, id, &mut out)?;
        assert_eq!(out, value);
        assert!(store(&mut cursor, &ids, &[0u8; 249], gen).is_err());
        Ok(())
    }

    #[test]
    fn rejects_other_page_types() {
        let mut page = vec![0u8; 64];
        page[0] = 1;
        assert!(matches!(value(&page), Err(TreeError::TreeInconsistency(_))));
    }
}
