//! The A/B tree state pages.
//!
//! Checkpoints alternate between the two pages so the previous state is
//! intact while the next one is written. On open the newest valid page wins.
//!
//! ```text
//! [0..8]   stable generation     [40..48] free list write page
//! [8..16]  unstable generation   [48..56] free list read page
//! [16..24] root id               [56..60] free list write pos
//! [24..32] root generation       [60..64] free list read pos
//! [32..40] last id               [64]     clean flag
//! [65..69] header length, then the header bytes and a crc32 over everything
//! ```

use std::cmp::Ordering;
use std::ops::Range;

use super::freelist::FreeListMeta;
use super::logic::Root;
use crate::primitives::pager::{PagedFile, PfMode};
use crate::types::{page_crc32, Generation, PageId, Result, TreeError, MIN_GENERATION};

/// First state page.
pub const STATE_PAGE_A: PageId = PageId(1);
/// Second state page.
pub const STATE_PAGE_B: PageId = PageId(2);

const STATE_SALT: u64 = 0x7374_6174_6521;
const STATE_STABLE: Range<usize> = 0..8;
const STATE_UNSTABLE: Range<usize> = 8..16;
const STATE_ROOT_ID: Range<usize> = 16..24;
const STATE_ROOT_GEN: Range<usize> = 24..32;
const STATE_LAST_ID: Range<usize> = 32..40;
const STATE_WRITE_PAGE: Range<usize> = 40..48;
const STATE_READ_PAGE: Range<usize> = 48..56;
const STATE_WRITE_POS: Range<usize> = 56..60;
const STATE_READ_POS: Range<usize> = 60..64;
const STATE_CLEAN: usize = 64;
const STATE_HEADER_LEN: Range<usize> = 65..69;
const STATE_HEADER: usize = 69;
const CRC_LENGTH: usize = 4;

/// Largest header blob a state page of `page_size` holds.
pub fn max_header_length(page_size: usize) -> usize {
    page_size.saturating_sub(STATE_HEADER + CRC_LENGTH)
}

/// One decoded state page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeState {
    /// Page this state was read from or is written to.
    pub page_id: PageId,
    /// Stable generation at the time of writing.
    pub stable: u64,
    /// Unstable generation at the time of writing.
    pub unstable: u64,
    /// Root of the tree.
    pub root: Root,
    /// Free-list positions.
    pub freelist: FreeListMeta,
    /// Whether the tree was closed without pending changes.
    pub clean: bool,
    /// Application header blob.
    pub header: Vec<u8>,
}

impl TreeState {
    /// Generation pair recorded in this state.
    pub fn generation(&self) -> Result<Generation> {
        Generation::new(self.stable, self.unstable)
    }

    /// Encodes into `buf`, which must be a whole page.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        let end = STATE_HEADER + self.header.len();
        if self.header.len() > max_header_length(buf.len()) {
            return Err(TreeError::InvalidArgument("header does not fit in a state page"));
        }
        buf.fill(0);
        buf[STATE_STABLE].copy_from_slice(&self.stable.to_be_bytes());
        buf[STATE_UNSTABLE].copy_from_slice(&self.unstable.to_be_bytes());
        buf[STATE_ROOT_ID].copy_from_slice(&self.root.id.0.to_be_bytes());
        buf[STATE_ROOT_GEN].copy_from_slice(&self.root.generation.to_be_bytes());
        buf[STATE_LAST_ID].copy_from_slice(&self.freelist.last_id.0.to_be_bytes());
        buf[STATE_WRITE_PAGE].copy_from_slice(&self.freelist.write_page.0.to_be_bytes());
        buf[STATE_READ_PAGE].copy_from_slice(&self.freelist.read_page.0.to_be_bytes());
        buf[STATE_WRITE_POS].copy_from_slice(&(self.freelist.write_pos as u32).to_be_bytes());
        buf[STATE_READ_POS].copy_from_slice(&(self.freelist.read_pos as u32).to_be_bytes());
        buf[STATE_CLEAN] = u8::from(self.clean);
        buf[STATE_HEADER_LEN].copy_from_slice(&(self.header.len() as u32).to_be_bytes());
        buf[STATE_HEADER..end].copy_from_slice(&self.header);
        let crc = page_crc32(self.page_id.0, STATE_SALT, &buf[..end]);
        buf[end..end + CRC_LENGTH].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Decodes `buf`; `None` if the page does not hold a valid state.
    pub fn read(page_id: PageId, buf: &[u8]) -> Option<Self> {
        if buf.len() < STATE_HEADER + CRC_LENGTH {
            return None;
        }
        let header_len = be_u32(&buf[STATE_HEADER_LEN]) as usize;
        if header_len > max_header_length(buf.len()) {
            return None;
        }
        let end = STATE_HEADER + header_len;
        if page_crc32(page_id.0, STATE_SALT, &buf[..end]) != be_u32(&buf[end..end + CRC_LENGTH]) {
            return None;
        }
        let stable = be_u64(&buf[STATE_STABLE]);
        let unstable = be_u64(&buf[STATE_UNSTABLE]);
        if stable < MIN_GENERATION || unstable <= stable {
            return None;
        }
        Some(Self {
            page_id,
            stable,
            unstable,
            root: Root {
                id: PageId(be_u64(&buf[STATE_ROOT_ID])),
                generation: be_u64(&buf[STATE_ROOT_GEN]),
            },
            freelist: FreeListMeta {
                last_id: PageId(be_u64(&buf[STATE_LAST_ID])),
                write_page: PageId(be_u64(&buf[STATE_WRITE_PAGE])),
                read_page: PageId(be_u64(&buf[STATE_READ_PAGE])),
                write_pos: be_u32(&buf[STATE_WRITE_POS]) as usize,
                read_pos: be_u32(&buf[STATE_READ_POS]) as usize,
            },
            clean: buf[STATE_CLEAN] != 0,
            header: buf[STATE_HEADER..end].to_vec(),
        })
    }

    /// Writes this state to its page through the page cache.
    pub fn store(&self, file: &PagedFile) -> Result<()> {
        let cursor = file.acquire(self.page_id, PfMode::Write)?;
        let mut page = cursor.write()?;
        self.write(&mut page)
    }
}

/// Both state pages as found on disk.
#[derive(Clone, Debug)]
pub struct StatePair {
    /// Page A, if valid.
    pub a: Option<TreeState>,
    /// Page B, if valid.
    pub b: Option<TreeState>,
}

impl StatePair {
    /// Reads both state pages.
    pub fn load(file: &PagedFile) -> Result<Self> {
        let read = |id: PageId| -> Result<Option<TreeState>> {
            let cursor = file.acquire(id, PfMode::Write)?;
            let page = cursor.read()?;
            Ok(TreeState::read(id, &page))
        };
        Ok(Self {
            a: read(STATE_PAGE_A)?,
            b: read(STATE_PAGE_B)?,
        })
    }

    /// The newest valid state. On equal generations a clean state wins over
    /// a dirty one; two different states with the same generations and
    /// cleanliness are an inconsistency.
    pub fn newest(&self) -> Result<&TreeState> {
        match (&self.a, &self.b) {
            (None, None) => Err(TreeError::inconsistency("no valid tree state page")),
            (Some(a), None) => Ok(a),
            (None, Some(b)) => Ok(b),
            (Some(a), Some(b)) => {
                match (a.stable, a.unstable).cmp(&(b.stable, b.unstable)) {
                    Ordering::Greater => return Ok(a),
                    Ordering::Less => return Ok(b),
                    Ordering::Equal => {}
                }
                match (a.clean, b.clean) {
                    (true, false) => Ok(a),
                    (false, true) => Ok(b),
                    _ if same_contents(a, b) => Ok(a),
                    _ => Err(TreeError::inconsistency(format!(
                        "both tree states claim generation stable={} unstable={}",
                        a.stable, a.unstable
                    ))),
                }
            }
        }
    }

    /// The page the next state should be written to: an invalid page, or
    /// the one not selected by [`StatePair::newest`].
    pub fn oldest_page(&self) -> PageId {
        match self.newest() {
            Ok(newest) if newest.page_id == STATE_PAGE_A => STATE_PAGE_B,
            Ok(_) => STATE_PAGE_A,
            Err(_) => STATE_PAGE_A,
        }
    }
}

fn same_contents(a: &TreeState, b: &TreeState) -> bool {
    a.root == b.root && a.freelist == b.freelist && a.header == b.header
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    u64::from_be_bytes(arr)
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    u32::from_be_bytes(arr)
}
