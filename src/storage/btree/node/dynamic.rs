//! Variable-size entries in an allocation region.
//!
//! ```text
//! leaf:     [header][alloc u32][dead u32][offset 0 .. offset n-1] ->free<- [entries]
//! internal: [header][alloc u32][dead u32][child 0][key offset 0][child 1] .. [child n]
//!           ->free<- [keys]
//!
//! leaf entry:     [key size u16 | flags][value size u16][key][value]
//! internal entry: [key size u16 | flags][key]
//! ```
//!
//! Entries are allocated downwards from the end of the page. Removing an
//! entry only marks it as a tombstone and accounts its bytes as dead space,
//! which [`NodeFormat::defragment`] reclaims.

use super::offload;
use super::{
    initialize_header, key_count, read_internal_entries, read_leaf_entries, read_u16, read_u32,
    read_u64, set_key_count, write_u16, write_u32, ChildPair, FormatKind, InternalEntries, Layer,
    LeafEntry, NodeFormat, NodeKind, Overflow, ValueRef, BASE_HEADER_LENGTH,
};
use crate::storage::btree::gspp::GSPP_SIZE;
use crate::types::{PageId, Result, TreeError};

const ALLOC_OFFSET: usize = BASE_HEADER_LENGTH;
const DEAD_SPACE_OFFSET: usize = ALLOC_OFFSET + 4;
/// Header length of dynamic nodes.
pub const HEADER_LENGTH: usize = DEAD_SPACE_OFFSET + 4;

const OFFSET_SIZE: usize = 2;
const LEAF_ENTRY_HEADER: usize = 4;
const INTERNAL_ENTRY_HEADER: usize = 2;
const CHILD_BLOCK: usize = GSPP_SIZE + OFFSET_SIZE;

const FLAG_TOMBSTONE: u16 = 0x8000;
const FLAG_OFFLOAD: u16 = 0x4000;
const SIZE_MASK: u16 = 0x3fff;

/// Node format for layouts with variable-size keys or values.
#[derive(Debug, Clone)]
pub struct DynamicSizeNode {
    page_size: usize,
    inline_cap: usize,
    max_key_size: usize,
}

struct RawEntry {
    start: usize,
    flags: u16,
    key: (usize, usize),
    value: (usize, usize),
}

impl RawEntry {
    fn len(&self) -> usize {
        self.value.1 - self.start
    }
}

impl DynamicSizeNode {
    /// Sizes the allocation limits for `page_size`.
    pub fn new(page_size: usize) -> Result<Self> {
        if page_size > u16::MAX as usize + 1 {
            return Err(TreeError::InvalidArgument("page size too large for dynamic nodes"));
        }
        let leaf_cap = page_size.saturating_sub(HEADER_LENGTH);
        let internal_cap = leaf_cap.saturating_sub(GSPP_SIZE);
        let inline_cap = (leaf_cap / 3).saturating_sub(OFFSET_SIZE + LEAF_ENTRY_HEADER);
        let max_key_size = (internal_cap / 3)
            .saturating_sub(CHILD_BLOCK + INTERNAL_ENTRY_HEADER)
            .min(SIZE_MASK as usize);
        if max_key_size < 16 {
            return Err(TreeError::InvalidArgument(
                "page size too small for dynamic size nodes",
            ));
        }
        Ok(Self {
            page_size,
            inline_cap,
            max_key_size,
        })
    }

    fn alloc_offset(buf: &[u8]) -> usize {
        read_u32(buf, ALLOC_OFFSET) as usize
    }

    fn set_alloc_offset(buf: &mut [u8], offset: usize) {
        write_u32(buf, ALLOC_OFFSET, offset as u32);
    }

    fn dead_space(buf: &[u8]) -> usize {
        read_u32(buf, DEAD_SPACE_OFFSET) as usize
    }

    fn set_dead_space(buf: &mut [u8], dead: usize) {
        write_u32(buf, DEAD_SPACE_OFFSET, dead as u32);
    }

    fn slot_offset(pos: usize, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => HEADER_LENGTH + pos * OFFSET_SIZE,
            NodeKind::Internal => HEADER_LENGTH + pos * CHILD_BLOCK + GSPP_SIZE,
        }
    }

    fn front_end(count: usize, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => HEADER_LENGTH + count * OFFSET_SIZE,
            NodeKind::Internal => HEADER_LENGTH + count * CHILD_BLOCK + GSPP_SIZE,
        }
    }

    fn free_space(&self, buf: &[u8], kind: NodeKind) -> Result<usize> {
        let front = Self::front_end(key_count(buf), kind);
        Self::alloc_offset(buf)
            .checked_sub(front)
            .ok_or_else(|| TreeError::inconsistency("allocation region overlaps node front"))
    }

    fn parse(&self, buf: &[u8], start: usize, kind: NodeKind) -> Result<RawEntry> {
        let header = match kind {
            NodeKind::Leaf => LEAF_ENTRY_HEADER,
            NodeKind::Internal => INTERNAL_ENTRY_HEADER,
        };
        if start < HEADER_LENGTH || start + header > self.page_size {
            return Err(TreeError::Corruption("entry offset outside node"));
        }
        let raw = read_u16(buf, start);
        let key_len = (raw & SIZE_MASK) as usize;
        let value_len = match kind {
            NodeKind::Leaf => read_u16(buf, start + 2) as usize,
            NodeKind::Internal => 0,
        };
        let key_start = start + header;
        let value_start = key_start + key_len;
        let end = value_start + value_len;
        if end > self.page_size {
            return Err(TreeError::Corruption("entry extends past end of node"));
        }
        Ok(RawEntry {
            start,
            flags: raw & !SIZE_MASK,
            key: (key_start, value_start),
            value: (value_start, end),
        })
    }

    fn entry_at(&self, buf: &[u8], pos: usize, kind: NodeKind) -> Result<RawEntry> {
        let slot = Self::slot_offset(pos, kind);
        if slot + OFFSET_SIZE > self.page_size {
            return Err(TreeError::Corruption("key position beyond node"));
        }
        self.parse(buf, read_u16(buf, slot) as usize, kind)
    }

    fn allocate(
        &self,
        buf: &mut [u8],
        len: usize,
        kind: NodeKind,
        slots_added: usize,
    ) -> Result<usize> {
        let front = Self::front_end(key_count(buf), kind) + slots_added;
        let alloc = Self::alloc_offset(buf);
        if alloc < front + len {
            return Err(TreeError::inconsistency("no room left in node allocation region"));
        }
        let start = alloc - len;
        Self::set_alloc_offset(buf, start);
        Ok(start)
    }

    fn write_leaf_entry(
        &self,
        buf: &mut [u8],
        key: &[u8],
        value: ValueRef<'_>,
        slots_added: usize,
    ) -> Result<usize> {
        if key.len() > self.max_key_size {
            return Err(TreeError::InvalidArgument("key larger than max key size"));
        }
        let len = LEAF_ENTRY_HEADER + key.len() + value.stored_len();
        let start = self.allocate(buf, len, NodeKind::Leaf, slots_added)?;
        let mut raw = key.len() as u16;
        if matches!(value, ValueRef::Offload(_)) {
            raw |= FLAG_OFFLOAD;
        }
        write_u16(buf, start, raw);
        write_u16(buf, start + 2, value.stored_len() as u16);
        let key_start = start + LEAF_ENTRY_HEADER;
        buf[key_start..key_start + key.len()].copy_from_slice(key);
        let value_start = key_start + key.len();
        match value {
            ValueRef::Inline(bytes) => {
                buf[value_start..value_start + bytes.len()].copy_from_slice(bytes)
            }
            ValueRef::Offload(id) => buf[value_start..value_start + offload::REFERENCE_SIZE]
                .copy_from_slice(&id.0.to_be_bytes()),
        }
        Ok(start)
    }

    fn write_internal_key(&self, buf: &mut [u8], key: &[u8], slots_added: usize) -> Result<usize> {
        if key.len() > self.max_key_size {
            return Err(TreeError::InvalidArgument("key larger than max key size"));
        }
        let start = self.allocate(
            buf,
            INTERNAL_ENTRY_HEADER + key.len(),
            NodeKind::Internal,
            slots_added,
        )?;
        write_u16(buf, start, key.len() as u16);
        buf[start + INTERNAL_ENTRY_HEADER..start + INTERNAL_ENTRY_HEADER + key.len()]
            .copy_from_slice(key);
        Ok(start)
    }

    fn kill(&self, buf: &mut [u8], entry: &RawEntry) {
        let raw = read_u16(buf, entry.start);
        write_u16(buf, entry.start, raw | FLAG_TOMBSTONE);
        let dead = Self::dead_space(buf) + entry.len();
        Self::set_dead_space(buf, dead);
    }

    fn remove_block(buf: &mut [u8], start: usize, end: usize, len: usize) {
        buf.copy_within(start + len..end, start);
        buf[end - len..end].fill(0);
    }

    fn overflow(&self, buf: &[u8], kind: NodeKind, needed: usize) -> Result<Overflow> {
        let free = self.free_space(buf, kind)?;
        Ok(if needed <= free {
            Overflow::No
        } else if needed <= free + Self::dead_space(buf) {
            Overflow::NoNeedDefrag
        } else {
            Overflow::Yes
        })
    }
}

impl NodeFormat for DynamicSizeNode {
    fn kind(&self) -> FormatKind {
        FormatKind::Dynamic
    }

    fn initialize(&self, buf: &mut [u8], kind: NodeKind, layer: Layer, generation: u64) {
        initialize_header(buf, kind, layer, generation);
        Self::set_alloc_offset(buf, self.page_size);
    }

    fn key_at<'a>(&self, buf: &'a [u8], pos: usize, kind: NodeKind) -> Result<&'a [u8]> {
        let entry = self.entry_at(buf, pos, kind)?;
        Ok(&buf[entry.key.0..entry.key.1])
    }

    fn value_at<'a>(&self, buf: &'a [u8], pos: usize) -> Result<ValueRef<'a>> {
        let entry = self.entry_at(buf, pos, NodeKind::Leaf)?;
        let (start, end) = entry.value;
        if entry.flags & FLAG_OFFLOAD != 0 {
            if end - start != offload::REFERENCE_SIZE {
                return Err(TreeError::Corruption("malformed offload reference"));
            }
            return Ok(ValueRef::Offload(PageId(read_u64(buf, start))));
        }
        Ok(ValueRef::Inline(&buf[start..end]))
    }

    fn child_offset(&self, pos: usize) -> usize {
        HEADER_LENGTH + pos * CHILD_BLOCK
    }

    fn max_key_count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => (self.page_size - HEADER_LENGTH) / (OFFSET_SIZE + LEAF_ENTRY_HEADER),
            NodeKind::Internal => {
                (self.page_size - HEADER_LENGTH - GSPP_SIZE) / (CHILD_BLOCK + INTERNAL_ENTRY_HEADER)
            }
        }
    }

    fn leaf_capacity(&self) -> usize {
        self.page_size - HEADER_LENGTH
    }

    fn leaf_entry_space(&self, key_len: usize, stored_len: usize) -> usize {
        OFFSET_SIZE + LEAF_ENTRY_HEADER + key_len + stored_len
    }

    fn leaf_used_space(&self, buf: &[u8]) -> Result<usize> {
        (0..key_count(buf)).try_fold(0, |used, pos| {
            let entry = self.entry_at(buf, pos, NodeKind::Leaf)?;
            Ok(used + OFFSET_SIZE + entry.len())
        })
    }

    fn leaf_overflow(&self, buf: &[u8], key_len: usize, stored_len: usize) -> Result<Overflow> {
        self.overflow(buf, NodeKind::Leaf, self.leaf_entry_space(key_len, stored_len))
    }

    fn internal_capacity(&self) -> usize {
        self.page_size - HEADER_LENGTH - GSPP_SIZE
    }

    fn internal_key_space(&self, key_len: usize) -> usize {
        CHILD_BLOCK + INTERNAL_ENTRY_HEADER + key_len
    }

    fn internal_overflow(&self, buf: &[u8], key_len: usize) -> Result<Overflow> {
        self.overflow(buf, NodeKind::Internal, self.internal_key_space(key_len))
    }

    fn insert_leaf_entry_at(
        &self,
        buf: &mut [u8],
        pos: usize,
        key: &[u8],
        value: ValueRef<'_>,
    ) -> Result<()> {
        let count = key_count(buf);
        if pos > count {
            return Err(TreeError::inconsistency("leaf insert out of bounds"));
        }
        let start = self.write_leaf_entry(buf, key, value, OFFSET_SIZE)?;
        let slot = Self::slot_offset(pos, NodeKind::Leaf);
        buf.copy_within(slot..Self::front_end(count, NodeKind::Leaf), slot + OFFSET_SIZE);
        write_u16(buf, slot, start as u16);
        set_key_count(buf, count + 1);
        Ok(())
    }

    fn remove_leaf_entry_at(&self, buf: &mut [u8], pos: usize) -> Result<()> {
        let count = key_count(buf);
        if pos >= count {
            return Err(TreeError::inconsistency("leaf remove out of bounds"));
        }
        let entry = self.entry_at(buf, pos, NodeKind::Leaf)?;
        self.kill(buf, &entry);
        let slot = Self::slot_offset(pos, NodeKind::Leaf);
        Self::remove_block(buf, slot, Self::front_end(count, NodeKind::Leaf), OFFSET_SIZE);
        set_key_count(buf, count - 1);
        Ok(())
    }

    fn set_value_at(&self, buf: &mut [u8], pos: usize, value: &[u8]) -> Result<bool> {
        let entry = self.entry_at(buf, pos, NodeKind::Leaf)?;
        let (start, end) = entry.value;
        if entry.flags & FLAG_OFFLOAD != 0 || end - start != value.len() {
            return Ok(false);
        }
        buf[start..end].copy_from_slice(value);
        Ok(true)
    }

    fn insert_key_and_right_child_at(
        &self,
        buf: &mut [u8],
        pos: usize,
        key: &[u8],
        child: &ChildPair,
    ) -> Result<()> {
        let count = key_count(buf);
        if pos > count {
            return Err(TreeError::inconsistency("internal insert out of bounds"));
        }
        let start = self.write_internal_key(buf, key, CHILD_BLOCK)?;
        let slot = Self::slot_offset(pos, NodeKind::Internal);
        buf.copy_within(slot..Self::front_end(count, NodeKind::Internal), slot + CHILD_BLOCK);
        write_u16(buf, slot, start as u16);
        let child_at = self.child_offset(pos + 1);
        buf[child_at..child_at + GSPP_SIZE].copy_from_slice(child);
        set_key_count(buf, count + 1);
        Ok(())
    }

    fn remove_key_and_right_child_at(&self, buf: &mut [u8], pos: usize) -> Result<()> {
        let count = key_count(buf);
        if pos >= count {
            return Err(TreeError::inconsistency("internal remove out of bounds"));
        }
        let entry = self.entry_at(buf, pos, NodeKind::Internal)?;
        self.kill(buf, &entry);
        let slot = Self::slot_offset(pos, NodeKind::Internal);
        Self::remove_block(buf, slot, Self::front_end(count, NodeKind::Internal), CHILD_BLOCK);
        set_key_count(buf, count - 1);
        Ok(())
    }

    fn remove_key_and_left_child_at(&self, buf: &mut [u8], pos: usize) -> Result<()> {
        let count = key_count(buf);
        if pos >= count {
            return Err(TreeError::inconsistency("internal remove out of bounds"));
        }
        let entry = self.entry_at(buf, pos, NodeKind::Internal)?;
        self.kill(buf, &entry);
        let start = self.child_offset(pos);
        Self::remove_block(buf, start, Self::front_end(count, NodeKind::Internal), CHILD_BLOCK);
        set_key_count(buf, count - 1);
        Ok(())
    }

    fn set_key_at(&self, buf: &mut [u8], pos: usize, key: &[u8]) -> Result<bool> {
        let entry = self.entry_at(buf, pos, NodeKind::Internal)?;
        if entry.key.1 - entry.key.0 == key.len() {
            buf[entry.key.0..entry.key.1].copy_from_slice(key);
            return Ok(true);
        }
        if self.free_space(buf, NodeKind::Internal)? < INTERNAL_ENTRY_HEADER + key.len() {
            return Ok(false);
        }
        let start = self.write_internal_key(buf, key, 0)?;
        self.kill(buf, &entry);
        write_u16(buf, Self::slot_offset(pos, NodeKind::Internal), start as u16);
        Ok(true)
    }

    fn write_leaf_entries(&self, buf: &mut [u8], entries: &[LeafEntry]) -> Result<()> {
        buf[BASE_HEADER_LENGTH..].fill(0);
        Self::set_alloc_offset(buf, self.page_size);
        set_key_count(buf, 0);
        for (pos, entry) in entries.iter().enumerate() {
            let start =
                self.write_leaf_entry(buf, &entry.key, entry.value.as_value_ref(), OFFSET_SIZE)?;
            write_u16(buf, Self::slot_offset(pos, NodeKind::Leaf), start as u16);
            set_key_count(buf, pos + 1);
        }
        Ok(())
    }

    fn write_internal_entries(&self, buf: &mut [u8], entries: &InternalEntries) -> Result<()> {
        if entries.children.len() != entries.keys.len() + 1 {
            return Err(TreeError::inconsistency("malformed internal node contents"));
        }
        buf[BASE_HEADER_LENGTH..].fill(0);
        Self::set_alloc_offset(buf, self.page_size);
        set_key_count(buf, 0);
        buf[self.child_offset(0)..self.child_offset(0) + GSPP_SIZE]
            .copy_from_slice(&entries.children[0]);
        for (pos, (key, child)) in entries.keys.iter().zip(&entries.children[1..]).enumerate() {
            let start = self.write_internal_key(buf, key, CHILD_BLOCK)?;
            write_u16(buf, Self::slot_offset(pos, NodeKind::Internal), start as u16);
            let child_at = self.child_offset(pos + 1);
            buf[child_at..child_at + GSPP_SIZE].copy_from_slice(child);
            set_key_count(buf, pos + 1);
        }
        Ok(())
    }

    fn defragment(&self, buf: &mut [u8], kind: NodeKind) -> Result<()> {
        match kind {
            NodeKind::Leaf => {
                let entries = read_leaf_entries(self, buf)?;
                self.write_leaf_entries(buf, &entries)
            }
            NodeKind::Internal => {
                let entries = read_internal_entries(self, buf)?;
                self.write_internal_entries(buf, &entries)
            }
        }
    }

    fn check_meta(&self, buf: &[u8], kind: NodeKind) -> std::result::Result<(), String> {
        let count = key_count(buf);
        if count > self.max_key_count(kind) {
            return Err(format!("key count {count} exceeds node capacity"));
        }
        let alloc = Self::alloc_offset(buf);
        let front = Self::front_end(count, kind);
        if alloc < front || alloc > self.page_size {
            return Err(format!(
                "allocation offset {alloc} outside [{front}, {}]",
                self.page_size
            ));
        }
        let mut live = Vec::new();
        let mut dead = 0usize;
        let mut at = alloc;
        while at < self.page_size {
            let entry = self.parse(buf, at, kind).map_err(|err| err.to_string())?;
            if entry.flags & FLAG_TOMBSTONE != 0 {
                dead += entry.len();
            } else {
                live.push(at);
            }
            at += entry.len();
        }
        if dead != Self::dead_space(buf) {
            return Err(format!(
                "dead space {} recorded but {dead} found",
                Self::dead_space(buf)
            ));
        }
        if live.len() != count {
            return Err(format!("{} live entries but key count {count}", live.len()));
        }
        for pos in 0..count {
            let offset = read_u16(buf, Self::slot_offset(pos, kind)) as usize;
            if live.binary_search(&offset).is_err() {
                return Err(format!("key {pos} points at {offset} which is not a live entry"));
            }
        }
        Ok(())
    }

    fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    fn inline_entry_cap(&self) -> usize {
        self.inline_cap
    }

    fn key_value_size_cap(&self) -> usize {
        offload::capacity(self.page_size)
    }
}

/// Whether an entry of this size must have its value moved to an offload page.
pub fn needs_offload(format: &dyn NodeFormat, key_len: usize, value_len: usize) -> bool {
    format.kind() == FormatKind::Dynamic && key_len + value_len > format.inline_entry_cap()
}
