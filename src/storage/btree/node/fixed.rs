//! Packed arrays of fixed-size keys and values.
//!
//! ```text
//! leaf:     [header][key 0 .. key max-1][value 0 .. value max-1]
//! internal: [header][key 0 .. key max-1][child 0 .. child max]
//! ```

use super::{
    initialize_header, key_count, set_key_count, ChildPair, FormatKind, InternalEntries, Layer,
    LeafEntry, NodeFormat, NodeKind, Overflow, StoredValue, ValueRef, BASE_HEADER_LENGTH,
};
use crate::storage::btree::gspp::GSPP_SIZE;
use crate::types::{Result, TreeError};

/// Node format for layouts whose keys and values all have the same size.
#[derive(Debug, Clone)]
pub struct FixedSizeNode {
    key_size: usize,
    value_size: usize,
    leaf_max: usize,
    internal_max: usize,
}

impl FixedSizeNode {
    /// Sizes the node arrays for `page_size`.
    pub fn new(page_size: usize, key_size: usize, value_size: usize) -> Result<Self> {
        if key_size == 0 {
            return Err(TreeError::InvalidArgument("fixed key size must be positive"));
        }
        let body = page_size.saturating_sub(BASE_HEADER_LENGTH);
        let leaf_max = body / (key_size + value_size);
        let internal_max = body.saturating_sub(GSPP_SIZE) / (key_size + GSPP_SIZE);
        if leaf_max < 2 || internal_max < 2 {
            return Err(TreeError::InvalidArgument(
                "page size too small for the key and value sizes",
            ));
        }
        Ok(Self {
            key_size,
            value_size,
            leaf_max,
            internal_max,
        })
    }

    fn key_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + pos * self.key_size
    }

    fn value_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + self.leaf_max * self.key_size + pos * self.value_size
    }

    fn count(&self, buf: &[u8], kind: NodeKind) -> Result<usize> {
        let count = key_count(buf);
        if count > self.max_key_count(kind) {
            return Err(TreeError::inconsistency(format!(
                "key count {count} exceeds node capacity {}",
                self.max_key_count(kind)
            )));
        }
        Ok(count)
    }

    fn check_pos(&self, pos: usize, kind: NodeKind) -> Result<()> {
        if pos >= self.max_key_count(kind) {
            return Err(TreeError::Corruption("key position beyond node capacity"));
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(TreeError::InvalidArgument("key size does not match layout"));
        }
        Ok(())
    }

    fn inline<'a>(&self, value: ValueRef<'a>) -> Result<&'a [u8]> {
        match value {
            ValueRef::Inline(bytes) if bytes.len() == self.value_size => Ok(bytes),
            ValueRef::Inline(_) => Err(TreeError::InvalidArgument(
                "value size does not match layout",
            )),
            ValueRef::Offload(_) => Err(TreeError::InvalidArgument(
                "fixed size nodes do not offload values",
            )),
        }
    }
}

impl NodeFormat for FixedSizeNode {
    fn kind(&self) -> FormatKind {
        FormatKind::Fixed
    }

    fn initialize(&self, buf: &mut [u8], kind: NodeKind, layer: Layer, generation: u64) {
        initialize_header(buf, kind, layer, generation);
    }

    fn key_at<'a>(&self, buf: &'a [u8], pos: usize, kind: NodeKind) -> Result<&'a [u8]> {
        self.check_pos(pos, kind)?;
        let at = self.key_offset(pos);
        Ok(&buf[at..at + self.key_size])
    }

    fn value_at<'a>(&self, buf: &'a [u8], pos: usize) -> Result<ValueRef<'a>> {
        self.check_pos(pos, NodeKind::Leaf)?;
        let at = self.value_offset(pos);
        Ok(ValueRef::Inline(&buf[at..at + self.value_size]))
    }

    fn child_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + self.internal_max * self.key_size + pos * GSPP_SIZE
    }

    fn max_key_count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_max,
            NodeKind::Internal => self.internal_max,
        }
    }

    fn leaf_capacity(&self) -> usize {
        self.leaf_max * (self.key_size + self.value_size)
    }

    fn leaf_entry_space(&self, _key_len: usize, _stored_len: usize) -> usize {
        self.key_size + self.value_size
    }

    fn leaf_used_space(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.count(buf, NodeKind::Leaf)? * (self.key_size + self.value_size))
    }

    fn leaf_overflow(&self, buf: &[u8], _key_len: usize, _stored_len: usize) -> Result<Overflow> {
        Ok(if self.count(buf, NodeKind::Leaf)? + 1 > self.leaf_max {
            Overflow::Yes
        } else {
            Overflow::No
        })
    }

    fn internal_capacity(&self) -> usize {
        self.internal_max * (self.key_size + GSPP_SIZE)
    }

    fn internal_key_space(&self, _key_len: usize) -> usize {
        self.key_size + GSPP_SIZE
    }

    fn internal_overflow(&self, buf: &[u8], _key_len: usize) -> Result<Overflow> {
        Ok(if self.count(buf, NodeKind::Internal)? + 1 > self.internal_max {
            Overflow::Yes
        } else {
            Overflow::No
        })
    }

    fn insert_leaf_entry_at(
        &self,
        buf: &mut [u8],
        pos: usize,
        key: &[u8],
        value: ValueRef<'_>,
    ) -> Result<()> {
        self.check_key(key)?;
        let value = self.inline(value)?;
        let count = self.count(buf, NodeKind::Leaf)?;
        if count >= self.leaf_max || pos > count {
            return Err(TreeError::inconsistency("leaf insert out of bounds"));
        }
        buf.copy_within(self.key_offset(pos)..self.key_offset(count), self.key_offset(pos + 1));
        buf.copy_within(
            self.value_offset(pos)..self.value_offset(count),
            self.value_offset(pos + 1),
        );
        let k = self.key_offset(pos);
        buf[k..k + self.key_size].copy_from_slice(key);
        let v = self.value_offset(pos);
        buf[v..v + self.value_size].copy_from_slice(value);
        set_key_count(buf, count + 1);
        Ok(())
    }

    fn remove_leaf_entry_at(&self, buf: &mut [u8], pos: usize) -> Result<()> {
        let count = self.count(buf, NodeKind::Leaf)?;
        if pos >= count {
            return Err(TreeError::inconsistency("leaf remove out of bounds"));
        }
        buf.copy_within(self.key_offset(pos + 1)..self.key_offset(count), self.key_offset(pos));
        buf.copy_within(
            self.value_offset(pos + 1)..self.value_offset(count),
            self.value_offset(pos),
        );
        set_key_count(buf, count - 1);
        Ok(())
    }

    fn set_value_at(&self, buf: &mut [u8], pos: usize, value: &[u8]) -> Result<bool> {
        if value.len() != self.value_size {
            return Ok(false);
        }
        self.check_pos(pos, NodeKind::Leaf)?;
        let v = self.value_offset(pos);
        buf[v..v + self.value_size].copy_from_slice(value);
        Ok(true)
    }

    fn insert_key_and_right_child_at(
        &self,
        buf: &mut [u8],
        pos: usize,
        key: &[u8],
        child: &ChildPair,
    ) -> Result<()> {
        self.check_key(key)?;
        let count = self.count(buf, NodeKind::Internal)?;
        if count >= self.internal_max || pos > count {
            return Err(TreeError::inconsistency("internal insert out of bounds"));
        }
        buf.copy_within(self.key_offset(pos)..self.key_offset(count), self.key_offset(pos + 1));
        buf.copy_within(
            self.child_offset(pos + 1)..self.child_offset(count + 1),
            self.child_offset(pos + 2),
        );
        let k = self.key_offset(pos);
        buf[k..k + self.key_size].copy_from_slice(key);
        let c = self.child_offset(pos + 1);
        buf[c..c + GSPP_SIZE].copy_from_slice(child);
        set_key_count(buf, count + 1);
        Ok(())
    }

    fn remove_key_and_right_child_at(&self, buf: &mut [u8], pos: usize) -> Result<()> {
        let count = self.count(buf, NodeKind::Internal)?;
        if pos >= count {
            return Err(TreeError::inconsistency("internal remove out of bounds"));
        }
        buf.copy_within(self.key_offset(pos + 1)..self.key_offset(count), self.key_offset(pos));
        buf.copy_within(
            self.child_offset(pos + 2)..self.child_offset(count + 1),
            self.child_offset(pos + 1),
        );
        set_key_count(buf, count - 1);
        Ok(())
    }

    fn remove_key_and_left_child_at(&self, buf: &mut [u8], pos: usize) -> Result<()> {
        let count = self.count(buf, NodeKind::Internal)?;
        if pos >= count {
            return Err(TreeError::inconsistency("internal remove out of bounds"));
        }
        buf.copy_within(self.key_offset(pos + 1)..self.key_offset(count), self.key_offset(pos));
        buf.copy_within(
            self.child_offset(pos + 1)..self.child_offset(count + 1),
            self.child_offset(pos),
        );
        set_key_count(buf, count - 1);
        Ok(())
    }

    fn set_key_at(&self, buf: &mut [u8], pos: usize, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        self.check_pos(pos, NodeKind::Internal)?;
        let k = self.key_offset(pos);
        buf[k..k + self.key_size].copy_from_slice(key);
        Ok(true)
    }

    fn write_leaf_entries(&self, buf: &mut [u8], entries: &[LeafEntry]) -> Result<()> {
        if entries.len() > self.leaf_max {
            return Err(TreeError::inconsistency("too many entries for a leaf"));
        }
        buf[BASE_HEADER_LENGTH..].fill(0);
        for (pos, entry) in entries.iter().enumerate() {
            self.check_key(&entry.key)?;
            let value = match &entry.value {
                StoredValue::Inline(bytes) => self.inline(ValueRef::Inline(bytes))?,
                StoredValue::Offload(_) => {
                    return Err(TreeError::InvalidArgument(
                        "fixed size nodes do not offload values",
                    ))
                }
            };
            let k = self.key_offset(pos);
            buf[k..k + self.key_size].copy_from_slice(&entry.key);
            let v = self.value_offset(pos);
            buf[v..v + self.value_size].copy_from_slice(value);
        }
        set_key_count(buf, entries.len());
        Ok(())
    }

    fn write_internal_entries(&self, buf: &mut [u8], entries: &InternalEntries) -> Result<()> {
        if entries.keys.len() > self.internal_max
            || entries.children.len() != entries.keys.len() + 1
        {
            return Err(TreeError::inconsistency("malformed internal node contents"));
        }
        buf[BASE_HEADER_LENGTH..].fill(0);
        for (pos, key) in entries.keys.iter().enumerate() {
            self.check_key(key)?;
            let k = self.key_offset(pos);
            buf[k..k + self.key_size].copy_from_slice(key);
        }
        for (pos, child) in entries.children.iter().enumerate() {
            let c = self.child_offset(pos);
            buf[c..c + GSPP_SIZE].copy_from_slice(child);
        }
        set_key_count(buf, entries.keys.len());
        Ok(())
    }

    fn defragment(&self, _buf: &mut [u8], _kind: NodeKind) -> Result<()> {
        Ok(())
    }

    fn check_meta(&self, buf: &[u8], kind: NodeKind) -> std::result::Result<(), String> {
        self.count(buf, kind).map(|_| ()).map_err(|err| err.to_string())
    }

    fn max_key_size(&self) -> usize {
        self.key_size
    }

    fn inline_entry_cap(&self) -> usize {
        self.key_size + self.value_size
    }

    fn key_value_size_cap(&self) -> usize {
        self.key_size + self.value_size
    }
}

#[cfg(test)]
mod tests {
    use super::super::{new_child_pair, read_internal_entries, read_leaf_entries};
    use super::*;
    use crate::types::{Generation, PageId};

    fn leaf(format: &FixedSizeNode) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        format.initialize(&mut buf, NodeKind::Leaf, Layer::Data, 2);
        buf
    }

    #[test]
    fn capacity_follows_page_size() -> Result<()> {
        let format = FixedSizeNode::new(256, 8, 8)?;
        assert_eq!(format.max_key_count(NodeKind::Leaf), (256 - 112) / 16);
        assert_eq!(format.max_key_count(NodeKind::Internal), (256 - 112 - 32) / 40);
        assert!(FixedSizeNode::new(128, 8, 8).is_err());
        Ok(())
    }

    #[test]
    fn leaf_insert_and_remove_shift_entries() -> Result<()> {
        let format = FixedSizeNode::new(256, 2, 1)?;
        let mut buf = leaf(&format);
        format.insert_leaf_entry_at(&mut buf, 0, b"bb", ValueRef::Inline(b"2"))?;
        format.insert_leaf_entry_at(&mut buf, 0, b"aa", ValueRef::Inline(b"1"))?;
        format.insert_leaf_entry_at(&mut buf, 2, b"cc", ValueRef::Inline(b"3"))?;
        format.remove_leaf_entry_at(&mut buf, 1)?;
        let entries = read_leaf_entries(&format, &buf)?;
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"aa"[..], &b"cc"[..]]);
        assert_eq!(entries[1].value, StoredValue::Inline(b"3".to_vec()));
        assert!(format.set_value_at(&mut buf, 0, b"9")?);
        assert!(!format.set_value_at(&mut buf, 0, b"99")?);
        assert_eq!(format.value_at(&buf, 0)?, ValueRef::Inline(b"9"));
        Ok(())
    }

    #[test]
    fn full_leaf_overflows() -> Result<()> {
        let format = FixedSizeNode::new(256, 8, 8)?;
        let mut buf = leaf(&format);
        for i in 0..format.max_key_count(NodeKind::Leaf) as u64 {
            assert_eq!(format.leaf_overflow(&buf, 8, 8)?, Overflow::No);
            let pos = super::super::key_count(&buf);
            let bytes = i.to_be_bytes();
            format.insert_leaf_entry_at(&mut buf, pos, &bytes, ValueRef::Inline(&bytes))?;
        }
        assert_eq!(format.leaf_overflow(&buf, 8, 8)?, Overflow::Yes);
        Ok(())
    }

    #[test]
    fn internal_children_follow_their_keys() -> Result<()> {
        let gen = Generation::initial();
        let format = FixedSizeNode::new(512, 1, 1)?;
        let mut buf = vec![0u8; 512];
        format.initialize(&mut buf, NodeKind::Internal, Layer::Data, gen.unstable);
        let c = |id| new_child_pair(PageId(id), gen);
        buf[format.child_offset(0)..format.child_offset(1)].copy_from_slice(&c(10));
        format.insert_key_and_right_child_at(&mut buf, 0, b"m", &c(20))?;
        format.insert_key_and_right_child_at(&mut buf, 0, b"f", &c(15))?;
        format.insert_key_and_right_child_at(&mut buf, 2, b"t", &c(25))?;
        let entries = read_internal_entries(&format, &buf)?;
        assert_eq!(entries.keys, vec![b"f".to_vec(), b"m".to_vec(), b"t".to_vec()]);
        assert_eq!(entries.children, vec![c(10), c(15), c(20), c(25)]);

        format.remove_key_and_right_child_at(&mut buf, 1)?;
        let entries = read_internal_entries(&format, &buf)?;
        assert_eq!(entries.keys, vec![b"f".to_vec(), b"t".to_vec()]);
        assert_eq!(entries.children, vec![c(10), c(15), c(25)]);

        format.remove_key_and_left_child_at(&mut buf, 0)?;
        let entries = read_internal_entries(&format, &buf)?;
        assert_eq!(entries.keys, vec![b"t".to_vec()]);
        assert_eq!(entries.children, vec![c(15), c(25)]);
        Ok(())
    }
}
