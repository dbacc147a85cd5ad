//! Insert and remove on the write path.
//!
//! A mutation descends from the root recording the path, changes the leaf,
//! then unwinds the path applying what [`StructurePropagation`] reports. Any
//! node written at a stable generation is first copied to a successor so
//! readers of the stable tree keep seeing the old version. Child and
//! sibling pointers are generation safe pairs and are updated in place.

use std::borrow::Cow;
use std::mem;

use smallvec::SmallVec;

use super::freelist::IdProvider;
use super::gspp::GSPP_SIZE;
use super::merger::{ByteMerger, MergeResult};
use super::monitor::Monitor;
use super::node::{
    child_at, child_position, expect_node_kind, generation, header_pointer, internal_split_point,
    key_count, leaf_entries_space, leaf_split_point, leaf_underflow, needs_offload,
    new_child_pair, offload, plan_rebalance, read_internal_entries, read_leaf_entries, search,
    set_child_at, set_generation, set_header_pointer, ChildPair, HeaderPointer, InternalEntries,
    KeyCmp, Layer, LeafEntry, NodeFormat, NodeKind, Overflow, Rebalance, ValueRef,
    SUCCESSOR_OFFSET,
};
use super::propagation::{ChildUpdate, KeyReplace, StructurePropagation};
use super::stats::TreeStats;
use crate::primitives::pager::{PagedFile, PfMode};
use crate::types::{Generation, PageId, Result, TreeError};

/// Deepest tree any traversal accepts before declaring a pointer cycle.
pub(crate) const MAX_TREE_DEPTH: usize = 64;

/// Root pointer of one tree together with the generation it was set at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Root {
    /// Root node.
    pub id: PageId,
    /// Generation the root pointer was last changed in.
    pub generation: u64,
}

#[derive(Copy, Clone, Debug)]
struct Level {
    id: PageId,
    child_pos: usize,
}

/// Everything a mutation needs besides the root.
#[derive(Clone, Copy)]
pub(crate) struct TreeContext<'a> {
    pub file: &'a PagedFile,
    pub format: &'a dyn NodeFormat,
    pub cmp: KeyCmp,
    pub ids: &'a dyn IdProvider,
    pub stats: &'a TreeStats,
    pub monitor: &'a dyn Monitor,
    pub layer: Layer,
    pub gen: Generation,
    pub split_ratio: f64,
}

/// One insert or remove.
pub(crate) struct TreeLogic<'a> {
    cx: TreeContext<'a>,
    levels: SmallVec<[Level; 16]>,
    prop: StructurePropagation,
}

impl<'a> TreeLogic<'a> {
    pub fn new(cx: TreeContext<'a>) -> Self {
        Self {
            cx,
            levels: SmallVec::new(),
            prop: StructurePropagation::default(),
        }
    }

    /// Inserts `key`, consulting `merger` if it already exists.
    pub fn insert(
        &mut self,
        root: &mut Root,
        key: &[u8],
        value: &[u8],
        merger: &mut ByteMerger<'_>,
    ) -> Result<()> {
        self.check_entry_size(key, value)?;
        self.descend(root.id, key)?;
        self.insert_in_leaf(key, value, merger)?;
        self.handle_structure_changes()?;
        self.update_root(root)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, root: &mut Root, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.descend(root.id, key)?;
        let leaf = self.current()?;
        let buf = self.read(leaf)?;
        let (pos, hit) = search(self.cx.format, &buf, NodeKind::Leaf, key, self.cx.cmp)?;
        if !hit {
            return Ok(None);
        }
        let value = self.load_value(&buf, pos)?;
        let leaf = self.successor_of_current()?;
        self.remove_entry(leaf, pos)?;
        self.check_underflow(leaf)?;
        self.handle_structure_changes()?;
        self.update_root(root)?;
        Ok(Some(value))
    }

    fn check_entry_size(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > self.cx.format.max_key_size() {
            return Err(TreeError::InvalidArgument("key larger than max key size"));
        }
        if key.len() + value.len() > self.cx.format.key_value_size_cap() {
            return Err(TreeError::InvalidArgument(
                "key and value larger than key value size cap",
            ));
        }
        Ok(())
    }

    fn read(&self, id: PageId) -> Result<Vec<u8>> {
        let cursor = self.cx.file.acquire(id, PfMode::Write)?;
        let page = cursor.read()?;
        Ok(page.to_vec())
    }

    fn write<T>(&self, id: PageId, f: impl FnOnce(&mut [u8]) -> Result<T>) -> Result<T> {
        let cursor = self.cx.file.acquire(id, PfMode::Write)?;
        let mut page = cursor.write()?;
        f(&mut page)
    }

    fn node(&self, id: PageId) -> Result<(Vec<u8>, NodeKind)> {
        let buf = self.read(id)?;
        let kind = expect_node_kind(&buf, id)?;
        if generation(&buf) > self.cx.gen.unstable {
            return Err(TreeError::inconsistency(format!(
                "node {id} has generation {} above {}",
                generation(&buf),
                self.cx.gen
            )));
        }
        Ok((buf, kind))
    }

    fn current(&self) -> Result<PageId> {
        self.levels
            .last()
            .map(|level| level.id)
            .ok_or_else(|| TreeError::inconsistency("mutation has no current node"))
    }

    fn descend(&mut self, root: PageId, key: &[u8]) -> Result<()> {
        self.levels.clear();
        self.prop.clear();
        let gen = self.cx.gen;
        let mut id = root;
        loop {
            if self.levels.len() >= MAX_TREE_DEPTH {
                return Err(TreeError::inconsistency(format!(
                    "descent from root {root} deeper than {MAX_TREE_DEPTH} levels"
                )));
            }
            let (buf, kind) = self.node(id)?;
            if let Some(successor) = header_pointer(&buf, HeaderPointer::Successor, gen, id)? {
                return Err(TreeError::inconsistency(format!(
                    "writer reached node {id} which was succeeded by {successor}"
                )));
            }
            self.levels.push(Level { id, child_pos: 0 });
            if kind == NodeKind::Leaf {
                return Ok(());
            }
            let (pos, hit) = search(self.cx.format, &buf, kind, key, self.cx.cmp)?;
            let child_pos = child_position(pos, hit);
            let child = child_at(self.cx.format, &buf, child_pos, gen, id)?;
            if let Some(level) = self.levels.last_mut() {
                level.child_pos = child_pos;
            }
            id = child;
        }
    }

    /// Copies a stable node to a new id and links everything that pointed at
    /// it to the copy. Returns the id to write to.
    fn successor(&mut self, id: PageId, update: Option<ChildUpdate>) -> Result<PageId> {
        let gen = self.cx.gen;
        let (mut copy, _) = self.node(id)?;
        if generation(&copy) == gen.unstable {
            return Ok(id);
        }
        let new = self.cx.ids.acquire_new_id(gen)?;
        set_generation(&mut copy, gen.unstable);
        copy[SUCCESSOR_OFFSET..SUCCESSOR_OFFSET + GSPP_SIZE].fill(0);
        let left = header_pointer(&copy, HeaderPointer::Left, gen, id)?;
        let right = header_pointer(&copy, HeaderPointer::Right, gen, id)?;
        self.write(new, |page| {
            page.copy_from_slice(&copy);
            Ok(())
        })?;
        self.set_pointer(id, HeaderPointer::Successor, Some(new))?;
        if let Some(left) = left {
            self.set_pointer(left, HeaderPointer::Right, Some(new))?;
        }
        if let Some(right) = right {
            self.set_pointer(right, HeaderPointer::Left, Some(new))?;
        }
        if let Some(which) = update {
            self.prop.child_update(which, new);
        }
        self.cx.ids.release_id(id, gen)?;
        self.cx.stats.inc_successors();
        Ok(new)
    }

    fn successor_of_current(&mut self) -> Result<PageId> {
        let id = self.current()?;
        let new = self.successor(id, Some(ChildUpdate::Mid))?;
        if let Some(level) = self.levels.last_mut() {
            level.id = new;
        }
        Ok(new)
    }

    fn set_pointer(&self, id: PageId, which: HeaderPointer, target: Option<PageId>) -> Result<()> {
        let gen = self.cx.gen;
        self.write(id, |page| set_header_pointer(page, which, target, gen, id))
    }

    fn set_child(&self, id: PageId, pos: usize, child: PageId) -> Result<()> {
        let (format, gen) = (self.cx.format, self.cx.gen);
        self.write(id, |page| set_child_at(format, page, pos, child, gen, id))
    }

    fn load_value(&self, buf: &[u8], pos: usize) -> Result<Vec<u8>> {
        match self.cx.format.value_at(buf, pos)? {
            ValueRef::Inline(bytes) => Ok(bytes.to_vec()),
            ValueRef::Offload(id) => {
                let mut cursor = self.cx.file.cursor(PfMode::Write);
                let mut value = Vec::new();
                offload::load(&mut cursor, id, &mut value)?;
                Ok(value)
            }
        }
    }

    fn insert_in_leaf(
        &mut self,
        key: &[u8],
        value: &[u8],
        merger: &mut ByteMerger<'_>,
    ) -> Result<()> {
        let leaf = self.current()?;
        let buf = self.read(leaf)?;
        let (pos, hit) = search(self.cx.format, &buf, NodeKind::Leaf, key, self.cx.cmp)?;
        if !hit {
            let leaf = self.successor_of_current()?;
            self.insert_entry(leaf, pos, key, value)?;
            return Ok(());
        }
        let existing = self.load_value(&buf, pos)?;
        let new_value: Cow<'_, [u8]> = match merger(&existing)? {
            MergeResult::Unchanged => return Ok(()),
            MergeResult::Removed => {
                let leaf = self.successor_of_current()?;
                self.remove_entry(leaf, pos)?;
                return self.check_underflow(leaf);
            }
            MergeResult::Replaced => Cow::Borrowed(value),
            MergeResult::Merged(merged) => {
                self.check_entry_size(key, &merged)?;
                Cow::Owned(merged)
            }
        };
        let leaf = self.successor_of_current()?;
        if self.replace_value_in_place(leaf, pos, key.len(), &new_value)? {
            return Ok(());
        }
        self.remove_entry(leaf, pos)?;
        if !self.insert_entry(leaf, pos, key, &new_value)? {
            self.check_underflow(leaf)?;
        }
        Ok(())
    }

    fn replace_value_in_place(
        &self,
        leaf: PageId,
        pos: usize,
        key_len: usize,
        value: &[u8],
    ) -> Result<bool> {
        let format = self.cx.format;
        if needs_offload(format, key_len, value.len()) {
            return Ok(false);
        }
        self.write(leaf, |page| format.set_value_at(page, pos, value))
    }

    /// Returns true if the leaf had to split.
    fn insert_entry(&mut self, leaf: PageId, pos: usize, key: &[u8], value: &[u8]) -> Result<bool> {
        let format = self.cx.format;
        let stored = if needs_offload(format, key.len(), value.len()) {
            let mut cursor = self.cx.file.cursor(PfMode::Write);
            ValueRef::Offload(offload::store(&mut cursor, self.cx.ids, value, self.cx.gen)?)
        } else {
            ValueRef::Inline(value)
        };
        let overflow = format.leaf_overflow(&self.read(leaf)?, key.len(), stored.stored_len())?;
        match overflow {
            Overflow::No => {
                self.write(leaf, |page| format.insert_leaf_entry_at(page, pos, key, stored))?;
                Ok(false)
            }
            Overflow::NoNeedDefrag => {
                self.write(leaf, |page| {
                    format.defragment(page, NodeKind::Leaf)?;
                    format.insert_leaf_entry_at(page, pos, key, stored)
                })?;
                Ok(false)
            }
            Overflow::Yes => {
                self.split_leaf(leaf, pos, key, stored)?;
                Ok(true)
            }
        }
    }

    fn remove_entry(&self, leaf: PageId, pos: usize) -> Result<()> {
        let format = self.cx.format;
        let offloaded = self.write(leaf, |page| {
            let offloaded = match format.value_at(page, pos)? {
                ValueRef::Offload(id) => Some(id),
                ValueRef::Inline(_) => None,
            };
            format.remove_leaf_entry_at(page, pos)?;
            Ok(offloaded)
        })?;
        if let Some(id) = offloaded {
            offload::free(self.cx.ids, id, self.cx.gen)?;
        }
        Ok(())
    }

    fn split_leaf(
        &mut self,
        leaf: PageId,
        pos: usize,
        key: &[u8],
        value: ValueRef<'_>,
    ) -> Result<()> {
        let (format, gen) = (self.cx.format, self.cx.gen);
        let buf = self.read(leaf)?;
        let mut entries = read_leaf_entries(format, &buf)?;
        entries.insert(
            pos,
            LeafEntry {
                key: key.to_vec(),
                value: value.into_stored(),
            },
        );
        let split_at = leaf_split_point(format, &entries, self.cx.split_ratio)?;
        let right_entries = entries.split_off(split_at);
        let right_key = right_entries
            .first()
            .map(|entry| entry.key.clone())
            .ok_or_else(|| TreeError::inconsistency("leaf split left the right half empty"))?;
        let old_right = header_pointer(&buf, HeaderPointer::Right, gen, leaf)?;
        let new_right = self.cx.ids.acquire_new_id(gen)?;
        let layer = self.cx.layer;
        self.write(new_right, |page| {
            format.initialize(page, NodeKind::Leaf, layer, gen.unstable);
            format.write_leaf_entries(page, &right_entries)?;
            set_header_pointer(page, HeaderPointer::Left, Some(leaf), gen, new_right)?;
            set_header_pointer(page, HeaderPointer::Right, old_right, gen, new_right)
        })?;
        if let Some(old_right) = old_right {
            self.set_pointer(old_right, HeaderPointer::Left, Some(new_right))?;
        }
        self.write(leaf, |page| {
            format.write_leaf_entries(page, &entries)?;
            set_header_pointer(page, HeaderPointer::Right, Some(new_right), gen, leaf)
        })?;
        self.prop.has_right_key_insert = true;
        self.prop.mid_child = leaf;
        self.prop.right_child = new_right;
        self.prop.right_key = right_key;
        self.cx.stats.inc_leaf_splits();
        Ok(())
    }

    fn check_underflow(&mut self, leaf: PageId) -> Result<()> {
        if self.levels.len() <= 1 {
            return Ok(());
        }
        let buf = self.read(leaf)?;
        if !leaf_underflow(self.cx.format, &buf)? {
            return Ok(());
        }
        self.underflow_in_leaf(leaf, &buf)
    }

    fn underflow_in_leaf(&mut self, current: PageId, buf: &[u8]) -> Result<()> {
        let (format, gen) = (self.cx.format, self.cx.gen);
        let entries = read_leaf_entries(format, buf)?;
        if let Some(left) = header_pointer(buf, HeaderPointer::Left, gen, current)? {
            let (left_buf, _) = self.node(left)?;
            let left_entries = read_leaf_entries(format, &left_buf)?;
            match plan_rebalance(format, &left_entries, &entries) {
                Rebalance::Move(count) => {
                    return self.rebalance_leaf(left, current, left_entries, entries, count)
                }
                Rebalance::Merge => {
                    return self.merge_from_left(left, &left_buf, current, left_entries, entries)
                }
                Rebalance::Nothing => {}
            }
        }
        if let Some(right) = header_pointer(buf, HeaderPointer::Right, gen, current)? {
            let (right_buf, _) = self.node(right)?;
            let right_entries = read_leaf_entries(format, &right_buf)?;
            if leaf_entries_space(format, &entries) + leaf_entries_space(format, &right_entries)
                <= format.leaf_capacity()
            {
                return self.merge_to_right(current, right, entries, right_entries);
            }
        }
        Ok(())
    }

    fn rebalance_leaf(
        &mut self,
        left: PageId,
        current: PageId,
        mut left_entries: Vec<LeafEntry>,
        entries: Vec<LeafEntry>,
        count: usize,
    ) -> Result<()> {
        let format = self.cx.format;
        let left = self.successor(left, Some(ChildUpdate::Left))?;
        let mut moved = left_entries.split_off(left_entries.len().saturating_sub(count));
        moved.extend(entries);
        let first_key = moved
            .first()
            .map(|entry| entry.key.clone())
            .ok_or_else(|| TreeError::inconsistency("rebalance moved no entries"))?;
        // Receiving node first. Backward seeks depend on this order.
        self.write(current, |page| format.write_leaf_entries(page, &moved))?;
        self.write(left, |page| format.write_leaf_entries(page, &left_entries))?;
        self.prop.has_left_key_replace = true;
        self.prop.left_key = first_key;
        self.prop.key_replace = KeyReplace::Replace;
        self.cx.stats.inc_leaf_rebalances();
        Ok(())
    }

    fn merge_from_left(
        &mut self,
        left: PageId,
        left_buf: &[u8],
        current: PageId,
        mut left_entries: Vec<LeafEntry>,
        entries: Vec<LeafEntry>,
    ) -> Result<()> {
        let format = self.cx.format;
        left_entries.extend(entries);
        self.write(current, |page| format.write_leaf_entries(page, &left_entries))?;
        self.remove_from_sibling_line(left, left_buf)?;
        self.set_pointer(left, HeaderPointer::Successor, Some(current))?;
        self.cx.ids.release_id(left, self.cx.gen)?;
        self.prop.has_left_key_replace = true;
        self.prop.key_replace = KeyReplace::Bubble;
        self.cx.stats.inc_leaf_merges();
        Ok(())
    }

    fn merge_to_right(
        &mut self,
        current: PageId,
        right: PageId,
        mut entries: Vec<LeafEntry>,
        right_entries: Vec<LeafEntry>,
    ) -> Result<()> {
        let format = self.cx.format;
        let right = self.successor(right, Some(ChildUpdate::Right))?;
        entries.extend(right_entries);
        self.write(right, |page| format.write_leaf_entries(page, &entries))?;
        let buf = self.read(current)?;
        self.remove_from_sibling_line(current, &buf)?;
        self.set_pointer(current, HeaderPointer::Successor, Some(right))?;
        self.cx.ids.release_id(current, self.cx.gen)?;
        self.prop.has_right_key_replace = true;
        self.prop.key_replace = KeyReplace::Bubble;
        self.cx.stats.inc_leaf_merges();
        Ok(())
    }

    /// Links the siblings of `id` to each other.
    fn remove_from_sibling_line(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let gen = self.cx.gen;
        let left = header_pointer(buf, HeaderPointer::Left, gen, id)?;
        let right = header_pointer(buf, HeaderPointer::Right, gen, id)?;
        if let Some(left) = left {
            self.set_pointer(left, HeaderPointer::Right, right)?;
        }
        if let Some(right) = right {
            self.set_pointer(right, HeaderPointer::Left, left)?;
        }
        Ok(())
    }

    fn handle_structure_changes(&mut self) -> Result<()> {
        while self.prop.any() {
            if self.levels.len() <= 1 {
                return Ok(());
            }
            self.levels.pop();
            let Some(&Level { id: parent, child_pos: pos }) = self.levels.last() else {
                return Ok(());
            };
            let count = key_count(&self.read(parent)?);

            if self.prop.has_left_child_update {
                self.prop.has_left_child_update = false;
                let child = self.prop.left_child;
                if pos == 0 {
                    self.update_child_in_sibling(parent, HeaderPointer::Left, child)?;
                } else {
                    self.set_child(parent, pos - 1, child)?;
                }
            }
            if self.prop.has_mid_child_update {
                self.prop.has_mid_child_update = false;
                self.set_child(parent, pos, self.prop.mid_child)?;
            }
            if self.prop.has_right_child_update {
                self.prop.has_right_child_update = false;
                let child = self.prop.right_child;
                if pos == count {
                    self.update_child_in_sibling(parent, HeaderPointer::Right, child)?;
                } else {
                    self.set_child(parent, pos + 1, child)?;
                }
            }
            // Inserts go first since a replace may split and insert again.
            if self.prop.has_right_key_insert {
                self.prop.has_right_key_insert = false;
                let key = mem::take(&mut self.prop.right_key);
                let child = self.prop.right_child;
                let node = self.successor_of_current()?;
                self.insert_in_internal(node, pos, &key, child)?;
            }
            if self.prop.has_left_key_replace && pos != 0 {
                self.prop.has_left_key_replace = false;
                match self.prop.key_replace {
                    KeyReplace::Replace => {
                        let key = mem::take(&mut self.prop.left_key);
                        self.overwrite_key(pos - 1, &key)?;
                    }
                    KeyReplace::Bubble => self.replace_key_by_bubble(pos - 1)?,
                }
            }
            let count = key_count(&self.read(self.current()?)?);
            if self.prop.has_right_key_replace && pos != count {
                self.prop.has_right_key_replace = false;
                match self.prop.key_replace {
                    KeyReplace::Replace => {
                        let key = mem::take(&mut self.prop.right_key);
                        self.overwrite_key(pos, &key)?;
                    }
                    KeyReplace::Bubble => self.replace_key_by_bubble(pos)?,
                }
            }
        }
        Ok(())
    }

    /// The changed child sits at the edge of `parent`, so its pointer lives in
    /// the neighbouring parent: the rightmost child of the left one or the
    /// leftmost child of the right one.
    fn update_child_in_sibling(
        &self,
        parent: PageId,
        side: HeaderPointer,
        child: PageId,
    ) -> Result<()> {
        let sibling = header_pointer(&self.read(parent)?, side, self.cx.gen, parent)?
            .ok_or_else(|| {
                TreeError::inconsistency(format!(
                    "node {parent} has no {side:?} sibling holding child {child}"
                ))
            })?;
        let pos = match side {
            HeaderPointer::Left => key_count(&self.node(sibling)?.0),
            _ => 0,
        };
        self.set_child(sibling, pos, child)
    }

    fn insert_in_internal(
        &mut self,
        node: PageId,
        pos: usize,
        key: &[u8],
        child: PageId,
    ) -> Result<()> {
        let format = self.cx.format;
        let pair = new_child_pair(child, self.cx.gen);
        let overflow = format.internal_overflow(&self.read(node)?, key.len())?;
        match overflow {
            Overflow::No => {
                self.write(node, |page| format.insert_key_and_right_child_at(page, pos, key, &pair))
            }
            Overflow::NoNeedDefrag => self.write(node, |page| {
                format.defragment(page, NodeKind::Internal)?;
                format.insert_key_and_right_child_at(page, pos, key, &pair)
            }),
            Overflow::Yes => self.split_internal(node, pos, key, pair),
        }
    }

    fn split_internal(
        &mut self,
        node: PageId,
        pos: usize,
        key: &[u8],
        pair: ChildPair,
    ) -> Result<()> {
        let (format, gen, layer) = (self.cx.format, self.cx.gen, self.cx.layer);
        let buf = self.read(node)?;
        let mut entries = read_internal_entries(format, &buf)?;
        entries.keys.insert(pos, key.to_vec());
        entries.children.insert(pos + 1, pair);
        let split_at = internal_split_point(format, &entries.keys, self.cx.split_ratio)?;
        let right = InternalEntries {
            keys: entries.keys.split_off(split_at + 1),
            children: entries.children.split_off(split_at + 1),
        };
        let separator = entries
            .keys
            .pop()
            .ok_or_else(|| TreeError::inconsistency("internal split without separator"))?;

        let old_right = header_pointer(&buf, HeaderPointer::Right, gen, node)?;
        let new_right = self.cx.ids.acquire_new_id(gen)?;
        self.write(new_right, |page| {
            format.initialize(page, NodeKind::Internal, layer, gen.unstable);
            format.write_internal_entries(page, &right)?;
            set_header_pointer(page, HeaderPointer::Left, Some(node), gen, new_right)?;
            set_header_pointer(page, HeaderPointer::Right, old_right, gen, new_right)
        })?;
        if let Some(old_right) = old_right {
            self.set_pointer(old_right, HeaderPointer::Left, Some(new_right))?;
        }
        self.write(node, |page| {
            format.write_internal_entries(page, &entries)?;
            set_header_pointer(page, HeaderPointer::Right, Some(new_right), gen, node)
        })?;
        self.prop.has_right_key_insert = true;
        self.prop.mid_child = node;
        self.prop.right_child = new_right;
        self.prop.right_key = separator;
        self.cx.stats.inc_internal_splits();
        Ok(())
    }

    fn overwrite_key(&mut self, pos: usize, key: &[u8]) -> Result<()> {
        let format = self.cx.format;
        let node = self.successor_of_current()?;
        if self.write(node, |page| format.set_key_at(page, pos, key))? {
            return Ok(());
        }
        let child = child_at(format, &self.read(node)?, pos + 1, self.cx.gen, node)?;
        self.write(node, |page| format.remove_key_and_right_child_at(page, pos))?;
        self.insert_in_internal(node, pos, key, child)
    }

    fn replace_key_by_bubble(&mut self, pos: usize) -> Result<()> {
        let format = self.cx.format;
        let ancestor = self.current()?;
        let subtree = child_at(format, &self.read(ancestor)?, pos, self.cx.gen, ancestor)?;
        match self.bubble_rightmost(subtree, ancestor, pos, 0)? {
            Some(key) => self.overwrite_key(pos, &key),
            None => {
                let node = self.successor_of_current()?;
                self.write(node, |page| format.remove_key_and_left_child_at(page, pos))
            }
        }
    }

    /// Takes the rightmost key out of the subtree at `id`, dropping internal
    /// nodes that are left without children on the way. `None` means the
    /// subtree is gone and its pointer in `parent` must be removed too.
    fn bubble_rightmost(
        &mut self,
        id: PageId,
        parent: PageId,
        parent_pos: usize,
        depth: usize,
    ) -> Result<Option<Vec<u8>>> {
        if depth >= MAX_TREE_DEPTH {
            return Err(TreeError::inconsistency(format!(
                "rightmost path below {parent} deeper than {MAX_TREE_DEPTH} levels"
            )));
        }
        let (format, gen) = (self.cx.format, self.cx.gen);
        let (buf, kind) = self.node(id)?;
        if kind == NodeKind::Leaf {
            return Ok(None);
        }
        let count = key_count(&buf);
        let rightmost = child_at(format, &buf, count, gen, id)?;
        if let Some(key) = self.bubble_rightmost(rightmost, id, count, depth + 1)? {
            return Ok(Some(key));
        }
        if count == 0 {
            let buf = self.read(id)?;
            self.remove_from_sibling_line(id, &buf)?;
            self.cx.ids.release_id(id, gen)?;
            return Ok(None);
        }
        let node = self.successor(id, None)?;
        let key = self.write(node, |page| {
            let key = format.key_at(page, count - 1, NodeKind::Internal)?.to_vec();
            format.remove_key_and_right_child_at(page, count - 1)?;
            Ok(key)
        })?;
        if node != id {
            self.set_child(parent, parent_pos, node)?;
        }
        Ok(Some(key))
    }

    fn update_root(&mut self, root: &mut Root) -> Result<()> {
        let (format, gen, layer) = (self.cx.format, self.cx.gen, self.cx.layer);
        if self.prop.has_right_key_insert {
            self.prop.has_right_key_insert = false;
            self.prop.has_mid_child_update = false;
            let key = mem::take(&mut self.prop.right_key);
            let (left, right) = (self.prop.mid_child, self.prop.right_child);
            let new_root = self.cx.ids.acquire_new_id(gen)?;
            self.write(new_root, |page| {
                format.initialize(page, NodeKind::Internal, layer, gen.unstable);
                set_child_at(format, page, 0, left, gen, new_root)?;
                format.insert_key_and_right_child_at(page, 0, &key, &new_child_pair(right, gen))
            })?;
            *root = Root {
                id: new_root,
                generation: gen.unstable,
            };
            self.cx.stats.inc_tree_growths();
            self.cx.monitor.tree_growth();
            tracing::trace!(target: "genbtree::tree", root = new_root.0, "root split");
        } else if self.prop.has_mid_child_update {
            self.prop.has_mid_child_update = false;
            *root = Root {
                id: self.prop.mid_child,
                generation: gen.unstable,
            };
        }
        self.shrink(root)
    }

    fn shrink(&mut self, root: &mut Root) -> Result<()> {
        let gen = self.cx.gen;
        for _ in 0..MAX_TREE_DEPTH {
            let (buf, kind) = self.node(root.id)?;
            if kind == NodeKind::Leaf || key_count(&buf) > 0 {
                return Ok(());
            }
            let child = child_at(self.cx.format, &buf, 0, gen, root.id)?;
            self.cx.ids.release_id(root.id, gen)?;
            *root = Root {
                id: child,
                generation: gen.unstable,
            };
            self.cx.stats.inc_tree_shrinks();
            self.cx.monitor.tree_shrink();
        }
        Err(TreeError::inconsistency("root collapse did not reach a node with keys"))
    }
}

/// Writes an empty root leaf at `id`.
pub(crate) fn initialize_root(
    file: &PagedFile,
    format: &dyn NodeFormat,
    id: PageId,
    layer: Layer,
    gen: Generation,
) -> Result<()> {
    let cursor = file.acquire(id, PfMode::Write)?;
    let mut page = cursor.write()?;
    format.initialize(&mut page, NodeKind::Leaf, layer, gen.unstable);
    Ok(())
}
