//! Tree node page format.
//!
//! Every node shares the same header; the body is laid out by one of two
//! [`NodeFormat`] implementations picked from the layout's sizing mode.
//!
//! ```text
//! [0]      page type            [16..48]  left sibling GSPP
//! [1]      node kind            [48..80]  right sibling GSPP
//! [2]      layer                [80..112] successor GSPP
//! [4..12]  generation           [112..]   format specific
//! [12..16] key count
//! ```

use std::cmp::Ordering;
use std::fmt;

use super::gspp::{self, PairFailure, Pointer, GSPP_SIZE};
use crate::types::{Generation, PageId, Result, TreeError};

mod dynamic;
mod fixed;
pub(crate) mod offload;

pub use dynamic::{needs_offload, DynamicSizeNode};
pub use fixed::FixedSizeNode;

/// Offset of the page type byte shared by every non-meta page.
pub const PAGE_TYPE_OFFSET: usize = 0;
/// Page type of tree nodes.
pub const PAGE_TYPE_TREE_NODE: u8 = 1;
/// Page type of free-list pages.
pub const PAGE_TYPE_FREELIST: u8 = 2;
/// Page type of offload pages.
pub const PAGE_TYPE_OFFLOAD: u8 = 3;

const NODE_KIND_OFFSET: usize = 1;
const LAYER_OFFSET: usize = 2;
const GENERATION_OFFSET: usize = 4;
const KEY_COUNT_OFFSET: usize = 12;
/// Offset of the left sibling pointer pair.
pub const LEFT_SIBLING_OFFSET: usize = 16;
/// Offset of the right sibling pointer pair.
pub const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + GSPP_SIZE;
/// Offset of the successor pointer pair.
pub const SUCCESSOR_OFFSET: usize = RIGHT_SIBLING_OFFSET + GSPP_SIZE;
/// Length of the header every format starts with.
pub const BASE_HEADER_LENGTH: usize = SUCCESSOR_OFFSET + GSPP_SIZE;

/// Leaf or internal node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Holds keys and values.
    Leaf = 1,
    /// Holds separator keys and child pointers.
    Internal = 2,
}

impl NodeKind {
    /// Decodes the node kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Leaf),
            2 => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Which tree of a multi-root file a node belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layer {
    /// Nodes of a data tree (or the only tree of a single-root file).
    Data = 0,
    /// Nodes of the tree mapping root keys to data tree roots.
    Root = 1,
}

/// Body layout identifier persisted in the meta page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FormatKind {
    /// Fixed-size keys and values in packed arrays.
    Fixed = 1,
    /// Variable-size entries in an allocation region.
    Dynamic = 2,
}

impl FormatKind {
    /// Decodes the persisted byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Fixed),
            2 => Some(Self::Dynamic),
            _ => None,
        }
    }
}

/// Result of asking whether one more entry fits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Overflow {
    /// The node must split.
    Yes,
    /// Fits as is.
    No,
    /// Fits once dead space is reclaimed.
    NoNeedDefrag,
}

/// Value as stored in a leaf slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoredValue {
    /// The value bytes live in the node.
    Inline(Vec<u8>),
    /// The value lives on its own offload page.
    Offload(PageId),
}

impl StoredValue {
    /// Bytes this value occupies inside the node.
    pub fn stored_len(&self) -> usize {
        match self {
            StoredValue::Inline(bytes) => bytes.len(),
            StoredValue::Offload(_) => offload::REFERENCE_SIZE,
        }
    }

    /// Borrowed view.
    pub fn as_value_ref(&self) -> ValueRef<'_> {
        match self {
            StoredValue::Inline(bytes) => ValueRef::Inline(bytes),
            StoredValue::Offload(id) => ValueRef::Offload(*id),
        }
    }
}

/// Borrowed leaf value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueRef<'a> {
    /// Inline bytes.
    Inline(&'a [u8]),
    /// Reference to an offload page.
    Offload(PageId),
}

impl ValueRef<'_> {
    /// Owned copy.
    pub fn into_stored(self) -> StoredValue {
        match self {
            ValueRef::Inline(bytes) => StoredValue::Inline(bytes.to_vec()),
            ValueRef::Offload(id) => StoredValue::Offload(id),
        }
    }

    /// Bytes this value occupies inside the node.
    pub fn stored_len(&self) -> usize {
        match self {
            ValueRef::Inline(bytes) => bytes.len(),
            ValueRef::Offload(_) => offload::REFERENCE_SIZE,
        }
    }
}

/// One decoded leaf entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeafEntry {
    /// Encoded key.
    pub key: Vec<u8>,
    /// Stored value.
    pub value: StoredValue,
}

/// Raw child pointer pair, moved between nodes verbatim.
pub type ChildPair = [u8; GSPP_SIZE];

/// Decoded internal node body.
#[derive(Clone, Debug, Default)]
pub struct InternalEntries {
    /// Separator keys.
    pub keys: Vec<Vec<u8>>,
    /// Child pointer pairs, one more than keys.
    pub children: Vec<ChildPair>,
}

/// Comparator over encoded keys.
pub type KeyCmp = fn(&[u8], &[u8]) -> Ordering;

/// Body layout of a node page.
///
/// Implementations only touch the bytes past [`BASE_HEADER_LENGTH`] and the
/// key count; the shared header is handled by the free functions in this
/// module.
pub trait NodeFormat: Send + Sync + fmt::Debug {
    /// Identifier persisted in the meta page.
    fn kind(&self) -> FormatKind;
    /// Zeroes `buf` and writes an empty node.
    fn initialize(&self, buf: &mut [u8], kind: NodeKind, layer: Layer, generation: u64);

    /// Key at `pos`.
    fn key_at<'a>(&self, buf: &'a [u8], pos: usize, kind: NodeKind) -> Result<&'a [u8]>;
    /// Leaf value at `pos`.
    fn value_at<'a>(&self, buf: &'a [u8], pos: usize) -> Result<ValueRef<'a>>;
    /// Byte offset of the child pointer pair at `pos`.
    fn child_offset(&self, pos: usize) -> usize;
    /// Largest key count a node of `kind` can hold.
    fn max_key_count(&self, kind: NodeKind) -> usize;

    /// Space available for leaf entries.
    fn leaf_capacity(&self) -> usize;
    /// Space one leaf entry takes, bookkeeping included.
    fn leaf_entry_space(&self, key_len: usize, stored_len: usize) -> usize;
    /// Space taken by the live entries of a leaf.
    fn leaf_used_space(&self, buf: &[u8]) -> Result<usize>;
    /// Whether a leaf entry of the given sizes fits.
    fn leaf_overflow(&self, buf: &[u8], key_len: usize, stored_len: usize) -> Result<Overflow>;
    /// Space available for internal keys (excluding the first child).
    fn internal_capacity(&self) -> usize;
    /// Space one internal key and its right child take.
    fn internal_key_space(&self, key_len: usize) -> usize;
    /// Whether one more key and child fit.
    fn internal_overflow(&self, buf: &[u8], key_len: usize) -> Result<Overflow>;

    /// Inserts an entry at `pos`, shifting later entries right.
    fn insert_leaf_entry_at(&self, buf: &mut [u8], pos: usize, key: &[u8], value: ValueRef<'_>)
        -> Result<()>;
    /// Removes the entry at `pos`.
    fn remove_leaf_entry_at(&self, buf: &mut [u8], pos: usize) -> Result<()>;
    /// Overwrites the value at `pos` if it can be done in place.
    fn set_value_at(&self, buf: &mut [u8], pos: usize, value: &[u8]) -> Result<bool>;
    /// Inserts `key` at `pos` and `child` at `pos + 1`.
    fn insert_key_and_right_child_at(
        &self,
        buf: &mut [u8],
        pos: usize,
        key: &[u8],
        child: &ChildPair,
    ) -> Result<()>;
    /// Removes the key at `pos` and the child at `pos + 1`.
    fn remove_key_and_right_child_at(&self, buf: &mut [u8], pos: usize) -> Result<()>;
    /// Removes the key at `pos` and the child at `pos`.
    fn remove_key_and_left_child_at(&self, buf: &mut [u8], pos: usize) -> Result<()>;
    /// Overwrites the internal key at `pos` if it can be done in place.
    fn set_key_at(&self, buf: &mut [u8], pos: usize, key: &[u8]) -> Result<bool>;

    /// Replaces the whole leaf body.
    fn write_leaf_entries(&self, buf: &mut [u8], entries: &[LeafEntry]) -> Result<()>;
    /// Replaces the whole internal body.
    fn write_internal_entries(&self, buf: &mut [u8], entries: &InternalEntries) -> Result<()>;
    /// Reclaims dead space.
    fn defragment(&self, buf: &mut [u8], kind: NodeKind) -> Result<()>;
    /// Format specific bookkeeping check used by the consistency checker.
    fn check_meta(&self, buf: &[u8], kind: NodeKind) -> std::result::Result<(), String>;

    /// Longest accepted key.
    fn max_key_size(&self) -> usize;
    /// Longest key plus value stored inline.
    fn inline_entry_cap(&self) -> usize;
    /// Longest accepted key plus value.
    fn key_value_size_cap(&self) -> usize;
}

/// Page type byte.
pub fn page_type(buf: &[u8]) -> u8 {
    buf[PAGE_TYPE_OFFSET]
}

/// True if the page carries the tree node page type.
pub fn is_tree_node(buf: &[u8]) -> bool {
    page_type(buf) == PAGE_TYPE_TREE_NODE
}

/// Raw node kind byte.
pub fn raw_node_kind(buf: &[u8]) -> u8 {
    buf[NODE_KIND_OFFSET]
}

/// Decoded node kind.
pub fn node_kind(buf: &[u8]) -> Option<NodeKind> {
    NodeKind::from_u8(raw_node_kind(buf))
}

/// Node kind of a page that must be a tree node.
pub fn expect_node_kind(buf: &[u8], page: PageId) -> Result<NodeKind> {
    if !is_tree_node(buf) {
        return Err(TreeError::inconsistency(format!(
            "page {page} is not a tree node (type {})",
            page_type(buf)
        )));
    }
    node_kind(buf).ok_or_else(|| {
        TreeError::inconsistency(format!(
            "page {page} has unknown node kind {}",
            raw_node_kind(buf)
        ))
    })
}

/// Raw layer byte.
pub fn layer(buf: &[u8]) -> u8 {
    buf[LAYER_OFFSET]
}

/// Generation the node was last written at.
pub fn generation(buf: &[u8]) -> u64 {
    read_u64(buf, GENERATION_OFFSET)
}

/// Sets the node generation.
pub fn set_generation(buf: &mut [u8], generation: u64) {
    buf[GENERATION_OFFSET..GENERATION_OFFSET + 8].copy_from_slice(&generation.to_be_bytes());
}

/// Number of keys in the node.
pub fn key_count(buf: &[u8]) -> usize {
    read_u32(buf, KEY_COUNT_OFFSET) as usize
}

/// Sets the key count.
pub fn set_key_count(buf: &mut [u8], count: usize) {
    buf[KEY_COUNT_OFFSET..KEY_COUNT_OFFSET + 4].copy_from_slice(&(count as u32).to_be_bytes());
}

/// Zeroes the page and writes the shared header of an empty node.
pub(crate) fn initialize_header(buf: &mut [u8], kind: NodeKind, layer: Layer, generation: u64) {
    buf.fill(0);
    buf[PAGE_TYPE_OFFSET] = PAGE_TYPE_TREE_NODE;
    buf[NODE_KIND_OFFSET] = kind as u8;
    buf[LAYER_OFFSET] = layer as u8;
    set_generation(buf, generation);
}

/// Named pointer pairs of the shared header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeaderPointer {
    /// Left sibling.
    Left,
    /// Right sibling.
    Right,
    /// Newer version of the same node.
    Successor,
}

impl HeaderPointer {
    /// Offset of the pair.
    pub fn offset(self) -> usize {
        match self {
            HeaderPointer::Left => LEFT_SIBLING_OFFSET,
            HeaderPointer::Right => RIGHT_SIBLING_OFFSET,
            HeaderPointer::Successor => SUCCESSOR_OFFSET,
        }
    }

    fn name(self) -> &'static str {
        match self {
            HeaderPointer::Left => "left sibling",
            HeaderPointer::Right => "right sibling",
            HeaderPointer::Successor => "successor",
        }
    }
}

/// Resolves a header pointer, turning pair failures into inconsistencies.
pub fn header_pointer(
    buf: &[u8],
    which: HeaderPointer,
    gen: Generation,
    page: PageId,
) -> Result<Option<PageId>> {
    gspp::read(buf, which.offset(), gen)
        .map(|pointer| pointer.id)
        .map_err(|failure| pointer_error(page, which.name(), failure, gen))
}

/// Writes a header pointer.
pub fn set_header_pointer(
    buf: &mut [u8],
    which: HeaderPointer,
    target: Option<PageId>,
    gen: Generation,
    page: PageId,
) -> Result<()> {
    gspp::write(buf, which.offset(), target, gen)
        .map(|_| ())
        .map_err(|failure| pointer_error(page, which.name(), failure, gen))
}

/// Raw resolution of the child pair at `pos`.
pub fn child_pointer(
    format: &dyn NodeFormat,
    buf: &[u8],
    pos: usize,
    gen: Generation,
) -> std::result::Result<Pointer, PairFailure> {
    gspp::read(buf, format.child_offset(pos), gen)
}

/// Child at `pos` of an internal node on the write path, which must exist.
pub fn child_at(
    format: &dyn NodeFormat,
    buf: &[u8],
    pos: usize,
    gen: Generation,
    page: PageId,
) -> Result<PageId> {
    let pointer = child_pointer(format, buf, pos, gen)
        .map_err(|failure| pointer_error(page, "child", failure, gen))?;
    pointer
        .id
        .ok_or_else(|| TreeError::inconsistency(format!("page {page} has no child at {pos}")))
}

/// Writes the child pair at `pos`.
pub fn set_child_at(
    format: &dyn NodeFormat,
    buf: &mut [u8],
    pos: usize,
    child: PageId,
    gen: Generation,
    page: PageId,
) -> Result<()> {
    gspp::write(buf, format.child_offset(pos), Some(child), gen)
        .map(|_| ())
        .map_err(|failure| pointer_error(page, "child", failure, gen))
}

/// A freshly written child pair pointing at `child`.
pub fn new_child_pair(child: PageId, gen: Generation) -> ChildPair {
    let mut pair = [0u8; GSPP_SIZE];
    gspp::write_slot(&mut pair, 0, gen.unstable, child.0);
    pair
}

fn pointer_error(page: PageId, what: &str, failure: PairFailure, gen: Generation) -> TreeError {
    TreeError::inconsistency(format!(
        "page {page}: unusable {what} pointer {failure} at generation {gen}"
    ))
}

/// Binary search for `key`. Returns the position and whether it was a hit.
pub fn search(
    format: &dyn NodeFormat,
    buf: &[u8],
    kind: NodeKind,
    key: &[u8],
    cmp: KeyCmp,
) -> Result<(usize, bool)> {
    let count = key_count(buf);
    let (mut lo, mut hi) = (0usize, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(format.key_at(buf, mid, kind)?, key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((lo, false))
}

/// Child to descend into for a search result in an internal node.
pub fn child_position(pos: usize, hit: bool) -> usize {
    if hit {
        pos + 1
    } else {
        pos
    }
}

/// Decodes every entry of a leaf.
pub fn read_leaf_entries(format: &dyn NodeFormat, buf: &[u8]) -> Result<Vec<LeafEntry>> {
    (0..key_count(buf))
        .map(|pos| {
            Ok(LeafEntry {
                key: format.key_at(buf, pos, NodeKind::Leaf)?.to_vec(),
                value: format.value_at(buf, pos)?.into_stored(),
            })
        })
        .collect()
}

/// Decodes every key and child pair of an internal node.
pub fn read_internal_entries(format: &dyn NodeFormat, buf: &[u8]) -> Result<InternalEntries> {
    let count = key_count(buf);
    let mut entries = InternalEntries {
        keys: Vec::with_capacity(count),
        children: Vec::with_capacity(count + 1),
    };
    for pos in 0..count {
        entries
            .keys
            .push(format.key_at(buf, pos, NodeKind::Internal)?.to_vec());
    }
    for pos in 0..=count {
        let offset = format.child_offset(pos);
        let mut pair = [0u8; GSPP_SIZE];
        pair.copy_from_slice(
            buf.get(offset..offset + GSPP_SIZE)
                .ok_or(TreeError::Corruption("child offset beyond page"))?,
        );
        entries.children.push(pair);
    }
    Ok(entries)
}

/// Space the given leaf entries take.
pub fn leaf_entries_space(format: &dyn NodeFormat, entries: &[LeafEntry]) -> usize {
    entries
        .iter()
        .map(|e| format.leaf_entry_space(e.key.len(), e.value.stored_len()))
        .sum()
}

/// Picks where to split a run of leaf entries: `entries[..m]` stays left.
///
/// The split is the point closest to `ratio` of the total space for which
/// both halves fit.
pub fn leaf_split_point(
    format: &dyn NodeFormat,
    entries: &[LeafEntry],
    ratio: f64,
) -> Result<usize> {
    let sizes: Vec<usize> = entries
        .iter()
        .map(|e| format.leaf_entry_space(e.key.len(), e.value.stored_len()))
        .collect();
    split_point(&sizes, format.leaf_capacity(), ratio, 0)
        .ok_or_else(|| TreeError::inconsistency("no leaf split point keeps both halves in bounds"))
}

/// Picks where to split internal keys: `keys[..m]` stays left, `keys[m]`
/// moves up and `keys[m + 1..]` goes right.
pub fn internal_split_point(
    format: &dyn NodeFormat,
    keys: &[Vec<u8>],
    ratio: f64,
) -> Result<usize> {
    let sizes: Vec<usize> = keys
        .iter()
        .map(|k| format.internal_key_space(k.len()))
        .collect();
    split_point(&sizes, format.internal_capacity(), ratio, 1).ok_or_else(|| {
        TreeError::inconsistency("no internal split point keeps both halves in bounds")
    })
}

/// `separator` is 1 when the entry at the split point leaves both halves.
fn split_point(sizes: &[usize], capacity: usize, ratio: f64, separator: usize) -> Option<usize> {
    let n = sizes.len();
    if n < 2 + separator {
        return None;
    }
    let total: usize = sizes.iter().sum();
    let target = (total as f64 * ratio.clamp(0.0, 1.0)) as usize;
    let mut prefix = vec![0usize; n + 1];
    for (i, size) in sizes.iter().enumerate() {
        prefix[i + 1] = prefix[i] + size;
    }
    let fits = |m: usize| prefix[m] <= capacity && total - prefix[m + separator] <= capacity;
    let lowest = 1;
    let highest = n - 1 - separator;
    (lowest..=highest)
        .filter(|&m| fits(m))
        .min_by_key(|&m| prefix[m].abs_diff(target))
}

/// Outcome of looking at an underflowing leaf and its left sibling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rebalance {
    /// Both fit in one node.
    Merge,
    /// Move this many entries from the end of the left node.
    Move(usize),
    /// Leave both alone.
    Nothing,
}

/// Decides between merging two leaves and moving entries from `left` to
/// `right`.
pub fn plan_rebalance(
    format: &dyn NodeFormat,
    left: &[LeafEntry],
    right: &[LeafEntry],
) -> Rebalance {
    let left_space = leaf_entries_space(format, left);
    let right_space = leaf_entries_space(format, right);
    let capacity = format.leaf_capacity();
    if left_space + right_space <= capacity {
        return Rebalance::Merge;
    }
    let half = (left_space + right_space) / 2;
    let mut moved = 0;
    let mut right_now = right_space;
    for entry in left.iter().rev() {
        let size = format.leaf_entry_space(entry.key.len(), entry.value.stored_len());
        if right_now >= half || right_now + size > capacity || moved + 1 >= left.len() {
            break;
        }
        right_now += size;
        moved += 1;
    }
    if moved == 0 {
        Rebalance::Nothing
    } else {
        Rebalance::Move(moved)
    }
}

/// True if the leaf is less than half full.
pub fn leaf_underflow(format: &dyn NodeFormat, buf: &[u8]) -> Result<bool> {
    Ok(format.leaf_used_space(buf)? * 2 < format.leaf_capacity())
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

pub(crate) fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

pub(crate) fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_be_bytes());
}
