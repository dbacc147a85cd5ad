//! Lock-free range scans.
//!
//! A seek never latches more than one page at a time: every node is copied
//! out of the page cache and read from that copy. Concurrent writers are
//! detected through generations. A pointer whose target was written after
//! the pointer itself, a slot that does not resolve, or a page that is no
//! longer a tree node are only legal if a checkpoint happened since the
//! cursor last looked at the root; in that case the cursor goes back to the
//! root and continues after the last key it returned. Otherwise the tree is
//! inconsistent.
//!
//! Entries only ever move rightwards (splits and merges both write into the
//! right-hand node first), so forward scans simply follow right siblings.
//! Backward scans additionally check that the node they came from did not
//! change while they stepped left.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

use super::gspp::{self, Pointer};
use super::layout::Layout;
use super::logic::{Root, MAX_TREE_DEPTH};
use super::node::{
    child_pointer, generation, key_count, node_kind, offload, search, HeaderPointer, KeyCmp,
    NodeFormat, NodeKind, ValueRef, SUCCESSOR_OFFSET,
};
use super::stats::TreeStats;
use crate::primitives::pager::{PageCursor, PagedFile, PfMode};
use crate::types::{Generation, PageId, Result, TreeError};

/// Restarts in a row without returning an entry before giving up.
const MAX_RESTARTS: usize = 1024;
/// Successor pointers followed from one pointer before giving up.
const MAX_SUCCESSOR_HOPS: usize = 64;

/// Where a reader finds the current root and generation.
pub(crate) trait RootSource: Send + Sync {
    /// Current generation pair.
    fn generation(&self) -> Generation;
    /// Current root. Called again every time a seek restarts.
    fn root(&self) -> Result<Root>;
}

/// Everything a seek needs from the tree.
#[derive(Clone)]
pub(crate) struct SeekContext {
    pub file: PagedFile,
    pub format: Arc<dyn NodeFormat>,
    pub cmp: KeyCmp,
    pub source: Arc<dyn RootSource>,
    pub stats: Arc<TreeStats>,
}

enum Interrupt {
    /// A concurrent change was observed; restart.
    Retry,
    /// Something only a concurrent checkpoint explains.
    Suspect(String),
    Fail(TreeError),
}

impl From<TreeError> for Interrupt {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::Io(_) | TreeError::FileClosed => Interrupt::Fail(err),
            other => Interrupt::Suspect(other.to_string()),
        }
    }
}

type Step<T> = std::result::Result<T, Interrupt>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Direction {
    Forward,
    Backward,
    Exact,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Restart,
    Sibling,
    Exhausted,
    Closed,
}

/// Byte-level seek cursor. Use [`Seeker`] for typed access.
pub(crate) struct SeekCursor {
    cx: SeekContext,
    cursor: PageCursor,
    prev: PageCursor,
    values: PageCursor,
    from: Vec<u8>,
    to: Vec<u8>,
    direction: Direction,
    level: Option<usize>,
    at_leaf: bool,
    state: State,
    gen: Generation,
    root: Option<PageId>,
    next: Option<(PageId, u64)>,
    last_key: Option<Vec<u8>>,
    /// Outermost key of the last node read, in scan direction.
    edge: Option<Vec<u8>>,
    /// Pages visited since the last buffered entry.
    chased: HashSet<PageId>,
    batch: VecDeque<(Vec<u8>, Vec<u8>)>,
    key: Vec<u8>,
    value: Vec<u8>,
    restarts: usize,
}

impl SeekCursor {
    /// An unpositioned cursor.
    pub fn new(cx: SeekContext) -> Self {
        let gen = cx.source.generation();
        Self {
            cursor: cx.file.cursor(PfMode::Read),
            prev: cx.file.cursor(PfMode::Read),
            values: cx.file.cursor(PfMode::Read),
            cx,
            from: Vec::new(),
            to: Vec::new(),
            direction: Direction::Forward,
            level: None,
            at_leaf: true,
            state: State::Exhausted,
            gen,
            root: None,
            next: None,
            last_key: None,
            edge: None,
            chased: HashSet::new(),
            batch: VecDeque::new(),
            key: Vec::new(),
            value: Vec::new(),
            restarts: 0,
        }
    }

    /// Positions the cursor before `[from, to)`, or `(to, from]` walked
    /// backwards if `from > to`. `from == to` finds that key only.
    pub fn seek(&mut self, from: &[u8], to: &[u8]) {
        self.reset(from, to, None);
    }

    /// Like [`SeekCursor::seek`] but reads the keys of the nodes at `level`,
    /// counted from the root, instead of leaf entries. Values are the child
    /// id right of each key, big endian.
    pub fn seek_level(&mut self, from: &[u8], to: &[u8], level: usize) {
        self.reset(from, to, Some(level));
    }

    fn reset(&mut self, from: &[u8], to: &[u8], level: Option<usize>) {
        self.from.clear();
        self.from.extend_from_slice(from);
        self.to.clear();
        self.to.extend_from_slice(to);
        self.direction = match (self.cx.cmp)(from, to) {
            Ordering::Less => Direction::Forward,
            Ordering::Greater => Direction::Backward,
            Ordering::Equal => Direction::Exact,
        };
        self.level = level;
        self.at_leaf = true;
        self.state = State::Restart;
        self.root = None;
        self.next = None;
        self.last_key = None;
        self.edge = None;
        self.chased.clear();
        self.batch.clear();
        self.key.clear();
        self.value.clear();
        self.restarts = 0;
    }

    /// Key of the current entry.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value of the current entry.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Whether the last node read was a leaf. Only meaningful for level seeks
    /// after the first call to [`SeekCursor::next`].
    pub fn at_leaf(&self) -> bool {
        self.at_leaf
    }

    /// Moves to the next entry. Returns false once the range is exhausted or
    /// the cursor is closed.
    pub fn next(&mut self) -> Result<bool> {
        loop {
            if let Some((key, value)) = self.batch.pop_front() {
                self.key = key;
                self.value = value;
                self.last_key = Some(self.key.clone());
                self.restarts = 0;
                return Ok(true);
            }
            match self.state {
                State::Exhausted | State::Closed => return Ok(false),
                State::Restart | State::Sibling => {}
            }
            match self.step() {
                Ok(()) => {}
                Err(Interrupt::Fail(err)) => return Err(err),
                Err(Interrupt::Retry) => self.restart(None)?,
                Err(Interrupt::Suspect(reason)) => self.restart(Some(reason))?,
            }
        }
    }

    /// Releases the cursor; further calls to `next` return false.
    pub fn close(&mut self) {
        self.state = State::Closed;
        self.batch.clear();
    }

    fn restart(&mut self, suspect: Option<String>) -> Result<()> {
        let current = self.cx.source.generation();
        if let Some(reason) = suspect {
            if current == self.gen {
                return Err(TreeError::inconsistency(reason));
            }
        }
        self.restarts += 1;
        if self.restarts > MAX_RESTARTS {
            return Err(TreeError::inconsistency(format!(
                "seek restarted {MAX_RESTARTS} times without progress at {current}"
            )));
        }
        self.cx.stats.inc_seek_retries();
        tracing::trace!(target: "genbtree::seek", restarts = self.restarts, "seek restart");
        self.batch.clear();
        self.edge = None;
        self.chased.clear();
        self.state = State::Restart;
        Ok(())
    }

    fn step(&mut self) -> Step<()> {
        match self.state {
            State::Restart => {
                if !self.descend()? {
                    self.state = State::Exhausted;
                    return Ok(());
                }
                if self.direction == Direction::Backward {
                    self.catch_up_right()?;
                }
                self.chased.insert(self.cursor.page_id());
                self.read_node()
            }
            State::Sibling => {
                let Some((id, pointer_gen)) = self.next.take() else {
                    self.state = State::Exhausted;
                    return Ok(());
                };
                std::mem::swap(&mut self.cursor, &mut self.prev);
                self.goto(id, pointer_gen)?;
                if self.direction == Direction::Backward && self.prev.should_retry()? {
                    return Err(Interrupt::Retry);
                }
                let landed = self.cursor.page_id();
                if !self.chased.insert(landed) {
                    return Err(Interrupt::Suspect(format!(
                        "sibling chain loops back to page {landed}"
                    )));
                }
                self.check_sibling_order()?;
                self.read_node()
            }
            State::Exhausted | State::Closed => Ok(()),
        }
    }

    /// Lower bound for forward scans, upper bound for backward ones.
    fn bound(&self) -> &[u8] {
        self.last_key.as_deref().unwrap_or(&self.from)
    }

    /// Walks from the root to the target level. Returns false if the level
    /// is below the leaves.
    fn descend(&mut self) -> Step<bool> {
        self.gen = self.cx.source.generation();
        let root = self.cx.source.root().map_err(Interrupt::Fail)?;
        if self.root.is_some_and(|seen| seen != root.id) {
            self.cx.stats.inc_root_catchups();
        }
        self.root = Some(root.id);
        let (mut id, mut pointer_gen) = (root.id, root.generation);
        for depth in 0..MAX_TREE_DEPTH {
            self.goto(id, pointer_gen)?;
            let buf = self.cursor.data();
            let kind = node_kind(buf)
                .ok_or_else(|| Interrupt::Suspect(format!("page {id} lost its node kind")))?;
            if kind == NodeKind::Leaf {
                self.at_leaf = true;
                return Ok(self.level.map_or(true, |level| level == depth));
            }
            if self.level == Some(depth) {
                self.at_leaf = false;
                return Ok(true);
            }
            let format = &*self.cx.format;
            let (pos, hit) = search(format, buf, kind, self.bound(), self.cx.cmp)?;
            let pos = if hit { pos + 1 } else { pos };
            let pointer = child_pointer(format, buf, pos, self.gen).map_err(|failure| {
                Interrupt::Suspect(format!("page {id} child {pos}: {failure}"))
            })?;
            (id, pointer_gen) = resolved(pointer, id, "child")?;
        }
        Err(Interrupt::Suspect(format!("tree deeper than {MAX_TREE_DEPTH} levels")))
    }

    /// Positions `cursor` at `id`, following successors, and validates the
    /// node against the pointer that led to it.
    fn goto(&mut self, mut id: PageId, mut pointer_gen: u64) -> Step<()> {
        for _ in 0..MAX_SUCCESSOR_HOPS {
            self.cursor.next(id)?;
            let buf = self.cursor.data();
            if node_kind(buf).is_none() {
                return Err(Interrupt::Suspect(format!("page {id} is not a tree node")));
            }
            let node_gen = generation(buf);
            if node_gen > pointer_gen || node_gen > self.gen.unstable {
                return Err(Interrupt::Suspect(format!(
                    "pointer to {id} has generation {pointer_gen} \
                     lower than node generation {node_gen}"
                )));
            }
            let successor = gspp::read(buf, SUCCESSOR_OFFSET, self.gen)
                .map_err(|failure| Interrupt::Suspect(format!("page {id} successor: {failure}")))?;
            match successor.id {
                None => return Ok(()),
                Some(next) => {
                    pointer_gen = successor.generation;
                    id = next;
                }
            }
        }
        Err(Interrupt::Suspect(format!("successor chain from {id} too long")))
    }

    /// A backward scan may land left of its bound if the node split after
    /// its parent was read. Moves right while the right sibling starts at or
    /// below the bound.
    fn catch_up_right(&mut self) -> Step<()> {
        for _ in 0..MAX_SUCCESSOR_HOPS {
            let buf = self.cursor.data();
            let kind = node_kind(buf).ok_or(Interrupt::Retry)?;
            let format = &*self.cx.format;
            let (pos, hit) = search(format, buf, kind, self.bound(), self.cx.cmp)?;
            if hit || pos < key_count(buf) {
                return Ok(());
            }
            let right = self.sibling(HeaderPointer::Right)?;
            let Some((right, pointer_gen)) = right else {
                return Ok(());
            };
            self.prev.next(right)?;
            let peek = self.prev.data();
            let starts_below = node_kind(peek) == Some(kind)
                && key_count(peek) > 0
                && (self.cx.cmp)(format.key_at(peek, 0, kind)?, self.bound()) != Ordering::Greater;
            if !starts_below {
                return Ok(());
            }
            self.goto(right, pointer_gen)?;
        }
        Ok(())
    }

    /// A sibling must continue the key order of the node it was reached
    /// from. Merges move entries rightwards, so a forward scan can see a
    /// sibling start below the previous edge while a writer is active; that
    /// is retried and only fails once restarts run out.
    fn check_sibling_order(&self) -> Step<()> {
        let Some(edge) = self.edge.as_deref() else {
            return Ok(());
        };
        let format = &*self.cx.format;
        let buf = self.cursor.data();
        let kind = node_kind(buf).ok_or(Interrupt::Retry)?;
        let count = key_count(buf);
        if count == 0 || count > format.max_key_count(kind) {
            return Ok(());
        }
        let (pos, expected) = match self.direction {
            Direction::Backward => (count - 1, Ordering::Less),
            _ => (0, Ordering::Greater),
        };
        if (self.cx.cmp)(format.key_at(buf, pos, kind)?, edge) != expected {
            return Err(Interrupt::Retry);
        }
        Ok(())
    }

    fn sibling(&self, which: HeaderPointer) -> Step<Option<(PageId, u64)>> {
        let id = self.cursor.page_id();
        let pointer = gspp::read(self.cursor.data(), which.offset(), self.gen)
            .map_err(|failure| Interrupt::Suspect(format!("page {id} sibling: {failure}")))?;
        Ok(pointer.id.map(|next| (next, pointer.generation)))
    }

    /// Buffers the in-range entries of the current node and decides where to
    /// go next.
    fn read_node(&mut self) -> Step<()> {
        let format = Arc::clone(&self.cx.format);
        let cmp = self.cx.cmp;
        let buf = self.cursor.data().to_vec();
        let kind = node_kind(&buf).ok_or(Interrupt::Retry)?;
        let count = key_count(&buf);
        if count > format.max_key_count(kind) {
            return Err(Interrupt::Suspect(format!(
                "page {} has unreasonable key count {count}",
                self.cursor.page_id()
            )));
        }
        let inclusive = self.last_key.is_none();
        let (pos, hit) = search(&*format, &buf, kind, self.bound(), cmp)?;
        let mut offloaded = false;
        let mut done = false;
        match self.direction {
            Direction::Forward | Direction::Exact => {
                let start = if hit && !inclusive { pos + 1 } else { pos };
                for p in start..count {
                    let key = format.key_at(&buf, p, kind)?;
                    let past_end = match self.direction {
                        Direction::Exact => cmp(key, &self.to) != Ordering::Equal,
                        _ => cmp(key, &self.to) != Ordering::Less,
                    };
                    if past_end {
                        done = true;
                        break;
                    }
                    let value = self.entry_value(&*format, &buf, p, kind, &mut offloaded)?;
                    self.batch.push_back((key.to_vec(), value));
                }
            }
            Direction::Backward => {
                let end = if hit && inclusive { pos + 1 } else { pos };
                for p in (0..end).rev() {
                    let key = format.key_at(&buf, p, kind)?;
                    if cmp(key, &self.to) != Ordering::Greater {
                        done = true;
                        break;
                    }
                    let value = self.entry_value(&*format, &buf, p, kind, &mut offloaded)?;
                    self.batch.push_back((key.to_vec(), value));
                }
            }
        }
        if offloaded && self.cx.source.generation() != self.gen {
            return Err(Interrupt::Retry);
        }
        if !self.batch.is_empty() {
            self.chased.clear();
            self.chased.insert(self.cursor.page_id());
        }
        self.edge = match (count, self.direction) {
            (0, _) => None,
            (_, Direction::Backward) => Some(format.key_at(&buf, 0, kind)?.to_vec()),
            _ => Some(format.key_at(&buf, count - 1, kind)?.to_vec()),
        };
        if self.direction == Direction::Exact {
            done = true;
        }
        self.next = if done {
            None
        } else {
            let which = match self.direction {
                Direction::Backward => HeaderPointer::Left,
                _ => HeaderPointer::Right,
            };
            self.sibling(which)?
        };
        self.state = if self.next.is_some() {
            State::Sibling
        } else {
            State::Exhausted
        };
        Ok(())
    }

    fn entry_value(
        &mut self,
        format: &dyn NodeFormat,
        buf: &[u8],
        pos: usize,
        kind: NodeKind,
        offloaded: &mut bool,
    ) -> Step<Vec<u8>> {
        if kind == NodeKind::Internal {
            let id = self.cursor.page_id();
            let pointer = child_pointer(format, buf, pos + 1, self.gen)
                .map_err(|failure| Interrupt::Suspect(format!("page {id} child: {failure}")))?;
            let child = pointer.id.map_or(0, |child| child.0);
            return Ok(child.to_be_bytes().to_vec());
        }
        match format.value_at(buf, pos)? {
            ValueRef::Inline(bytes) => Ok(bytes.to_vec()),
            ValueRef::Offload(id) => {
                *offloaded = true;
                let mut value = Vec::new();
                offload::load(&mut self.values, id, &mut value)?;
                Ok(value)
            }
        }
    }
}

fn resolved(pointer: Pointer, from: PageId, what: &str) -> Step<(PageId, u64)> {
    pointer
        .id
        .map(|id| (id, pointer.generation))
        .ok_or_else(|| Interrupt::Suspect(format!("page {from} has no {what} pointer")))
}

/// Typed range scan over a tree.
///
/// ```no_run
/// # use genbtree::storage::btree::{Tree, TreeOptions, U64Layout};
/// # fn scan(tree: &Tree<U64Layout>) -> genbtree::types::Result<()> {
/// let mut seeker = tree.seek(&10, &20)?;
/// while let Some((key, value)) = seeker.next()? {
///     println!("{key} -> {value}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Seeker<L: Layout> {
    cursor: SeekCursor,
    _layout: PhantomData<fn() -> L>,
}

impl<L: Layout> Seeker<L> {
    pub(crate) fn new(cursor: SeekCursor) -> Self {
        Self {
            cursor,
            _layout: PhantomData,
        }
    }

    /// Repositions this seeker, discarding any progress of a previous seek.
    pub fn seek(&mut self, from: &L::Key, to: &L::Key) {
        let (mut lo, mut hi) = (Vec::new(), Vec::new());
        L::encode_key(from, &mut lo);
        L::encode_key(to, &mut hi);
        self.cursor.seek(&lo, &hi);
    }

    /// Next entry in range.
    pub fn next(&mut self) -> Result<Option<(L::Key, L::Value)>> {
        if !self.cursor.next()? {
            return Ok(None);
        }
        Ok(Some((
            L::decode_key(self.cursor.key())?,
            L::decode_value(self.cursor.value())?,
        )))
    }

    /// Stops the seek. Idempotent.
    pub fn close(&mut self) {
        self.cursor.close();
    }
}

impl<L: Layout> Iterator for Seeker<L> {
    type Item = Result<(L::Key, L::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        Seeker::next(self).transpose()
    }
}
