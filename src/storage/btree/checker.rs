//! Physical consistency check.
//!
//! Walks the pages reachable from the root(s) without trusting anything but
//! the bytes on disk. Violations are reported to a [`CheckVisitor`] and the
//! walk continues, so one run lists everything that is wrong.
//!
//! The children of a root are checked in parallel. Every subtree reports the
//! outermost node of each of its levels so sibling links can be verified
//! across subtree borders once all workers are done.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::freelist::{FreeList, IdProvider};
use super::gspp::{self, SlotState};
use super::layout::{Layout, RootMappingLayout};
use super::logic::{Root, MAX_TREE_DEPTH};
use super::node::{
    generation, is_tree_node, key_count, layer, node_kind, raw_node_kind, HeaderPointer, KeyCmp,
    Layer, NodeFormat, NodeKind, ValueRef, SUCCESSOR_OFFSET,
};
use crate::primitives::pager::{PagedFile, PfMode};
use crate::types::{Generation, PageId, Result, TreeError};

/// First id that can hold a tree node, free-list page or offload page.
pub const MIN_TREE_NODE_ID: PageId = PageId(3);

/// Receives consistency violations. Every method defaults to doing nothing.
///
/// Methods may be called from several threads at once.
#[allow(unused_variables)]
pub trait CheckVisitor: Send + Sync {
    /// A pointer leads to a page that is not a tree node.
    fn not_a_tree_node(&self, page: PageId) {}
    /// A tree node has an unknown kind byte.
    fn unknown_tree_node_type(&self, page: PageId, kind: u8) {}
    /// `left` and `right` are neighbours but their sibling pointers disagree.
    fn siblings_dont_point_to_each_other(&self, left: PageId, right: PageId, level: usize) {}
    /// The rightmost node of a level points to a right sibling.
    fn rightmost_node_has_right_sibling(&self, page: PageId, right: PageId) {}
    /// A pointer leads to a node that has a successor.
    fn pointer_to_old_version_of_tree_node(&self, page: PageId, successor: PageId) {}
    /// A pointer is older than the node it leads to.
    fn pointer_has_lower_generation_than_node(
        &self,
        page: PageId,
        child: PageId,
        pointer_generation: u64,
        node_generation: u64,
    ) {
    }
    /// Keys at `pos - 1` and `pos` are not strictly increasing.
    fn keys_out_of_order_in_node(&self, page: PageId, pos: usize) {}
    /// The key at `pos` falls outside the range implied by its ancestors.
    fn keys_located_in_wrong_node(&self, page: PageId, pos: usize) {}
    /// Format specific bookkeeping of a node is off.
    fn node_meta_inconsistency(&self, page: PageId, message: &str) {}
    /// A page is neither reachable nor free.
    fn unused_page(&self, page: PageId) {}
    /// A page is reachable from two places.
    fn page_id_seen_multiple_times(&self, page: PageId) {}
    /// A pointer leads past the highest allocated id.
    fn page_id_exceed_last_id(&self, last_id: PageId, page: PageId) {}
    /// A pointer pair has a slot left by a crashed session.
    fn crashed_pointer(&self, page: PageId, what: &str, pair: &str) {}
    /// A pointer pair has a slot with a bad checksum.
    fn broken_pointer(&self, page: PageId, what: &str, pair: &str) {}
    /// A node claims more keys than fit in a page.
    fn unreasonable_key_count(&self, page: PageId, count: usize) {}
    /// A child pointer leads back to one of its own ancestors.
    fn child_node_found_among_parent_nodes(&self, page: PageId, level: usize, child: PageId) {}
    /// The tree was not cleanly closed before it was opened.
    fn dirty_on_startup(&self) {}
    /// Checking part of the tree failed outright.
    fn exception(&self, error: &TreeError) {}
}

/// One reported violation, named after the [`CheckVisitor`] method.
#[allow(missing_docs)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Violation {
    NotATreeNode(PageId),
    UnknownTreeNodeType(PageId, u8),
    SiblingsDontPointToEachOther { left: PageId, right: PageId, level: usize },
    RightmostNodeHasRightSibling(PageId, PageId),
    PointerToOldVersionOfTreeNode(PageId, PageId),
    PointerHasLowerGenerationThanNode { page: PageId, child: PageId },
    KeysOutOfOrderInNode(PageId, usize),
    KeysLocatedInWrongNode(PageId, usize),
    NodeMetaInconsistency(PageId, String),
    UnusedPage(PageId),
    PageIdSeenMultipleTimes(PageId),
    PageIdExceedLastId(PageId),
    CrashedPointer(PageId, String),
    BrokenPointer(PageId, String),
    UnreasonableKeyCount(PageId, usize),
    ChildNodeFoundAmongParentNodes(PageId, PageId),
    DirtyOnStartup,
    Exception(String),
}

/// Visitor that records every violation.
#[derive(Debug, Default)]
pub struct ViolationCollector {
    found: Mutex<Vec<Violation>>,
}

impl ViolationCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Violations reported so far.
    pub fn violations(&self) -> Vec<Violation> {
        self.found.lock().clone()
    }

    fn push(&self, violation: Violation) {
        self.found.lock().push(violation);
    }
}

impl CheckVisitor for ViolationCollector {
    fn not_a_tree_node(&self, page: PageId) {
        self.push(Violation::NotATreeNode(page));
    }
    fn unknown_tree_node_type(&self, page: PageId, kind: u8) {
        self.push(Violation::UnknownTreeNodeType(page, kind));
    }
    fn siblings_dont_point_to_each_other(&self, left: PageId, right: PageId, level: usize) {
        self.push(Violation::SiblingsDontPointToEachOther { left, right, level });
    }
    fn rightmost_node_has_right_sibling(&self, page: PageId, right: PageId) {
        self.push(Violation::RightmostNodeHasRightSibling(page, right));
    }
    fn pointer_to_old_version_of_tree_node(&self, page: PageId, successor: PageId) {
        self.push(Violation::PointerToOldVersionOfTreeNode(page, successor));
    }
    fn pointer_has_lower_generation_than_node(&self, page: PageId, child: PageId, _: u64, _: u64) {
        self.push(Violation::PointerHasLowerGenerationThanNode { page, child });
    }
    fn keys_out_of_order_in_node(&self, page: PageId, pos: usize) {
        self.push(Violation::KeysOutOfOrderInNode(page, pos));
    }
    fn keys_located_in_wrong_node(&self, page: PageId, pos: usize) {
        self.push(Violation::KeysLocatedInWrongNode(page, pos));
    }
    fn node_meta_inconsistency(&self, page: PageId, message: &str) {
        self.push(Violation::NodeMetaInconsistency(page, message.to_string()));
    }
    fn unused_page(&self, page: PageId) {
        self.push(Violation::UnusedPage(page));
    }
    fn page_id_seen_multiple_times(&self, page: PageId) {
        self.push(Violation::PageIdSeenMultipleTimes(page));
    }
    fn page_id_exceed_last_id(&self, _last_id: PageId, page: PageId) {
        self.push(Violation::PageIdExceedLastId(page));
    }
    fn crashed_pointer(&self, page: PageId, what: &str, _pair: &str) {
        self.push(Violation::CrashedPointer(page, what.to_string()));
    }
    fn broken_pointer(&self, page: PageId, what: &str, _pair: &str) {
        self.push(Violation::BrokenPointer(page, what.to_string()));
    }
    fn unreasonable_key_count(&self, page: PageId, count: usize) {
        self.push(Violation::UnreasonableKeyCount(page, count));
    }
    fn child_node_found_among_parent_nodes(&self, page: PageId, _level: usize, child: PageId) {
        self.push(Violation::ChildNodeFoundAmongParentNodes(page, child));
    }
    fn dirty_on_startup(&self) {
        self.push(Violation::DirtyOnStartup);
    }
    fn exception(&self, error: &TreeError) {
        self.push(Violation::Exception(error.to_string()));
    }
}

/// Forwards to the caller's visitor and counts what passes through.
struct Reporter<'v> {
    visitor: &'v dyn CheckVisitor,
    count: AtomicU64,
}

impl Reporter<'_> {
    fn report(&self, f: impl FnOnce(&dyn CheckVisitor)) {
        self.count.fetch_add(1, AtomicOrdering::Relaxed);
        f(self.visitor);
    }
}

/// Outermost nodes of one level of a subtree, with their outward pointers.
#[derive(Clone, Copy, Debug)]
struct LevelEdge {
    first: PageId,
    first_left: Option<PageId>,
    last: PageId,
    last_right: Option<PageId>,
}

/// Edges per level, top level first.
type Edges = Vec<LevelEdge>;

/// Key range inherited from the ancestors: `low <= key < high`.
#[derive(Clone, Debug, Default)]
struct KeyRange {
    low: Option<Vec<u8>>,
    high: Option<Vec<u8>>,
}

impl KeyRange {
    fn contains(&self, cmp: KeyCmp, key: &[u8]) -> bool {
        self.low.as_deref().map_or(true, |low| cmp(key, low) != Ordering::Less)
            && self.high.as_deref().map_or(true, |high| cmp(key, high) == Ordering::Less)
    }

    fn narrow(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Self {
        Self {
            low: low.map(<[u8]>::to_vec).or_else(|| self.low.clone()),
            high: high.map(<[u8]>::to_vec).or_else(|| self.high.clone()),
        }
    }
}

/// Checks one tree file.
pub(crate) struct ConsistencyChecker<'a> {
    file: &'a PagedFile,
    formats: [Arc<dyn NodeFormat>; 2],
    cmps: [KeyCmp; 2],
    gen: Generation,
    last_id: PageId,
    threads: usize,
    seen: Mutex<Vec<bool>>,
}

impl<'a> ConsistencyChecker<'a> {
    /// `formats` and `cmps` are indexed by layer: data first, root second.
    pub fn new(
        file: &'a PagedFile,
        formats: [Arc<dyn NodeFormat>; 2],
        cmps: [KeyCmp; 2],
        gen: Generation,
        last_id: PageId,
        threads: usize,
    ) -> Self {
        let mut seen = vec![false; last_id.0 as usize + 1];
        for reserved in seen.iter_mut().take(MIN_TREE_NODE_ID.0 as usize) {
            *reserved = true;
        }
        Self {
            file,
            formats,
            cmps,
            gen,
            last_id,
            threads: threads.max(1),
            seen: Mutex::new(seen),
        }
    }

    /// Checks a single-root tree and the free list. Returns true if nothing
    /// was reported.
    pub fn check_single(
        &self,
        root: Root,
        freelist: &FreeList,
        visitor: &dyn CheckVisitor,
    ) -> bool {
        let reporter = Reporter {
            visitor,
            count: AtomicU64::new(0),
        };
        self.check_tree(root, Layer::Data, &reporter);
        self.check_free(freelist, &reporter);
        self.check_unused(&reporter);
        reporter.count.load(AtomicOrdering::Relaxed) == 0
    }

    /// Checks the root-mapping tree, every data tree it lists and the free
    /// list. Returns true if nothing was reported.
    pub fn check_multi(
        &self,
        root: Root,
        freelist: &FreeList,
        visitor: &dyn CheckVisitor,
    ) -> bool {
        let reporter = Reporter {
            visitor,
            count: AtomicU64::new(0),
        };
        for data_root in self.check_tree(root, Layer::Root, &reporter) {
            self.check_tree(data_root, Layer::Data, &reporter);
        }
        self.check_free(freelist, &reporter);
        self.check_unused(&reporter);
        reporter.count.load(AtomicOrdering::Relaxed) == 0
    }

    /// Checks one tree. For the root layer, returns the data tree roots
    /// found in its leaves.
    fn check_tree(&self, root: Root, layer: Layer, reporter: &Reporter<'_>) -> Vec<Root> {
        tracing::debug!(target: "genbtree::checker", root = %root.id, ?layer, "checking tree");
        let mut data_roots = Vec::new();
        let Some(buf) = self.visit(root.id, root.generation, None, layer, reporter) else {
            return data_roots;
        };
        let walk = Walk {
            checker: self,
            layer,
            reporter,
            data_roots: Mutex::new(Vec::new()),
        };
        let edges = if node_kind(&buf) == Some(NodeKind::Internal) {
            walk.check_root_children(root.id, &buf)
        } else {
            walk.check_node(root.id, buf, &KeyRange::default(), &mut vec![root.id], 0)
        };
        if let Some(edges) = edges {
            walk.check_outer_edges(&edges);
        }
        data_roots.append(&mut walk.data_roots.lock());
        data_roots
    }

    /// Reads a page reached through a pointer, marking it seen. Returns
    /// `None` if it is not a node that can be checked further.
    fn visit(
        &self,
        id: PageId,
        pointer_gen: u64,
        parent: Option<PageId>,
        expected: Layer,
        reporter: &Reporter<'_>,
    ) -> Option<Vec<u8>> {
        if !self.mark_seen(id, reporter) {
            return None;
        }
        let buf = match self.read(id) {
            Ok(buf) => buf,
            Err(err) => {
                reporter.report(|v| v.exception(&err));
                return None;
            }
        };
        if !is_tree_node(&buf) {
            reporter.report(|v| v.not_a_tree_node(id));
            return None;
        }
        if node_kind(&buf).is_none() {
            reporter.report(|v| v.unknown_tree_node_type(id, raw_node_kind(&buf)));
            return None;
        }
        if layer(&buf) != expected as u8 {
            reporter.report(|v| {
                v.node_meta_inconsistency(
                    id,
                    &format!("layer byte {} in a {expected:?} tree", layer(&buf)),
                )
            });
        }
        let node_gen = generation(&buf);
        if node_gen > pointer_gen {
            let parent = parent.unwrap_or(id);
            reporter.report(|v| {
                v.pointer_has_lower_generation_than_node(parent, id, pointer_gen, node_gen)
            });
        }
        if let Some(successor) = self.pointer(&buf, id, SUCCESSOR_OFFSET, "successor", reporter) {
            if let Some(successor) = successor.id {
                reporter.report(|v| v.pointer_to_old_version_of_tree_node(id, successor));
            }
        }
        Some(buf)
    }

    fn read(&self, id: PageId) -> Result<Vec<u8>> {
        let cursor = self.file.acquire(id, PfMode::Write)?;
        let page = cursor.read()?;
        Ok(page.to_vec())
    }

    /// Marks `id` as reachable. Returns false if it was out of range or
    /// already seen.
    fn mark_seen(&self, id: PageId, reporter: &Reporter<'_>) -> bool {
        if id > self.last_id {
            reporter.report(|v| v.page_id_exceed_last_id(self.last_id, id));
            return false;
        }
        let mut seen = self.seen.lock();
        let slot = &mut seen[id.0 as usize];
        if *slot {
            drop(seen);
            reporter.report(|v| v.page_id_seen_multiple_times(id));
            return false;
        }
        *slot = true;
        true
    }

    /// Reports crashed and broken slots, then resolves the pair.
    fn pointer(
        &self,
        buf: &[u8],
        id: PageId,
        offset: usize,
        what: &str,
        reporter: &Reporter<'_>,
    ) -> Option<gspp::Pointer> {
        let (a, b) = gspp::slots(buf, offset);
        let states = [a.state(self.gen), b.state(self.gen)];
        let describe = || {
            format!(
                "A={}(gen={}) B={}(gen={})",
                states[0], a.generation, states[1], b.generation
            )
        };
        if states.contains(&SlotState::Crash) {
            reporter.report(|v| v.crashed_pointer(id, what, &describe()));
        }
        if states.contains(&SlotState::Broken) {
            reporter.report(|v| v.broken_pointer(id, what, &describe()));
        }
        gspp::read(buf, offset, self.gen).ok()
    }

    fn check_free(&self, freelist: &FreeList, reporter: &Reporter<'_>) {
        let mut mark = |id: PageId| {
            self.mark_seen(id, reporter);
        };
        if let Err(err) = freelist.visit_pages(&mut mark) {
            reporter.report(|v| v.exception(&err));
        }
        if let Err(err) = freelist.visit_free_ids(&mut mark) {
            reporter.report(|v| v.exception(&err));
        }
    }

    fn check_unused(&self, reporter: &Reporter<'_>) {
        let unused: Vec<PageId> = self
            .seen
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(id, _)| PageId(id as u64))
            .collect();
        for id in unused {
            reporter.report(|v| v.unused_page(id));
        }
    }
}

/// State of checking one tree.
struct Walk<'c, 'a, 'v> {
    checker: &'c ConsistencyChecker<'a>,
    layer: Layer,
    reporter: &'c Reporter<'v>,
    data_roots: Mutex<Vec<Root>>,
}

impl Walk<'_, '_, '_> {
    fn format(&self) -> &dyn NodeFormat {
        &*self.checker.formats[self.layer as usize]
    }

    fn cmp(&self) -> KeyCmp {
        self.checker.cmps[self.layer as usize]
    }

    /// Checks the root's subtrees on worker threads and stitches the
    /// results.
    fn check_root_children(&self, root: PageId, buf: &[u8]) -> Option<Edges> {
        let children = self.check_body(root, buf, &KeyRange::default())?;
        let queue = Mutex::new(children.iter().enumerate().collect::<VecDeque<_>>());
        let results: Vec<Mutex<Option<Edges>>> =
            children.iter().map(|_| Mutex::new(None)).collect();
        let workers = self.checker.threads.min(children.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let Some((index, child)) = queue.lock().pop_front() else {
                        return;
                    };
                    let edges = self.check_child(root, child, &mut vec![root], 1);
                    *results[index].lock() = edges;
                });
            }
        });
        let below: Vec<Option<Edges>> = results.into_iter().map(Mutex::into_inner).collect();
        let mut edges = vec![LevelEdge {
            first: root,
            first_left: self.sibling(root, buf, HeaderPointer::Left),
            last: root,
            last_right: self.sibling(root, buf, HeaderPointer::Right),
        }];
        edges.extend(self.stitch(below, 1)?);
        Some(edges)
    }

    /// Checks a node and everything below it on the current thread.
    fn check_node(
        &self,
        id: PageId,
        buf: Vec<u8>,
        range: &KeyRange,
        path: &mut Vec<PageId>,
        level: usize,
    ) -> Option<Edges> {
        let mut edges = vec![LevelEdge {
            first: id,
            first_left: self.sibling(id, &buf, HeaderPointer::Left),
            last: id,
            last_right: self.sibling(id, &buf, HeaderPointer::Right),
        }];
        let children = self.check_body(id, &buf, range)?;
        if children.is_empty() {
            return Some(edges);
        }
        if level + 1 >= MAX_TREE_DEPTH {
            self.reporter.report(|v| {
                v.node_meta_inconsistency(id, "tree deeper than the supported maximum")
            });
            return Some(edges);
        }
        let below = children
            .iter()
            .map(|child| self.check_child(id, child, path, level + 1))
            .collect();
        edges.extend(self.stitch(below, level + 1)?);
        Some(edges)
    }

    fn check_child(
        &self,
        parent: PageId,
        child: &Child,
        path: &mut Vec<PageId>,
        level: usize,
    ) -> Option<Edges> {
        if path.contains(&child.id) {
            self.reporter
                .report(|v| v.child_node_found_among_parent_nodes(parent, level, child.id));
            return None;
        }
        let buf = self
            .checker
            .visit(child.id, child.generation, Some(parent), self.layer, self.reporter)?;
        path.push(child.id);
        let edges = self.check_node(child.id, buf, &child.range, path, level);
        path.pop();
        edges
    }

    /// Checks keys and pointers of one node. Returns its children, empty
    /// for a leaf, or `None` if the node cannot be checked further.
    fn check_body(
        &self,
        id: PageId,
        buf: &[u8],
        range: &KeyRange,
    ) -> Option<Vec<Child>> {
        let kind = node_kind(buf)?;
        let format = self.format();
        let count = key_count(buf);
        if count > format.max_key_count(kind) {
            self.reporter.report(|v| v.unreasonable_key_count(id, count));
            return None;
        }
        if let Err(message) = format.check_meta(buf, kind) {
            self.reporter.report(|v| v.node_meta_inconsistency(id, &message));
            return None;
        }
        let keys = match (0..count)
            .map(|pos| format.key_at(buf, pos, kind).map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>>>()
        {
            Ok(keys) => keys,
            Err(err) => {
                self.reporter.report(|v| v.exception(&err));
                return None;
            }
        };
        let cmp = self.cmp();
        for (pos, key) in keys.iter().enumerate() {
            if pos > 0 && cmp(&keys[pos - 1], key) != Ordering::Less {
                self.reporter.report(|v| v.keys_out_of_order_in_node(id, pos));
            }
            if !range.contains(cmp, key) {
                self.reporter.report(|v| v.keys_located_in_wrong_node(id, pos));
            }
        }
        match kind {
            NodeKind::Leaf => {
                self.check_leaf_values(buf, count);
                Some(Vec::new())
            }
            NodeKind::Internal => {
                let mut children = Vec::with_capacity(count + 1);
                for pos in 0..=count {
                    let what = format!("child {pos}");
                    let pointer = self
                        .checker
                        .pointer(buf, id, format.child_offset(pos), &what, self.reporter);
                    let Some(pointer) = pointer else {
                        return None;
                    };
                    let Some(child) = pointer.id else {
                        self.reporter
                            .report(|v| v.node_meta_inconsistency(id, &format!("missing {what}")));
                        return None;
                    };
                    let low = pos.checked_sub(1).map(|at| keys[at].as_slice());
                    let high = keys.get(pos).map(Vec::as_slice);
                    children.push(Child {
                        id: child,
                        generation: pointer.generation,
                        range: range.narrow(low, high),
                    });
                }
                Some(children)
            }
        }
    }

    fn check_leaf_values(&self, buf: &[u8], count: usize) {
        let format = self.format();
        for pos in 0..count {
            match format.value_at(buf, pos) {
                Ok(ValueRef::Offload(page)) => {
                    self.checker.mark_seen(page, self.reporter);
                }
                Ok(ValueRef::Inline(bytes)) if self.layer == Layer::Root => {
                    match RootMappingLayout::decode_value(bytes) {
                        Ok((root, generation)) => self.data_roots.lock().push(Root {
                            id: PageId(root),
                            generation,
                        }),
                        Err(err) => self.reporter.report(|v| v.exception(&err)),
                    }
                }
                Ok(ValueRef::Inline(_)) => {}
                Err(err) => {
                    self.reporter.report(|v| v.exception(&err));
                    return;
                }
            }
        }
    }

    fn sibling(&self, id: PageId, buf: &[u8], which: HeaderPointer) -> Option<PageId> {
        let what = match which {
            HeaderPointer::Left => "left sibling",
            HeaderPointer::Right => "right sibling",
            HeaderPointer::Successor => "successor",
        };
        self.checker
            .pointer(buf, id, which.offset(), what, self.reporter)
            .and_then(|pointer| pointer.id)
    }

    /// Joins the edges of adjacent subtrees, checking the sibling links
    /// between them. `level` is the level of the subtrees' roots.
    fn stitch(&self, subtrees: Vec<Option<Edges>>, level: usize) -> Option<Edges> {
        let mut subtrees = subtrees.into_iter();
        let mut joined = subtrees.next()??;
        for next in subtrees {
            let next = next?;
            if next.len() != joined.len() {
                self.reporter.report(|v| {
                    v.node_meta_inconsistency(
                        next[0].first,
                        &format!(
                            "subtree has {} levels but its left neighbour has {}",
                            next.len(),
                            joined.len()
                        ),
                    )
                });
                return None;
            }
            for (depth, (left, right)) in joined.iter_mut().zip(next).enumerate() {
                if left.last_right != Some(right.first) || right.first_left != Some(left.last) {
                    self.reporter.report(|v| {
                        v.siblings_dont_point_to_each_other(left.last, right.first, level + depth)
                    });
                }
                left.last = right.last;
                left.last_right = right.last_right;
            }
        }
        Some(joined)
    }

    /// The outermost nodes of every level must not have outward siblings.
    fn check_outer_edges(&self, edges: &Edges) {
        for (level, edge) in edges.iter().enumerate() {
            if let Some(left) = edge.first_left {
                self.reporter
                    .report(|v| v.siblings_dont_point_to_each_other(left, edge.first, level));
            }
            if let Some(right) = edge.last_right {
                self.reporter
                    .report(|v| v.rightmost_node_has_right_sibling(edge.last, right));
            }
        }
    }
}

/// A child pointer still to be checked.
struct Child {
    id: PageId,
    generation: u64,
    range: KeyRange,
}
