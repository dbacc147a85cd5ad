//! Opening, writing, checkpointing and closing a tree file.
//!
//! A session starts by bumping the unstable generation and writing a dirty
//! state page, so anything written before the next checkpoint is recognised
//! as crashed if the process dies. A checkpoint flushes every page, then
//! records the root and free list in the older of the two state pages with
//! the unstable generation promoted to stable.

use std::fmt::Write as _;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::checker::{CheckVisitor, ConsistencyChecker, MIN_TREE_NODE_ID};
use super::cleaner::{
    CleanupExecutor, CleanupHandle, CleanupState, CrashCleaner, InlineExecutor, ThreadedExecutor,
};
use super::freelist::{FreeList, IdProvider};
use super::layout::{node_format, Layout, RootMappingLayout};
use super::logic::{initialize_root, Root, TreeContext, TreeLogic, MAX_TREE_DEPTH};
use super::merger::{encoded, MergeResult, Overwrite, ValueMerger};
use super::meta::TreeMeta;
use super::monitor::Monitor;
use super::node::{
    child_at, expect_node_kind, generation, header_pointer, key_count, HeaderPointer, KeyCmp,
    Layer, NodeFormat, NodeKind,
};
use super::partition::partition_bounds;
use super::seek::{RootSource, SeekContext, SeekCursor, Seeker};
use super::state::{max_header_length, StatePair, TreeState, STATE_PAGE_A};
use super::stats::{TreeStats, TreeStatsSnapshot};
use crate::primitives::concurrency::{
    CleanerGuard, ParallelWriterPermit, SingleWriterPermit, TreeLock, WriterGate, WriterGuard,
};
use crate::primitives::io::FileIo;
use crate::primitives::pager::{PagedFile, PfMode};
use crate::types::{Generation, PageId, Result, TreeError};

/// First free-list page of a new file.
pub const FIRST_FREELIST_PAGE: PageId = PageId(4);

const DEFAULT_PAGE_SIZE: usize = 8192;
const MIN_PAGE_SIZE: usize = 128;
const MAX_PAGE_SIZE: usize = 1 << 16;

/// When the crash-generation cleanup runs after an unclean shutdown.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// During open, before it returns.
    #[default]
    Immediate,
    /// On a background thread started by open. Writers and checkpoints
    /// wait for it; readers do not.
    Background,
    /// On the first writer acquisition or checkpoint, or when
    /// [`Tree::clean_crashes`] is called.
    Deferred,
}

/// Options for opening a tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeOptions {
    /// Page size; must match the file's when opening an existing tree.
    pub page_size: usize,
    /// Open without writing anything. Writers and checkpoints fail.
    pub read_only: bool,
    /// When crash cleanup runs.
    pub cleanup: CleanupMode,
    /// Worker threads for crash cleanup; one runs it inline.
    pub cleanup_threads: usize,
    /// Worker threads for consistency checks.
    pub checker_threads: usize,
    /// Fraction of entries a split leaves in the left node.
    pub split_ratio: f64,
    /// Header blob written when a new file is created.
    pub initial_header: Vec<u8>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_only: false,
            cleanup: CleanupMode::Immediate,
            cleanup_threads: 1,
            checker_threads: std::thread::available_parallelism()
                .map_or(1, NonZeroUsize::get)
                .min(8),
            split_ratio: 0.5,
            initial_header: Vec::new(),
        }
    }
}

impl TreeOptions {
    /// Parses options from TOML; missing fields take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(input).map_err(|err| TreeError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Opens read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets when crash cleanup runs.
    pub fn cleanup(mut self, mode: CleanupMode) -> Self {
        self.cleanup = mode;
        self
    }

    /// Sets the number of crash cleanup workers.
    pub fn cleanup_threads(mut self, threads: usize) -> Self {
        self.cleanup_threads = threads;
        self
    }

    /// Sets the number of consistency check workers.
    pub fn checker_threads(mut self, threads: usize) -> Self {
        self.checker_threads = threads;
        self
    }

    /// Sets the default split ratio of writers.
    pub fn split_ratio(mut self, ratio: f64) -> Self {
        self.split_ratio = ratio;
        self
    }

    /// Sets the header written when the file is created.
    pub fn initial_header(mut self, header: impl Into<Vec<u8>>) -> Self {
        self.initial_header = header.into();
        self
    }

    /// Checks ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(TreeError::InvalidArgument(
                "page size must be a power of two between 128 and 65536",
            ));
        }
        check_ratio(self.split_ratio)?;
        if self.initial_header.len() > max_header_length(self.page_size) {
            return Err(TreeError::InvalidArgument("header does not fit in a state page"));
        }
        Ok(())
    }

    fn executor(&self) -> Arc<dyn CleanupExecutor> {
        if self.cleanup_threads > 1 {
            Arc::new(ThreadedExecutor::new(self.cleanup_threads))
        } else {
            Arc::new(InlineExecutor)
        }
    }
}

fn check_ratio(ratio: f64) -> Result<()> {
    if ratio > 0.0 && ratio <= 1.0 {
        Ok(())
    } else {
        Err(TreeError::InvalidArgument("split ratio must be in (0, 1]"))
    }
}

/// In-memory view of the current session.
#[derive(Clone, Debug)]
pub(crate) struct Session {
    pub root: Root,
    pub gen: Generation,
    pub header: Vec<u8>,
    pub changed: bool,
}

/// Root and generation readers of the top-level tree use.
struct SessionRoot(Arc<RwLock<Session>>);

impl RootSource for SessionRoot {
    fn generation(&self) -> Generation {
        self.0.read().gen
    }

    fn root(&self) -> Result<Root> {
        Ok(self.0.read().root)
    }
}

/// Which tree a writer changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Target {
    /// The only tree of a single-root file.
    Single,
    /// A data tree of a multi-root file.
    Data(u64),
}

/// State shared by a tree and every handle derived from it.
pub(crate) struct TreeCore {
    pub file: PagedFile,
    /// Node formats indexed by [`Layer`].
    pub formats: [Arc<dyn NodeFormat>; 2],
    /// Key comparators indexed by [`Layer`].
    pub cmps: [KeyCmp; 2],
    pub multi_root: bool,
    pub freelist: FreeList,
    pub stats: Arc<TreeStats>,
    pub monitor: Arc<dyn Monitor>,
    pub lock: TreeLock,
    pub gate: WriterGate,
    pub options: TreeOptions,
    executor: Arc<dyn CleanupExecutor>,
    session: Arc<RwLock<Session>>,
    cleanup: CleanupHandle,
    cleanup_thread: Mutex<Option<JoinHandle<()>>>,
    checkpoint_pending: AtomicBool,
    closed: AtomicBool,
    was_dirty: bool,
}

impl TreeCore {
    /// Opens or creates the file behind `io` for data layout `L`.
    pub fn open<L: Layout>(
        io: Arc<dyn FileIo>,
        options: TreeOptions,
        monitor: Arc<dyn Monitor>,
        executor: Option<Arc<dyn CleanupExecutor>>,
        multi_root: bool,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let stored = if io.is_empty()? {
            None
        } else {
            let stored = TreeMeta::load(&*io)?;
            stored.verify_identity::<L>(options.page_size)?;
            Some(stored)
        };
        let meta = TreeMeta::for_layout::<L>(options.page_size, multi_root)?;
        let formats = [
            node_format::<L>(options.page_size)?,
            node_format::<RootMappingLayout>(options.page_size)?,
        ];
        let cmps: [KeyCmp; 2] = [L::compare_encoded, RootMappingLayout::compare_encoded];
        let executor = executor.unwrap_or_else(|| options.executor());
        let Some(stored) = stored else {
            if options.read_only {
                return Err(TreeError::IllegalState("cannot create a tree read-only"));
            }
            return Self::create(io, options, monitor, executor, meta, formats, cmps);
        };
        stored.verify(&meta)?;
        let file = PagedFile::open(io, options.page_size)?;
        let pair = StatePair::load(&file)?;
        let newest = pair.newest()?.clone();
        let gen = newest.generation()?.after_open();
        let freelist = FreeList::restore(file.clone(), newest.freelist)?;
        monitor.startup_state(newest.clean);
        let needs_cleanup = !newest.clean && !options.read_only;
        if !options.read_only {
            TreeState {
                page_id: pair.oldest_page(),
                stable: gen.stable,
                unstable: gen.unstable,
                root: newest.root,
                freelist: newest.freelist,
                clean: false,
                header: newest.header.clone(),
            }
            .store(&file)?;
            file.flush_and_force()?;
        }
        if needs_cleanup {
            monitor.cleanup_registered();
        }
        tracing::info!(
            target: "genbtree::tree",
            clean = newest.clean,
            stable = gen.stable,
            unstable = gen.unstable,
            root = newest.root.id.0,
            read_only = options.read_only,
            "tree opened"
        );
        let core = Arc::new(Self {
            file,
            formats,
            cmps,
            multi_root,
            freelist,
            stats: Arc::new(TreeStats::default()),
            monitor,
            lock: TreeLock::new(),
            gate: WriterGate::new(),
            options,
            executor,
            session: Arc::new(RwLock::new(Session {
                root: newest.root,
                gen,
                header: newest.header,
                changed: false,
            })),
            cleanup: CleanupHandle::new(if needs_cleanup {
                CleanupState::NotStarted
            } else {
                CleanupState::Finished
            }),
            cleanup_thread: Mutex::new(None),
            checkpoint_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            was_dirty: !newest.clean,
        });
        if needs_cleanup {
            core.start_cleanup()?;
        }
        Ok(core)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        io: Arc<dyn FileIo>,
        options: TreeOptions,
        monitor: Arc<dyn Monitor>,
        executor: Arc<dyn CleanupExecutor>,
        meta: TreeMeta,
        formats: [Arc<dyn NodeFormat>; 2],
        cmps: [KeyCmp; 2],
    ) -> Result<Arc<Self>> {
        monitor.no_store_file();
        let file = PagedFile::open(io, options.page_size)?;
        {
            let cursor = file.acquire(PageId(0), PfMode::Write)?;
            meta.write(&mut cursor.write()?)?;
        }
        let gen = Generation::initial();
        let layer = if meta.multi_root { Layer::Root } else { Layer::Data };
        initialize_root(&file, &*formats[layer as usize], MIN_TREE_NODE_ID, layer, gen)?;
        let freelist = FreeList::create(file.clone(), FIRST_FREELIST_PAGE)?;
        let root = Root {
            id: MIN_TREE_NODE_ID,
            generation: gen.unstable,
        };
        let header = options.initial_header.clone();
        TreeState {
            page_id: STATE_PAGE_A,
            stable: gen.stable,
            unstable: gen.unstable,
            root,
            freelist: freelist.meta(),
            clean: false,
            header: header.clone(),
        }
        .store(&file)?;
        tracing::info!(
            target: "genbtree::tree",
            page_size = options.page_size,
            multi_root = meta.multi_root,
            node_format = ?meta.node_format,
            "creating tree"
        );
        let core = Arc::new(Self {
            file,
            formats,
            cmps,
            multi_root: meta.multi_root,
            freelist,
            stats: Arc::new(TreeStats::default()),
            monitor,
            lock: TreeLock::new(),
            gate: WriterGate::new(),
            options,
            executor,
            session: Arc::new(RwLock::new(Session {
                root,
                gen,
                header,
                changed: true,
            })),
            cleanup: CleanupHandle::new(CleanupState::Finished),
            cleanup_thread: Mutex::new(None),
            checkpoint_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            was_dirty: false,
        });
        core.checkpoint(None)?;
        Ok(core)
    }

    fn start_cleanup(self: &Arc<Self>) -> Result<()> {
        match self.options.cleanup {
            CleanupMode::Immediate => {
                if let Err(err) = self.run_cleanup(self.lock.cleaner()) {
                    tracing::warn!(
                        target: "genbtree::tree",
                        error = %err,
                        "cleanup at open failed"
                    );
                }
            }
            CleanupMode::Background => {
                let guard = self.lock.cleaner();
                let core = Arc::clone(self);
                let handle = std::thread::Builder::new()
                    .name("genbtree-cleanup".into())
                    .spawn(move || {
                        // The outcome is recorded in the cleanup handle.
                        let _ = core.run_cleanup(guard);
                    })?;
                *self.cleanup_thread.lock() = Some(handle);
            }
            CleanupMode::Deferred => {}
        }
        Ok(())
    }

    fn run_cleanup(&self, guard: CleanerGuard) -> Result<()> {
        let gen = self.session.read().gen;
        let pages = MIN_TREE_NODE_ID.0..self.freelist.last_id().0 + 1;
        let cleaner = CrashCleaner::new(&self.file, self.formats.clone(), gen, pages);
        self.cleanup
            .run(guard, &*self.monitor, &*self.executor, &cleaner)
    }

    /// Runs a deferred cleanup. Fails if the cleanup failed.
    pub fn ensure_cleaned(&self) -> Result<()> {
        if self.cleanup.state() == CleanupState::NotStarted {
            // A failure is recorded in the handle and reported below.
            let _ = self.run_cleanup(self.lock.cleaner());
        }
        self.cleanup.check()
    }

    pub fn cleanup_state(&self) -> CleanupState {
        self.cleanup.state()
    }

    pub fn await_cleanup(&self) -> Result<()> {
        drop(self.lock.cleaner());
        self.cleanup.check()
    }

    pub fn was_dirty(&self) -> bool {
        self.was_dirty
    }

    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    pub fn generation(&self) -> Generation {
        self.session.read().gen
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TreeError::FileClosed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(TreeError::IllegalState("tree is opened read-only"));
        }
        Ok(())
    }

    /// Takes the writer side of the tree lock once cleanup is done.
    pub fn writer_lock(&self) -> Result<WriterGuard> {
        self.ensure_writable()?;
        self.ensure_cleaned()?;
        let guard = self.lock.writer_after_cleanup();
        self.ensure_open()?;
        self.cleanup.check()?;
        Ok(guard)
    }

    /// Root and generation source for readers of the top-level tree.
    pub fn root_source(&self) -> Arc<dyn RootSource> {
        Arc::new(SessionRoot(Arc::clone(&self.session)))
    }

    pub fn seek_context(&self, layer: Layer, source: Arc<dyn RootSource>) -> SeekContext {
        SeekContext {
            file: self.file.clone(),
            format: Arc::clone(&self.formats[layer as usize]),
            cmp: self.cmps[layer as usize],
            source,
            stats: Arc::clone(&self.stats),
        }
    }

    fn context(&self, layer: Layer, gen: Generation, split_ratio: f64) -> TreeContext<'_> {
        TreeContext {
            file: &self.file,
            format: &*self.formats[layer as usize],
            cmp: self.cmps[layer as usize],
            ids: &self.freelist,
            stats: &self.stats,
            monitor: &*self.monitor,
            layer,
            gen,
            split_ratio,
        }
    }

    /// Runs one mutation of `target`. The caller holds the writer lock.
    pub fn apply<T>(
        &self,
        target: Target,
        split_ratio: f64,
        op: impl FnOnce(&mut TreeLogic<'_>, &mut Root) -> Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        let gen = self.session.read().gen;
        let mut root = match target {
            Target::Single => self.session.read().root,
            Target::Data(key) => self.data_root(key)?,
        };
        self.session.write().changed = true;
        let before = root;
        let out = op(&mut TreeLogic::new(self.context(Layer::Data, gen, split_ratio)), &mut root)?;
        if root != before {
            match target {
                Target::Single => self.session.write().root = root,
                Target::Data(key) => self.set_data_root(key, root)?,
            }
        }
        if self.checkpoint_pending.load(Ordering::Acquire) {
            self.file.flush()?;
        }
        Ok(out)
    }

    /// Root of the data tree `key`, read through the root-mapping tree.
    pub fn lookup_root(&self, key: u64) -> Result<Option<Root>> {
        let encoded = key.to_be_bytes();
        let mut cursor = SeekCursor::new(self.seek_context(Layer::Root, self.root_source()));
        cursor.seek(&encoded, &encoded);
        if !cursor.next()? {
            return Ok(None);
        }
        let (id, generation) = RootMappingLayout::decode_value(cursor.value())?;
        Ok(Some(Root {
            id: PageId(id),
            generation,
        }))
    }

    pub fn data_root(&self, key: u64) -> Result<Root> {
        self.lookup_root(key)?.ok_or(TreeError::DataTreeNotFound(key))
    }

    /// Points `key` at `root` in the root-mapping tree. The caller holds the
    /// writer lock.
    pub fn set_data_root(&self, key: u64, root: Root) -> Result<()> {
        let (gen, mut mapping) = {
            let session = self.session.read();
            (session.gen, session.root)
        };
        let mut value = Vec::new();
        RootMappingLayout::encode_value(&(root.id.0, root.generation), &mut value);
        let before = mapping;
        TreeLogic::new(self.context(Layer::Root, gen, 0.5)).insert(
            &mut mapping,
            &key.to_be_bytes(),
            &value,
            &mut replace_existing,
        )?;
        let mut session = self.session.write();
        session.changed = true;
        if mapping != before {
            session.root = mapping;
        }
        Ok(())
    }

    /// Removes `key` from the root-mapping tree, returning the root it
    /// pointed to. The caller holds the writer lock.
    pub fn remove_data_root(&self, key: u64) -> Result<Option<Root>> {
        let (gen, mut mapping) = {
            let session = self.session.read();
            (session.gen, session.root)
        };
        let before = mapping;
        let removed = TreeLogic::new(self.context(Layer::Root, gen, 0.5))
            .remove(&mut mapping, &key.to_be_bytes())?;
        let mut session = self.session.write();
        session.changed = true;
        if mapping != before {
            session.root = mapping;
        }
        drop(session);
        removed
            .map(|value| {
                RootMappingLayout::decode_value(&value).map(|(id, generation)| Root {
                    id: PageId(id),
                    generation,
                })
            })
            .transpose()
    }

    /// Writes an empty data tree root. The caller holds the writer lock.
    pub fn create_data_root(&self) -> Result<Root> {
        let gen = {
            let mut session = self.session.write();
            session.changed = true;
            session.gen
        };
        let id = self.freelist.acquire_new_id(gen)?;
        initialize_root(&self.file, &*self.formats[Layer::Data as usize], id, Layer::Data, gen)?;
        Ok(Root {
            id,
            generation: gen.unstable,
        })
    }

    /// Gives the pages of an empty data tree back. The caller holds the
    /// writer lock.
    pub fn release_root(&self, root: Root) -> Result<()> {
        let gen = self.session.read().gen;
        self.freelist.release_id(root.id, gen)
    }

    /// Whether the node at `root` is a leaf without entries.
    pub fn is_empty_tree(&self, root: Root) -> Result<bool> {
        let cursor = self.file.acquire(root.id, PfMode::Write)?;
        let page = cursor.read()?;
        Ok(expect_node_kind(&page, root.id)? == NodeKind::Leaf && key_count(&page) == 0)
    }

    /// Makes everything written so far durable.
    pub fn checkpoint(&self, header: Option<&[u8]>) -> Result<()> {
        self.ensure_writable()?;
        if header.is_some_and(|header| header.len() > max_header_length(self.file.page_size())) {
            return Err(TreeError::InvalidArgument("header does not fit in a state page"));
        }
        self.checkpoint_pending.store(true, Ordering::Release);
        let outcome = self.checkpoint_locked(header);
        self.checkpoint_pending.store(false, Ordering::Release);
        outcome
    }

    fn checkpoint_locked(&self, header: Option<&[u8]>) -> Result<()> {
        // Writers flush eagerly from here on; this flush takes the bulk.
        self.file.flush()?;
        self.ensure_cleaned()?;
        let _guard = self.lock.writer_and_cleaner();
        self.ensure_open()?;
        self.cleanup.check()?;
        if self.cleanup.state() != CleanupState::Finished {
            return Err(TreeError::CleanupFailed("crash cleanup has not completed".into()));
        }
        self.file.flush_and_force()?;
        let current = self.session();
        let next = current.gen.next_checkpoint();
        let state = TreeState {
            page_id: StatePair::load(&self.file)?.oldest_page(),
            stable: next.stable,
            unstable: next.unstable,
            root: current.root,
            freelist: self.freelist.meta(),
            clean: false,
            header: header.map_or(current.header, <[u8]>::to_vec),
        };
        state.store(&self.file)?;
        self.file.flush_and_force()?;
        {
            let mut session = self.session.write();
            session.gen = next;
            session.header = state.header;
            session.changed = false;
        }
        self.monitor.checkpoint_completed();
        tracing::info!(
            target: "genbtree::tree",
            stable = next.stable,
            unstable = next.unstable,
            state_page = state.page_id.0,
            "checkpoint completed"
        );
        Ok(())
    }

    /// Closes the file. A clean state is written only if nothing changed
    /// since the last checkpoint and no cleanup is outstanding.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.options.read_only {
            self.file.close();
            self.closed.store(true, Ordering::Release);
            return Ok(());
        }
        if !self.gate.is_idle() {
            return Err(TreeError::IllegalState("cannot close while writers are open"));
        }
        let _guard = self.lock.writer();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let current = self.session();
        let cleanup = self.cleanup.state();
        let clean = !current.changed && cleanup == CleanupState::Finished;
        if clean {
            TreeState {
                page_id: StatePair::load(&self.file)?.oldest_page(),
                stable: current.gen.stable,
                unstable: current.gen.unstable,
                root: current.root,
                freelist: self.freelist.meta(),
                clean: true,
                header: current.header,
            }
            .store(&self.file)?;
            self.file.flush_and_force()?;
        } else if cleanup == CleanupState::NotStarted {
            self.monitor.cleanup_closed();
        }
        self.file.close();
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.cleanup_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(target: "genbtree::tree", "cleanup thread panicked");
            }
        }
        self.stats.emit_tracing();
        tracing::info!(target: "genbtree::tree", clean, "tree closed");
        Ok(())
    }

    /// Checks every reachable page. Returns true if nothing was reported.
    pub fn consistency_check(
        &self,
        visitor: &dyn CheckVisitor,
        report_dirty: bool,
    ) -> Result<bool> {
        self.ensure_open()?;
        let _guard = if self.options.read_only {
            None
        } else {
            if !self.gate.is_idle() {
                return Err(TreeError::IllegalState(
                    "cannot check consistency while writers are open",
                ));
            }
            Some(self.lock.writer_after_cleanup())
        };
        let current = self.session();
        let checker = ConsistencyChecker::new(
            &self.file,
            self.formats.clone(),
            self.cmps,
            current.gen,
            self.freelist.last_id(),
            self.options.checker_threads,
        );
        let mut clean = if self.multi_root {
            checker.check_multi(current.root, &self.freelist, visitor)
        } else {
            checker.check_single(current.root, &self.freelist, visitor)
        };
        if report_dirty && self.was_dirty {
            visitor.dirty_on_startup();
            clean = false;
        }
        tracing::info!(target: "genbtree::checker", clean, "consistency check finished");
        Ok(clean)
    }

    /// Bytes the file occupies, counting pages not yet flushed.
    pub fn size_in_bytes(&self) -> Result<u64> {
        Ok(self.file.page_count()? * self.file.page_size() as u64)
    }

    /// One line per node, level by level.
    pub fn print_tree(
        &self,
        layer: Layer,
        root: Root,
        describe: &dyn Fn(&[u8]) -> String,
    ) -> Result<String> {
        let gen = self.session.read().gen;
        let format = &*self.formats[layer as usize];
        let mut out = String::new();
        let mut leftmost = Some(root.id);
        for level in 0..MAX_TREE_DEPTH {
            let Some(first) = leftmost.take() else {
                return Ok(out);
            };
            let _ = writeln!(out, "level {level}:");
            let mut next = Some(first);
            while let Some(id) = next {
                let cursor = self.file.acquire(id, PfMode::Write)?;
                let page = cursor.read()?;
                let kind = expect_node_kind(&page, id)?;
                let keys = (0..key_count(&page))
                    .map(|pos| format.key_at(&page, pos, kind).map(describe))
                    .collect::<Result<Vec<_>>>()?;
                let _ = writeln!(
                    out,
                    "  {kind:?} {id} gen={} keys=[{}]",
                    generation(&page),
                    keys.join(", ")
                );
                if id == first && kind == NodeKind::Internal {
                    leftmost = Some(child_at(format, &page, 0, gen, id)?);
                }
                next = header_pointer(&page, HeaderPointer::Right, gen, id)?;
            }
        }
        Ok(out)
    }
}

fn replace_existing(_existing: &[u8]) -> Result<MergeResult<Vec<u8>>> {
    Ok(MergeResult::Replaced)
}

/// Shared typed write operations of [`Writer`] and [`ParallelWriter`].
fn merge_into<L: Layout, M: ValueMerger<L::Value> + ?Sized>(
    core: &TreeCore,
    target: Target,
    split_ratio: f64,
    key: &L::Key,
    value: &L::Value,
    merger: &mut M,
) -> Result<()> {
    let (mut k, mut v) = (Vec::new(), Vec::new());
    L::encode_key(key, &mut k);
    L::encode_value(value, &mut v);
    let mut merge = encoded::<L, M>(merger, value);
    core.apply(target, split_ratio, |logic, root| logic.insert(root, &k, &v, &mut merge))
}

fn remove_from<L: Layout>(
    core: &TreeCore,
    target: Target,
    split_ratio: f64,
    key: &L::Key,
) -> Result<Option<L::Value>> {
    let mut k = Vec::new();
    L::encode_key(key, &mut k);
    core.apply(target, split_ratio, |logic, root| logic.remove(root, &k))?
        .map(|bytes| L::decode_value(&bytes))
        .transpose()
}

/// Single batched writer. Holds the tree's writer lock until closed or
/// dropped, so checkpoints wait for it.
pub struct Writer<L: Layout> {
    core: Arc<TreeCore>,
    target: Target,
    split_ratio: f64,
    guard: Option<WriterGuard>,
    permit: Option<SingleWriterPermit>,
    _layout: PhantomData<fn() -> L>,
}

impl<L: Layout> Writer<L> {
    pub(crate) fn acquire(core: Arc<TreeCore>, target: Target, split_ratio: f64) -> Result<Self> {
        check_ratio(split_ratio)?;
        let permit = core.gate.single()?;
        let guard = core.writer_lock()?;
        if let Target::Data(key) = target {
            core.data_root(key)?;
        }
        Ok(Self {
            core,
            target,
            split_ratio,
            guard: Some(guard),
            permit: Some(permit),
            _layout: PhantomData,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.guard.is_none() {
            return Err(TreeError::IllegalState("writer is closed"));
        }
        Ok(())
    }

    /// Inserts or overwrites `key`.
    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<()> {
        self.merge(key, value, &mut Overwrite)
    }

    /// Inserts `key`, letting `merger` decide if it already exists.
    pub fn merge<M>(&mut self, key: &L::Key, value: &L::Value, merger: &mut M) -> Result<()>
    where
        M: ValueMerger<L::Value> + ?Sized,
    {
        self.ensure_open()?;
        merge_into::<L, M>(&self.core, self.target, self.split_ratio, key, value, merger)
    }

    /// Removes `key`, returning the value it had.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        self.ensure_open()?;
        remove_from::<L>(&self.core, self.target, self.split_ratio, key)
    }

    /// Releases the writer. Closing twice is an error.
    pub fn close(&mut self) -> Result<()> {
        let guard = self
            .guard
            .take()
            .ok_or(TreeError::IllegalState("writer is already closed"))?;
        drop(guard);
        self.permit.take();
        Ok(())
    }
}

/// Writer handle that may exist alongside other parallel writers. Every
/// operation takes the tree's writer lock for its own duration.
pub struct ParallelWriter<L: Layout> {
    core: Arc<TreeCore>,
    target: Target,
    split_ratio: f64,
    permit: Option<ParallelWriterPermit>,
    _layout: PhantomData<fn() -> L>,
}

impl<L: Layout> ParallelWriter<L> {
    pub(crate) fn acquire(core: Arc<TreeCore>, target: Target, split_ratio: f64) -> Result<Self> {
        check_ratio(split_ratio)?;
        let permit = core.gate.parallel()?;
        core.ensure_cleaned()?;
        Ok(Self {
            core,
            target,
            split_ratio,
            permit: Some(permit),
            _layout: PhantomData,
        })
    }

    fn lock(&self) -> Result<WriterGuard> {
        if self.permit.is_none() {
            return Err(TreeError::IllegalState("writer is closed"));
        }
        self.core.writer_lock()
    }

    /// Inserts or overwrites `key`.
    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<()> {
        self.merge(key, value, &mut Overwrite)
    }

    /// Inserts `key`, letting `merger` decide if it already exists.
    pub fn merge<M>(&mut self, key: &L::Key, value: &L::Value, merger: &mut M) -> Result<()>
    where
        M: ValueMerger<L::Value> + ?Sized,
    {
        let _guard = self.lock()?;
        merge_into::<L, M>(&self.core, self.target, self.split_ratio, key, value, merger)
    }

    /// Removes `key`, returning the value it had.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        let _guard = self.lock()?;
        remove_from::<L>(&self.core, self.target, self.split_ratio, key)
    }

    /// Releases the handle. Closing twice is an error.
    pub fn close(&mut self) -> Result<()> {
        self.permit
            .take()
            .map(drop)
            .ok_or(TreeError::IllegalState("writer is already closed"))
    }
}

/// Typed seekers over one tree of a core.
pub(crate) fn seeker<L: Layout>(
    core: &TreeCore,
    source: Arc<dyn RootSource>,
    from: &L::Key,
    to: &L::Key,
) -> Result<Seeker<L>> {
    core.ensure_open()?;
    let mut seeker = Seeker::new(SeekCursor::new(core.seek_context(Layer::Data, source)));
    seeker.seek(from, to);
    Ok(seeker)
}

pub(crate) fn partitioned<L: Layout>(
    core: &TreeCore,
    source: Arc<dyn RootSource>,
    from: &L::Key,
    to: &L::Key,
    desired: usize,
) -> Result<Vec<Seeker<L>>> {
    core.ensure_open()?;
    let cx = core.seek_context(Layer::Data, source);
    let (mut lo, mut hi) = (Vec::new(), Vec::new());
    L::encode_key(from, &mut lo);
    L::encode_key(to, &mut hi);
    let bounds = partition_bounds(&cx, &lo, &hi, desired)?;
    Ok(bounds
        .windows(2)
        .map(|range| {
            let mut cursor = SeekCursor::new(cx.clone());
            cursor.seek(&range[0], &range[1]);
            Seeker::new(cursor)
        })
        .collect())
}

pub(crate) fn get<L: Layout>(
    core: &TreeCore,
    source: Arc<dyn RootSource>,
    key: &L::Key,
) -> Result<Option<L::Value>> {
    let mut seeker = seeker::<L>(core, source, key, key)?;
    Ok(seeker.next()?.map(|(_, value)| value))
}

/// A single-root tree file.
pub struct Tree<L: Layout> {
    core: Arc<TreeCore>,
    _layout: PhantomData<fn() -> L>,
}

impl<L: Layout> Tree<L> {
    /// Opens the tree in `io`, creating it if the file is empty.
    pub fn open(
        io: Arc<dyn FileIo>,
        options: TreeOptions,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self> {
        Self::open_inner(io, options, monitor, None)
    }

    /// Like [`Tree::open`] with crash cleanup run by `executor`.
    pub fn open_with_executor(
        io: Arc<dyn FileIo>,
        options: TreeOptions,
        monitor: Arc<dyn Monitor>,
        executor: Arc<dyn CleanupExecutor>,
    ) -> Result<Self> {
        Self::open_inner(io, options, monitor, Some(executor))
    }

    fn open_inner(
        io: Arc<dyn FileIo>,
        options: TreeOptions,
        monitor: Arc<dyn Monitor>,
        executor: Option<Arc<dyn CleanupExecutor>>,
    ) -> Result<Self> {
        Ok(Self {
            core: TreeCore::open::<L>(io, options, monitor, executor, false)?,
            _layout: PhantomData,
        })
    }

    /// Acquires the single writer with the configured split ratio.
    pub fn writer(&self) -> Result<Writer<L>> {
        self.writer_with_ratio(self.core.options.split_ratio)
    }

    /// Acquires the single writer. Fails at once if any writer is open.
    pub fn writer_with_ratio(&self, split_ratio: f64) -> Result<Writer<L>> {
        Writer::acquire(Arc::clone(&self.core), Target::Single, split_ratio)
    }

    /// Acquires another parallel writer. Fails at once if the single
    /// writer is open.
    pub fn parallel_writer(&self) -> Result<ParallelWriter<L>> {
        ParallelWriter::acquire(
            Arc::clone(&self.core),
            Target::Single,
            self.core.options.split_ratio,
        )
    }

    /// Entries in `[from, to)`, or `(to, from]` in descending order if
    /// `from > to`.
    pub fn seek(&self, from: &L::Key, to: &L::Key) -> Result<Seeker<L>> {
        seeker::<L>(&self.core, self.core.root_source(), from, to)
    }

    /// Value stored for `key`.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        get::<L>(&self.core, self.core.root_source(), key)
    }

    /// An unpositioned seeker to reuse across [`Seeker::seek`] calls.
    pub fn allocate_seeker(&self) -> Result<Seeker<L>> {
        self.core.ensure_open()?;
        let cx = self.core.seek_context(Layer::Data, self.core.root_source());
        Ok(Seeker::new(SeekCursor::new(cx)))
    }

    /// Splits `[from, to)` into at most `desired` seekers whose results,
    /// concatenated, equal a single seek over the range.
    pub fn partitioned_seek(
        &self,
        from: &L::Key,
        to: &L::Key,
        desired: usize,
    ) -> Result<Vec<Seeker<L>>> {
        partitioned::<L>(&self.core, self.core.root_source(), from, to, desired)
    }

    /// Byte-level seek over the keys of internal level `level`.
    #[cfg(test)]
    pub(crate) fn seek_level(&self, from: &[u8], to: &[u8], level: usize) -> SeekCursor {
        let cx = self.core.seek_context(Layer::Data, self.core.root_source());
        let mut cursor = SeekCursor::new(cx);
        cursor.seek_level(from, to, level);
        cursor
    }

    /// Makes all changes durable, keeping the header.
    pub fn checkpoint(&self) -> Result<()> {
        self.core.checkpoint(None)
    }

    /// Makes all changes durable and replaces the header.
    pub fn checkpoint_with_header(&self, header: &[u8]) -> Result<()> {
        self.core.checkpoint(Some(header))
    }

    /// Header as of the last checkpoint.
    pub fn header(&self) -> Vec<u8> {
        self.core.session().header
    }

    /// Runs a deferred crash cleanup now.
    pub fn clean_crashes(&self) -> Result<()> {
        self.core.ensure_cleaned()
    }

    /// Progress of the crash cleanup registered at open.
    pub fn cleanup_state(&self) -> CleanupState {
        self.core.cleanup_state()
    }

    /// Waits for a background cleanup and reports its failure.
    pub fn await_cleanup(&self) -> Result<()> {
        self.core.await_cleanup()
    }

    /// Closes the tree. Idempotent; may be retried after an I/O error.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    /// Reports every violation to `visitor`; true if there were none.
    pub fn consistency_check(
        &self,
        visitor: &dyn CheckVisitor,
        report_dirty: bool,
    ) -> Result<bool> {
        self.core.consistency_check(visitor, report_dirty)
    }

    /// Largest key plus value a writer accepts.
    pub fn key_value_size_cap(&self) -> usize {
        self.core.formats[Layer::Data as usize].key_value_size_cap()
    }

    /// Bytes the file occupies.
    pub fn size_in_bytes(&self) -> Result<u64> {
        self.core.size_in_bytes()
    }

    /// Diagnostic dump of every node.
    pub fn print_tree(&self) -> Result<String> {
        let root = self.core.session().root;
        self.core.print_tree(Layer::Data, root, &|bytes| match L::decode_key(bytes) {
            Ok(key) => format!("{key:?}"),
            Err(_) => format!("{bytes:02x?}"),
        })
    }

    /// Whether the file was not cleanly closed before this open.
    pub fn was_dirty_on_startup(&self) -> bool {
        self.core.was_dirty()
    }

    /// Structural counters since open.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.core.stats.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<TreeCore> {
        &self.core
    }
}

impl<L: Layout> Drop for Tree<L> {
    fn drop(&mut self) {
        if let Err(err) = self.core.close() {
            tracing::warn!(target: "genbtree::tree", error = %err, "closing tree on drop failed");
        }
    }
}

/// Header of the tree in `io` without opening it.
pub fn read_header(io: Arc<dyn FileIo>, page_size: usize) -> Result<Vec<u8>> {
    let file = header_file(io, page_size)?;
    let header = StatePair::load(&file)?.newest()?.header.clone();
    file.close();
    Ok(header)
}

/// Replaces the header of the tree in `io`, which must not be open.
pub fn overwrite_header(io: Arc<dyn FileIo>, page_size: usize, header: &[u8]) -> Result<()> {
    if header.len() > max_header_length(page_size) {
        return Err(TreeError::InvalidArgument("header does not fit in a state page"));
    }
    let file = header_file(io, page_size)?;
    let pair = StatePair::load(&file)?;
    let newest = pair.newest()?;
    TreeState {
        page_id: pair.oldest_page(),
        unstable: newest.unstable + 1,
        header: header.to_vec(),
        ..newest.clone()
    }
    .store(&file)?;
    file.flush_and_force()?;
    file.close();
    Ok(())
}

fn header_file(io: Arc<dyn FileIo>, page_size: usize) -> Result<PagedFile> {
    let meta = TreeMeta::load(&*io)?;
    if meta.page_size as usize != page_size {
        return Err(TreeError::MetadataMismatch(format!(
            "page size is {} on disk but {page_size} was requested",
            meta.page_size
        )));
    }
    PagedFile::open(io, page_size)
}
