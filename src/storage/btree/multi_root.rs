//! Many data trees in one file.
//!
//! A root-mapping tree keyed by `u64` maps each data tree's key to its
//! current root. Data trees share the file's generations, free list and
//! checkpoints.

use std::marker::PhantomData;
use std::sync::Arc;

use super::checker::CheckVisitor;
use super::cleaner::{CleanupExecutor, CleanupState};
use super::layout::{Layout, RootMappingLayout};
use super::logic::Root;
use super::monitor::Monitor;
use super::node::Layer;
use super::seek::{RootSource, SeekCursor, Seeker};
use super::stats::TreeStatsSnapshot;
use super::tree::{self, ParallelWriter, Target, TreeCore, TreeOptions, Writer};
use crate::primitives::io::FileIo;
use crate::types::{Generation, Result, TreeError};

/// Root of one data tree, looked up again whenever a seek restarts.
struct DataRoot {
    core: Arc<TreeCore>,
    key: u64,
}

impl RootSource for DataRoot {
    fn generation(&self) -> Generation {
        self.core.generation()
    }

    fn root(&self) -> Result<Root> {
        self.core.data_root(self.key)
    }
}

/// A file holding any number of data trees of layout `L`.
pub struct MultiRootTree<L: Layout> {
    core: Arc<TreeCore>,
    _layout: PhantomData<fn() -> L>,
}

impl<L: Layout> MultiRootTree<L> {
    /// Opens the file in `io`, creating it if empty.
    pub fn open(
        io: Arc<dyn FileIo>,
        options: TreeOptions,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self> {
        Ok(Self {
            core: TreeCore::open::<L>(io, options, monitor, None, true)?,
            _layout: PhantomData,
        })
    }

    /// Like [`MultiRootTree::open`] with crash cleanup run by `executor`.
    pub fn open_with_executor(
        io: Arc<dyn FileIo>,
        options: TreeOptions,
        monitor: Arc<dyn Monitor>,
        executor: Arc<dyn CleanupExecutor>,
    ) -> Result<Self> {
        Ok(Self {
            core: TreeCore::open::<L>(io, options, monitor, Some(executor), true)?,
            _layout: PhantomData,
        })
    }

    /// Creates an empty data tree under `key`. Fails at once if any writer
    /// is open.
    pub fn create(&self, key: u64) -> Result<()> {
        let _permit = self.core.gate.single()?;
        let _guard = self.core.writer_lock()?;
        if self.core.lookup_root(key)?.is_some() {
            return Err(TreeError::DataTreeAlreadyExists(key));
        }
        let root = self.core.create_data_root()?;
        self.core.set_data_root(key, root)?;
        tracing::debug!(target: "genbtree::multi_root", key, root = root.id.0, "data tree created");
        Ok(())
    }

    /// Deletes the empty data tree under `key`. Fails at once if any writer
    /// is open.
    pub fn delete(&self, key: u64) -> Result<()> {
        let _permit = self.core.gate.single()?;
        let _guard = self.core.writer_lock()?;
        let root = self.core.data_root(key)?;
        if !self.core.is_empty_tree(root)? {
            return Err(TreeError::DataTreeNotEmpty(key));
        }
        self.core.remove_data_root(key)?;
        self.core.release_root(root)?;
        tracing::debug!(target: "genbtree::multi_root", key, root = root.id.0, "data tree deleted");
        Ok(())
    }

    /// Handle to the data tree under `key`.
    pub fn access(&self, key: u64) -> Result<DataTree<L>> {
        self.core.ensure_open()?;
        self.core.data_root(key)?;
        Ok(DataTree {
            core: Arc::clone(&self.core),
            key,
            _layout: PhantomData,
        })
    }

    /// Calls `visitor` with every data tree key in ascending order.
    pub fn visit_all_roots(&self, visitor: &mut dyn FnMut(u64)) -> Result<()> {
        self.core.ensure_open()?;
        let cx = self.core.seek_context(Layer::Root, self.core.root_source());
        let mut cursor = SeekCursor::new(cx);
        let last = u64::MAX.to_be_bytes();
        cursor.seek(&0u64.to_be_bytes(), &last);
        while cursor.next()? {
            visitor(RootMappingLayout::decode_key(cursor.key())?);
        }
        // The range end is exclusive.
        cursor.seek(&last, &last);
        if cursor.next()? {
            visitor(u64::MAX);
        }
        Ok(())
    }

    /// Keys of all data trees.
    pub fn root_keys(&self) -> Result<Vec<u64>> {
        let mut keys = Vec::new();
        self.visit_all_roots(&mut |key| keys.push(key))?;
        Ok(keys)
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

    /// Closes the file. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    /// Checks the root-mapping tree and every data tree.
    pub fn consistency_check(
        &self,
        visitor: &dyn CheckVisitor,
        report_dirty: bool,
    ) -> Result<bool> {
        self.core.consistency_check(visitor, report_dirty)
    }

    /// Whether the file was not cleanly closed before this open.
    pub fn was_dirty_on_startup(&self) -> bool {
        self.core.was_dirty()
    }

    /// Structural counters since open.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Bytes the file occupies.
    pub fn size_in_bytes(&self) -> Result<u64> {
        self.core.size_in_bytes()
    }

    /// Diagnostic dump of the root-mapping tree followed by each data tree.
    pub fn print_tree(&self) -> Result<String> {
        let mapping = self.core.session().root;
        let mut out = String::from("root mapping\n");
        out += &self.core.print_tree(Layer::Root, mapping, &|bytes| {
            RootMappingLayout::decode_key(bytes)
                .map_or_else(|_| format!("{bytes:02x?}"), |key| key.to_string())
        })?;
        for key in self.root_keys()? {
            let root = self.core.data_root(key)?;
            out += &format!("data tree {key}\n");
            out += &self.core.print_tree(Layer::Data, root, &|bytes| match L::decode_key(bytes) {
                Ok(key) => format!("{key:?}"),
                Err(_) => format!("{bytes:02x?}"),
            })?;
        }
        Ok(out)
    }
}

impl<L: Layout> Drop for MultiRootTree<L> {
    fn drop(&mut self) {
        if let Err(err) = self.core.close() {
            tracing::warn!(
                target: "genbtree::multi_root",
                error = %err,
                "closing tree on drop failed"
            );
        }
    }
}

/// One data tree of a [`MultiRootTree`]. Dropping it does not close
/// anything.
pub struct DataTree<L: Layout> {
    core: Arc<TreeCore>,
    key: u64,
    _layout: PhantomData<fn() -> L>,
}

impl<L: Layout> DataTree<L> {
    /// Key of this data tree in the root mapping.
    pub fn key(&self) -> u64 {
        self.key
    }

    fn source(&self) -> Arc<dyn RootSource> {
        Arc::new(DataRoot {
            core: Arc::clone(&self.core),
            key: self.key,
        })
    }

    /// Acquires the file's single writer for this data tree.
    pub fn writer(&self) -> Result<Writer<L>> {
        self.writer_with_ratio(self.core.options.split_ratio)
    }

    /// Acquires the file's single writer with an explicit split ratio.
    pub fn writer_with_ratio(&self, split_ratio: f64) -> Result<Writer<L>> {
        Writer::acquire(Arc::clone(&self.core), Target::Data(self.key), split_ratio)
    }

    /// Acquires a parallel writer for this data tree.
    pub fn parallel_writer(&self) -> Result<ParallelWriter<L>> {
        ParallelWriter::acquire(
            Arc::clone(&self.core),
            Target::Data(self.key),
            self.core.options.split_ratio,
        )
    }

    /// Entries in `[from, to)`, or `(to, from]` descending if `from > to`.
    pub fn seek(&self, from: &L::Key, to: &L::Key) -> Result<Seeker<L>> {
        tree::seeker::<L>(&self.core, self.source(), from, to)
    }

    /// Value stored for `key`.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        tree::get::<L>(&self.core, self.source(), key)
    }

    /// An unpositioned seeker.
    pub fn allocate_seeker(&self) -> Result<Seeker<L>> {
        self.core.ensure_open()?;
        Ok(Seeker::new(SeekCursor::new(
            self.core.seek_context(Layer::Data, self.source()),
        )))
    }

    /// See [`super::Tree::partitioned_seek`].
    pub fn partitioned_seek(
        &self,
        from: &L::Key,
        to: &L::Key,
        desired: usize,
    ) -> Result<Vec<Seeker<L>>> {
        tree::partitioned::<L>(&self.core, self.source(), from, to, desired)
    }
}
