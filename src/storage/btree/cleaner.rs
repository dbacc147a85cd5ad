//! Crash-generation cleanup.
//!
//! After an unclean shutdown some pointer slots carry a generation between
//! the last stable one and the new unstable one. Those slots must be zeroed
//! before the next checkpoint, otherwise they would become stable. The
//! cleaner visits every page up to the highest allocated id in chunks that
//! an executor may run in parallel.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::gspp;
use super::monitor::{CleanupStats, Monitor};
use super::node::{
    is_tree_node, key_count, layer, raw_node_kind, HeaderPointer, NodeFormat, NodeKind,
};
use crate::primitives::concurrency::CleanerGuard;
use crate::primitives::pager::{PagedFile, PfMode};
use crate::types::{Generation, PageId, Result, TreeError};

/// Pages handed to one cleanup job.
pub const DEFAULT_CHUNK_PAGES: u64 = 256;

/// One unit of cleanup work.
pub type CleanupJob<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

/// Runs cleanup jobs. Must not return before every job has finished.
pub trait CleanupExecutor: Send + Sync {
    /// Runs all jobs and returns the first failure, if any.
    fn execute(&self, jobs: Vec<CleanupJob<'_>>) -> Result<()>;
}

/// Runs jobs one after the other on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl CleanupExecutor for InlineExecutor {
    fn execute(&self, jobs: Vec<CleanupJob<'_>>) -> Result<()> {
        let mut first_error = None;
        for job in jobs {
            if let Err(err) = job() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Runs jobs on a fixed number of scoped threads.
#[derive(Debug, Clone, Copy)]
pub struct ThreadedExecutor {
    threads: usize,
}

impl ThreadedExecutor {
    /// Executor using `threads` workers, at least one.
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }
}

impl CleanupExecutor for ThreadedExecutor {
    fn execute(&self, jobs: Vec<CleanupJob<'_>>) -> Result<()> {
        let workers = self.threads.min(jobs.len());
        let queue = Mutex::new(jobs);
        let failure: Mutex<Option<TreeError>> = Mutex::new(None);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let Some(job) = queue.lock().pop() else {
                        return;
                    };
                    if let Err(err) = job() {
                        failure.lock().get_or_insert(err);
                    }
                });
            }
        });
        failure.into_inner().map_or(Ok(()), Err)
    }
}

/// Zeroes crashed pointer slots across a range of pages.
pub struct CrashCleaner<'a> {
    file: &'a PagedFile,
    formats: [Arc<dyn NodeFormat>; 2],
    gen: Generation,
    pages: Range<u64>,
    chunk_pages: u64,
}

#[derive(Default)]
struct Counters {
    pages_visited: AtomicU64,
    tree_nodes: AtomicU64,
    cleaned: AtomicU64,
}

impl<'a> CrashCleaner<'a> {
    /// `formats` holds the node format of the data layer and of the root
    /// layer, in that order.
    pub fn new(
        file: &'a PagedFile,
        formats: [Arc<dyn NodeFormat>; 2],
        gen: Generation,
        pages: Range<u64>,
    ) -> Self {
        Self {
            file,
            formats,
            gen,
            pages,
            chunk_pages: DEFAULT_CHUNK_PAGES,
        }
    }

    /// Overrides how many pages one job covers.
    #[cfg(test)]
    pub fn with_chunk_pages(mut self, chunk_pages: u64) -> Self {
        self.chunk_pages = chunk_pages.max(1);
        self
    }

    /// Cleans every page in range.
    pub fn clean(&self, executor: &dyn CleanupExecutor) -> Result<CleanupStats> {
        let started = Instant::now();
        let counters = Counters::default();
        let mut jobs: Vec<CleanupJob<'_>> = Vec::new();
        let mut start = self.pages.start;
        while start < self.pages.end {
            let end = (start + self.chunk_pages).min(self.pages.end);
            let counters = &counters;
            jobs.push(Box::new(move || self.clean_chunk(start..end, counters)));
            start = end;
        }
        tracing::debug!(
            target: "genbtree::cleaner",
            jobs = jobs.len(),
            low = self.pages.start,
            high = self.pages.end,
            "crash cleanup started"
        );
        executor.execute(jobs)?;
        let stats = CleanupStats {
            pages_visited: counters.pages_visited.load(Ordering::Relaxed),
            tree_nodes: counters.tree_nodes.load(Ordering::Relaxed),
            cleaned_crash_pointers: counters.cleaned.load(Ordering::Relaxed),
            duration: started.elapsed(),
        };
        tracing::info!(
            target: "genbtree::cleaner",
            pages_visited = stats.pages_visited,
            tree_nodes = stats.tree_nodes,
            cleaned_crash_pointers = stats.cleaned_crash_pointers,
            elapsed_ms = stats.duration.as_millis() as u64,
            "crash cleanup finished"
        );
        Ok(stats)
    }

    fn clean_chunk(&self, pages: Range<u64>, counters: &Counters) -> Result<()> {
        let mut cursor = self.file.cursor(PfMode::Write);
        for id in pages {
            cursor.next(PageId(id))?;
            counters.pages_visited.fetch_add(1, Ordering::Relaxed);
            let offsets = {
                let page = cursor.read()?;
                if !is_tree_node(&page) {
                    continue;
                }
                counters.tree_nodes.fetch_add(1, Ordering::Relaxed);
                let offsets = self.pointer_offsets(&page);
                if !offsets.iter().any(|&at| gspp::has_crashed(&page, at, self.gen)) {
                    continue;
                }
                offsets
            };
            let mut page = cursor.write()?;
            let cleaned = offsets
                .into_iter()
                .filter(|&at| gspp::clean_crashed(&mut page, at, self.gen))
                .count();
            counters.cleaned.fetch_add(cleaned as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn pointer_offsets(&self, page: &[u8]) -> Vec<usize> {
        let mut offsets = vec![
            HeaderPointer::Left.offset(),
            HeaderPointer::Right.offset(),
            HeaderPointer::Successor.offset(),
        ];
        if raw_node_kind(page) == NodeKind::Internal as u8 {
            let format = &self.formats[usize::from(layer(page) != 0)];
            let count = key_count(page).min(format.max_key_count(NodeKind::Internal));
            offsets.extend((0..=count).map(|pos| format.child_offset(pos)));
        }
        offsets
    }
}

/// Progress of the cleanup registered at open.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CleanupState {
    /// Registered but not yet run.
    NotStarted,
    /// Running right now.
    Running,
    /// Done, or never needed.
    Finished,
    /// Failed; the tree stays dirty until a later open cleans it.
    Failed(String),
}

/// Shared cleanup status of one open tree.
pub(crate) struct CleanupHandle {
    state: Mutex<CleanupState>,
}

impl CleanupHandle {
    pub fn new(state: CleanupState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> CleanupState {
        self.state.lock().clone()
    }

    /// Fails with [`TreeError::CleanupFailed`] if the cleanup failed.
    pub fn check(&self) -> Result<()> {
        match &*self.state.lock() {
            CleanupState::Failed(reason) => Err(TreeError::CleanupFailed(reason.clone())),
            _ => Ok(()),
        }
    }

    /// Runs the cleanup if it has not been started yet. `_cleaner` is held
    /// until the outcome is recorded.
    pub fn run(
        &self,
        _cleaner: CleanerGuard,
        monitor: &dyn Monitor,
        executor: &dyn CleanupExecutor,
        cleaner: &CrashCleaner<'_>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != CleanupState::NotStarted {
                drop(state);
                return self.check();
            }
            *state = CleanupState::Running;
        }
        monitor.cleanup_started();
        let outcome = cleaner
            .clean(executor)
            .and_then(|stats| monitor.cleanup_finished(&stats));
        let next = match &outcome {
            Ok(()) => CleanupState::Finished,
            Err(TreeError::FileClosed) => {
                monitor.cleanup_closed();
                CleanupState::Failed("tree closed during cleanup".into())
            }
            Err(err) => {
                tracing::error!(target: "genbtree::cleaner", error = %err, "crash cleanup failed");
                monitor.cleanup_failed(err);
                CleanupState::Failed(err.to_string())
            }
        };
        *self.state.lock() = next;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executors_run_every_job_and_report_failures() {
        let ran = AtomicUsize::new(0);
        for executor in [&InlineExecutor as &dyn CleanupExecutor, &ThreadedExecutor::new(3)] {
            ran.store(0, Ordering::SeqCst);
            let jobs: Vec<CleanupJob<'_>> = (0..10)
                .map(|i| {
                    let ran = &ran;
                    Box::new(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                        if i == 7 {
                            Err(TreeError::IllegalState("job seven"))
                        } else {
                            Ok(())
                        }
                    }) as CleanupJob<'_>
                })
                .collect();
            assert!(matches!(executor.execute(jobs), Err(TreeError::IllegalState("job seven"))));
            assert_eq!(ran.load(Ordering::SeqCst), 10);
        }
    }

    #[test]
    fn failed_cleanup_is_sticky() {
        let handle = CleanupHandle::new(CleanupState::Failed("boom".into()));
        assert!(matches!(
            handle.check(),
            Err(TreeError::CleanupFailed(reason)) if reason == "boom"
        ));
        assert_eq!(handle.state(), CleanupState::Failed("boom".into()));
    }
}
