#![forbid(unsafe_code)]

//! Tree-wide locks.
//!
//! [`TreeLock`] coordinates the writer, the crash cleaner and checkpoints:
//! a writer waits for a running cleanup, a checkpoint waits for both, and
//! closing a tree only takes the writer side so an in-flight cleanup never
//! blocks it. [`WriterGate`] enforces that either one batched writer or any
//! number of parallel writers exist, failing fast instead of waiting.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, TreeError};

/// Blocking lock over the writer and cleaner roles of one tree.
#[derive(Clone, Default)]
pub struct TreeLock {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<LockState>,
    changed: Condvar,
}

#[derive(Default, Debug)]
struct LockState {
    writer: bool,
    cleaner: bool,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct LockSnapshot {
    /// Whether the writer side is held.
    pub writer: bool,
    /// Whether the cleaner side is held.
    pub cleaner: bool,
}

/// Holds the writer side of a [`TreeLock`].
pub struct WriterGuard {
    inner: Arc<Inner>,
}

/// Holds the cleaner side of a [`TreeLock`].
pub struct CleanerGuard {
    inner: Arc<Inner>,
}

/// Holds both sides of a [`TreeLock`] for the duration of a checkpoint.
pub struct CheckpointGuard {
    inner: Arc<Inner>,
}

impl TreeLock {
    /// Creates an unlocked tree lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until neither a writer nor a checkpoint holds the writer side.
    pub fn writer(&self) -> WriterGuard {
        self.acquire(true, false);
        WriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Waits for the cleaner side.
    pub fn cleaner(&self) -> CleanerGuard {
        self.acquire(false, true);
        CleanerGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Waits until both sides are free and takes them together.
    pub fn writer_and_cleaner(&self) -> CheckpointGuard {
        self.acquire(true, true);
        CheckpointGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Waits until no cleanup is running, then takes the writer side.
    pub fn writer_after_cleanup(&self) -> WriterGuard {
        let mut state = self.inner.state.lock();
        while state.writer || state.cleaner {
            self.inner.changed.wait(&mut state);
        }
        state.writer = true;
        WriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns the current lock state.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.inner.state.lock();
        LockSnapshot {
            writer: state.writer,
            cleaner: state.cleaner,
        }
    }

    fn acquire(&self, writer: bool, cleaner: bool) {
        let mut state = self.inner.state.lock();
        while (writer && state.writer) || (cleaner && state.cleaner) {
            self.inner.changed.wait(&mut state);
        }
        state.writer |= writer;
        state.cleaner |= cleaner;
    }
}

fn release(inner: &Inner, writer: bool, cleaner: bool) {
    let mut state = inner.state.lock();
    if writer {
        state.writer = false;
    }
    if cleaner {
        state.cleaner = false;
    }
    inner.changed.notify_all();
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        release(&self.inner, true, false);
    }
}

impl Drop for CleanerGuard {
    fn drop(&mut self) {
        release(&self.inner, false, true);
    }
}

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        release(&self.inner, true, true);
    }
}

/// Fail-fast gate between the single batched writer and parallel writers.
#[derive(Clone, Default)]
pub struct WriterGate {
    mode: Arc<Mutex<WriterMode>>,
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
enum WriterMode {
    #[default]
    Idle,
    Single,
    Parallel(usize),
}

/// Registration of the single batched writer.
pub struct SingleWriterPermit {
    mode: Arc<Mutex<WriterMode>>,
}

/// Registration of one parallel writer.
pub struct ParallelWriterPermit {
    mode: Arc<Mutex<WriterMode>>,
}

impl WriterGate {
    /// Creates a gate with no writers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the single writer, failing if any writer is outstanding.
    pub fn single(&self) -> Result<SingleWriterPermit> {
        let mut mode = self.mode.lock();
        match *mode {
            WriterMode::Idle => {
                *mode = WriterMode::Single;
                Ok(SingleWriterPermit {
                    mode: Arc::clone(&self.mode),
                })
            }
            WriterMode::Single => Err(TreeError::IllegalState("writer is already acquired")),
            WriterMode::Parallel(_) => Err(TreeError::IllegalState(
                "cannot acquire writer while parallel writers are active",
            )),
        }
    }

    /// Registers another parallel writer, failing if the single writer is held.
    pub fn parallel(&self) -> Result<ParallelWriterPermit> {
        let mut mode = self.mode.lock();
        *mode = match *mode {
            WriterMode::Idle => WriterMode::Parallel(1),
            WriterMode::Parallel(n) => WriterMode::Parallel(n + 1),
            WriterMode::Single => {
                return Err(TreeError::IllegalState(
                    "cannot acquire parallel writer while the writer is active",
                ))
            }
        };
        Ok(ParallelWriterPermit {
            mode: Arc::clone(&self.mode),
        })
    }

    /// Whether any writer of either kind is registered.
    pub fn is_idle(&self) -> bool {
        *self.mode.lock() == WriterMode::Idle
    }
}

impl Drop for SingleWriterPermit {
    fn drop(&mut self) {
        *self.mode.lock() = WriterMode::Idle;
    }
}

impl Drop for ParallelWriterPermit {
    fn drop(&mut self) {
        let mut mode = self.mode.lock();
        *mode = match *mode {
            WriterMode::Parallel(n) if n > 1 => WriterMode::Parallel(n - 1),
            _ => WriterMode::Idle,
        };
    }
}
