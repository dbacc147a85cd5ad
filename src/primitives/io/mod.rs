#![forbid(unsafe_code)]

//! Positioned file I/O underneath the paged file.
//!
//! [`StdFileIo`] reads and writes a real file with `pread`/`pwrite` style
//! calls; [`MemFileIo`] keeps the bytes in memory and can be snapshotted to
//! reopen a tree over exactly what had reached the "disk".

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{Result, TreeError};

/// Positioned reads and writes against one file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`; reading past the end is an error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file as needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Makes all written data durable.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Whether the file has no bytes at all.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(unix)]
fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, dst, off)
}

#[cfg(unix)]
fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, src, off)
}

#[cfg(windows)]
fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, dst, off)
}

#[cfg(windows)]
fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, src, off)
}

/// [`FileIo`] over a shared [`File`] handle.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens `path` for reading and writing, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = read_some(&self.inner, dst, off)?;
            if read == 0 {
                let eof = io::Error::new(ErrorKind::UnexpectedEof, "read reached end of file");
                return Err(eof.into());
            }
            dst = &mut std::mem::take(&mut dst)[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = write_some(&self.inner, src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write made no progress").into());
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(|err| {
            tracing::warn!(target: "genbtree::io", error = %err, "sync_all failed");
            TreeError::from(err)
        })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }
}

/// In-memory [`FileIo`] whose contents can be snapshotted, used to simulate a
/// crash by reopening a tree over the bytes that had reached "disk".
#[derive(Clone, Default)]
pub struct MemFileIo {
    inner: Arc<MemInner>,
}

#[derive(Default)]
struct MemInner {
    bytes: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an independent copy of the current file contents.
    pub fn snapshot(&self) -> MemFileIo {
        let bytes = self.inner.bytes.lock().clone();
        MemFileIo {
            inner: Arc::new(MemInner {
                bytes: Mutex::new(bytes),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every subsequent write and sync fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrites bytes directly, bypassing any page cache.
    pub fn poke(&self, off: u64, src: &[u8]) {
        let mut bytes = self.inner.bytes.lock();
        let end = off as usize + src.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[off as usize..end].copy_from_slice(src);
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(TreeError::Io(io::Error::new(
                ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(())
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.inner.bytes.lock();
        let start = off as usize;
        let end = start + dst.len();
        if end > bytes.len() {
            return Err(TreeError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of memory file",
            )));
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.poke(off, src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.check_writable()
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.bytes.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    #[test]
    fn memory_snapshot_is_independent() -> Result<()> {
        let io = MemFileIo::new();
        io.write_at(0, b"before")?;
        let snapshot = io.snapshot();
        io.write_at(0, b"after!")?;
        let mut buf = [0u8; 6];
        snapshot.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"before");
        io.set_fail_writes(true);
        assert!(io.write_at(0, b"x").is_err());
        assert!(io.sync_all().is_err());
        Ok(())
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();

        let payload = b"hello mundo";
        io.write_at(0, payload).unwrap();
        io.sync_all().unwrap();

        let mut buf = vec![0u8; payload.len()];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, payload);
        assert!(io.len().unwrap() >= payload.len() as u64);
    }

    #[test]
    fn read_past_eof_returns_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();
        let mut buf = [0u8; 8];
        let err = io.read_at(0, &mut buf).unwrap_err();
        match err {
            TreeError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reopen_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io_roundtrip.bin");
        {
            let io = StdFileIo::open(&path).unwrap();
            let buf = vec![42u8; 8192];
            io.write_at(0, &buf).unwrap();
            io.sync_all().unwrap();
        }
        let reopen = StdFileIo::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap(),
        );
        let mut buf = vec![0u8; 8192];
        reopen.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 42));
    }
}
