//! The filesystem as seen by the pager: something pages can be read from.
//!
//! Implementations must be safe to call from several faulting threads at
//! once; the pager takes no filesystem lock of its own.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The underlying read failed.
    ReadError,
    /// Fewer bytes were available than a page descriptor promised.
    ShortRead,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::ReadError => write!(f, "read error"),
            FsError::ShortRead => write!(f, "short read"),
        }
    }
}

impl core::error::Error for FsError {}

pub trait File: Send + Sync {
    /// Read up to `buf.len()` bytes starting at byte `offset`, returning how
    /// many were read. Reading at or past the end of the file returns 0.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type FileHandle = Arc<dyn File>;

/// A file whose contents live in kernel memory.
pub struct MemFile {
    data: Box<[u8]>,
    fail_reads: AtomicBool,
}

impl MemFile {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into().into_boxed_slice(),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl File for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(FsError::ReadError);
        }
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        let available = self.data.get(start..).unwrap_or_default();
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_at_clamps_to_end() {
        let file = MemFile::new(*b"hello world");
        let mut buf = [0; 8];
        assert_eq!(file.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(file.read_at(11, &mut buf).unwrap(), 0);
        assert_eq!(file.read_at(400, &mut buf).unwrap(), 0);
        assert_eq!(file.len(), 11);
    }

    #[test]
    fn injected_failure() {
        let file = MemFile::new(vec![1, 2, 3]);
        file.fail_reads(true);
        assert_eq!(file.read_at(0, &mut [0; 3]), Err(FsError::ReadError));
    }
}
