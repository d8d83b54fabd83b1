use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// A RAM-backed block device. Used as the swap device when the kernel runs
/// hosted, and by tests, which can make it fail on demand.
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
    size: BlockSector,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemDisk {
    pub fn new(size: BlockSector) -> Self {
        Self {
            sectors: Mutex::new(vec![0; size as usize * BLOCK_SECTOR_SIZE]),
            size,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent read fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for MemDisk {
    fn size(&self) -> BlockSector {
        self.size
    }

    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BlockError::ReadError);
        }
        buf.copy_from_slice(&self.sectors.lock()[Self::range(sector)]);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BlockError::WriteError);
        }
        self.sectors.lock()[Self::range(sector)].copy_from_slice(buf);
        Ok(())
    }
}
