use crate::block::block_error::BlockError;
use alloc::{boxed::Box, string::String, sync::Arc};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = pagewise_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Lower-level interface to block device drivers
pub trait BlockOp: Send + Sync {
    /// Size of the device in sectors
    fn size(&self) -> BlockSector;
    /// Read a block sector
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

// Lets a caller keep a handle on the driver it registered, e.g. to inject
// failures from tests.
impl<T: BlockOp + ?Sized> BlockOp for Arc<T> {
    fn size(&self) -> BlockSector {
        (**self).size()
    }

    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        (**self).read(sector, buf)
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        (**self).write(sector, buf)
    }
}

/// A block device
pub struct Block {
    /// Tha name of the block device
    block_name: String,
    /// The block driver
    driver: Box<dyn BlockOp>,
    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: AtomicU32,
    /// The write count
    write_count: AtomicU32,
}

impl Block {
    pub fn new(block_name: &str, driver: Box<dyn BlockOp>) -> Self {
        Self {
            block_name: String::from(block_name),
            block_size: driver.size(),
            driver,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            log::warn!(
                "{}: invalid sector {} (block size: {})",
                self.block_name,
                sector,
                self.block_size
            );
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.write(sector, buf)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn size(&self) -> BlockSector {
        self.block_size
    }

    pub fn name(&self) -> &str {
        &self.block_name
    }

    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\": {:04} sectors, {:04} read, {:04} write",
            self.block_name,
            self.block_size,
            self.read_count(),
            self.write_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mem_disk::MemDisk;

    #[test]
    fn rejects_bad_sector_and_buffer() {
        let block = Block::new("test", Box::new(MemDisk::new(4)));
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(4, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(block.write(0, &buf[..10]), Err(BlockError::BufferInvalid));
        assert_eq!(block.read_count() + block.write_count(), 0);
    }

    #[test]
    fn counts_transfers() {
        let block = Block::new("test", Box::new(MemDisk::new(4)));
        let data = [0xabu8; BLOCK_SECTOR_SIZE];
        block.write(3, &data).unwrap();
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        block.read(3, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!((block.read_count(), block.write_count()), (1, 1));
    }
}
