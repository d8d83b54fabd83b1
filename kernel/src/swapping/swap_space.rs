use super::SwapSlot;
use crate::block::block_core::{Block, BlockSector};
use crate::block::block_error::BlockError;
use crate::error::{Result, VmError};
use crate::mem::FrameBytes;
use pagewise_shared::bitmap::SlotBitmap;
use pagewise_shared::mem::SECTORS_PER_PAGE;
use pagewise_shared::sizes::SECTOR_SIZE;
use spin::Mutex;

/// Page-granular storage on the swap device.
///
/// A set bit in `free` means the slot is free. Slot `n` occupies
/// `SECTORS_PER_PAGE` consecutive sectors starting at `n * SECTORS_PER_PAGE`.
pub struct SwapSpace {
    device: Block,
    free: Mutex<SlotBitmap>,
}

impl SwapSpace {
    pub fn new(device: Block) -> Self {
        let slots = device.size() as usize / SECTORS_PER_PAGE;
        log::info!("swap: {} slots on {}", slots, device.name());

        Self {
            device,
            free: Mutex::new(SlotBitmap::new(slots, true)),
        }
    }

    /// Claim a free slot.
    pub fn allocate_slot(&self) -> Result<SwapSlot> {
        let index = self.free.lock().scan_and_flip(true).ok_or_else(|| {
            log::warn!("swap: no free slots on {}", self.device.name());
            VmError::SwapFull
        })?;
        log::trace!("swap: allocated slot {index}");
        Ok(SwapSlot(index))
    }

    /// Release a slot without touching the device.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut free = self.free.lock();
        assert!(!free.get(slot.0), "double free of {slot:?}");
        free.set(slot.0, true);
    }

    /// Write one page to `slot`, which must have been allocated.
    pub fn write_out(&self, slot: SwapSlot, page: &FrameBytes) -> Result<()> {
        self.assert_occupied(slot);
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE as usize).enumerate() {
            self.device.write(Self::sector(slot, i)?, chunk)?;
        }
        Ok(())
    }

    /// Read one page back from `slot`. The slot stays allocated.
    pub fn read_in(&self, slot: SwapSlot, page: &mut FrameBytes) -> Result<()> {
        self.assert_occupied(slot);
        for (i, chunk) in page.chunks_exact_mut(SECTOR_SIZE as usize).enumerate() {
            self.device.read(Self::sector(slot, i)?, chunk)?;
        }
        Ok(())
    }

    fn assert_occupied(&self, slot: SwapSlot) {
        let free = self.free.lock();
        assert!(slot.0 < free.len(), "{slot:?} out of bounds!");
        assert!(!free.get(slot.0), "Nothing exists at {slot:?}!");
    }

    fn sector(slot: SwapSlot, i: usize) -> Result<BlockSector, BlockError> {
        BlockSector::try_from(slot.0 * SECTORS_PER_PAGE + i)
            .map_err(|_| BlockError::SectorOutOfBounds)
    }

    pub fn slots(&self) -> usize {
        self.free.lock().len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.lock().count_ones()
    }

    pub fn used_slots(&self) -> usize {
        let free = self.free.lock();
        free.len() - free.count_ones()
    }

    pub fn device(&self) -> &Block {
        &self.device
    }
}
