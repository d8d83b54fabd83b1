//! The supplemental page table: how to materialize each page of a process.

use super::{frame_table::FrameTable, Frame, FrameBytes};
use crate::error::{Result, VmError};
use crate::fs::{FileHandle, FsError};
use crate::swapping::{SwapSlot, SwapSpace};
use alloc::collections::BTreeMap;
use core::fmt;
use pagewise_shared::mem::{is_page_aligned, page_round_down, PAGE_FRAME_SIZE};
use pagewise_shared::paging::PageManager;
use spin::Mutex;

/// Where the bytes of a file-backed page come from: `read_bytes` bytes of
/// `file` at `offset`, followed by `zero_bytes` zeroes.
#[derive(Clone)]
pub struct FileBacking {
    file: FileHandle,
    offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
}

impl FileBacking {
    pub fn new(
        file: FileHandle,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Self> {
        if read_bytes.checked_add(zero_bytes) != Some(PAGE_FRAME_SIZE) {
            return Err(VmError::InvalidBacking);
        }

        Ok(Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }

    /// Fill `page` from the file. A short read is an error.
    pub(crate) fn load(&self, page: &mut FrameBytes) -> Result<()> {
        let (head, tail) = page.split_at_mut(self.read_bytes);
        let read = self.file.read_at(self.offset, head)?;
        if read != self.read_bytes {
            return Err(FsError::ShortRead.into());
        }
        tail.fill(0);
        Ok(())
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum PageState {
    FileBacked(FileBacking),
    ZeroFill,
    Swapped(SwapSlot),
    /// In memory. `file` is kept only while the page is known to match it, so
    /// that a clean eviction can go back to the file instead of to swap.
    Resident {
        frame: Frame,
        file: Option<FileBacking>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    FileBacked,
    ZeroFill,
    Swapped,
    Resident,
}

#[derive(Debug, Clone)]
pub struct PageDescriptor {
    writable: bool,
    state: PageState,
}

impl PageDescriptor {
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    pub fn status(&self) -> PageStatus {
        match self.state {
            PageState::FileBacked(_) => PageStatus::FileBacked,
            PageState::ZeroFill => PageStatus::ZeroFill,
            PageState::Swapped(_) => PageStatus::Swapped,
            PageState::Resident { .. } => PageStatus::Resident,
        }
    }

    pub fn frame(&self) -> Option<Frame> {
        match self.state {
            PageState::Resident { frame, .. } => Some(frame),
            _ => None,
        }
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.state {
            PageState::Swapped(slot) => Some(slot),
            _ => None,
        }
    }

    pub(crate) fn set_state(&mut self, state: PageState) {
        self.state = state;
    }
}

/// What tearing down a set of descriptors gave back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub pages: usize,
    pub frames_released: usize,
    pub slots_freed: usize,
}

/// Per-process map from page-aligned virtual address to page descriptor.
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<usize, PageDescriptor>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve_zero(&mut self, vaddr: usize, writable: bool) -> Result<()> {
        self.reserve(vaddr, writable, PageState::ZeroFill)
    }

    pub fn reserve_file_backed(
        &mut self,
        vaddr: usize,
        file: FileHandle,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let backing = FileBacking::new(file, offset, read_bytes, zero_bytes)?;
        self.reserve(vaddr, writable, PageState::FileBacked(backing))
    }

    fn reserve(&mut self, vaddr: usize, writable: bool, state: PageState) -> Result<()> {
        if !is_page_aligned(vaddr) {
            return Err(VmError::Misaligned { addr: vaddr });
        }

        if self.pages.contains_key(&vaddr) {
            return Err(VmError::DuplicateMapping { addr: vaddr });
        }

        self.pages.insert(vaddr, PageDescriptor { writable, state });
        Ok(())
    }

    /// Descriptor of the page containing `vaddr`.
    pub fn lookup(&self, vaddr: usize) -> Option<&PageDescriptor> {
        self.pages.get(&page_round_down(vaddr))
    }

    pub fn has(&self, vaddr: usize) -> bool {
        self.lookup(vaddr).is_some()
    }

    pub(crate) fn descriptor_mut(&mut self, vaddr: usize) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&page_round_down(vaddr))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> impl Iterator<Item = (usize, &PageDescriptor)> {
        self.pages.iter().map(|(&vaddr, descriptor)| (vaddr, descriptor))
    }

    /// Remove the descriptor for the page containing `vaddr`, giving back its
    /// frame or swap slot. Fails with `FramePinned` if the page is pinned.
    pub fn remove(
        &mut self,
        vaddr: usize,
        page_table: &Mutex<PageManager>,
        frames: &Mutex<FrameTable>,
        swap: &SwapSpace,
    ) -> Result<PageStatus> {
        let page = page_round_down(vaddr);
        let descriptor = self
            .pages
            .get(&page)
            .ok_or(VmError::NotMapped { addr: vaddr })?;
        let status = descriptor.status();
        release_backing(page, descriptor, page_table, frames, swap, false)?;
        self.pages.remove(&page);
        Ok(status)
    }

    /// Remove every descriptor. Pins die with the address space, so pinned
    /// frames are released too.
    pub fn clear(
        &mut self,
        page_table: &Mutex<PageManager>,
        frames: &Mutex<FrameTable>,
        swap: &SwapSpace,
    ) -> Result<Teardown> {
        let mut teardown = Teardown::default();
        while let Some((page, descriptor)) = self.pages.pop_first() {
            release_backing(page, &descriptor, page_table, frames, swap, true)?;
            teardown.pages += 1;
            match descriptor.status() {
                PageStatus::Resident => teardown.frames_released += 1,
                PageStatus::Swapped => teardown.slots_freed += 1,
                PageStatus::FileBacked | PageStatus::ZeroFill => {}
            }
        }
        Ok(teardown)
    }
}

fn release_backing(
    page: usize,
    descriptor: &PageDescriptor,
    page_table: &Mutex<PageManager>,
    frames: &Mutex<FrameTable>,
    swap: &SwapSpace,
    force: bool,
) -> Result<()> {
    match descriptor.state {
        PageState::Resident { frame, .. } => {
            let mut frames = frames.lock();
            if force {
                frames.unpin_all(frame);
            } else if frames.is_pinned(frame) {
                return Err(VmError::FramePinned);
            }
            page_table.lock().unmap(page);
            frames.release(frame)
        }
        PageState::Swapped(slot) => {
            swap.free_slot(slot);
            Ok(())
        }
        PageState::FileBacked(_) | PageState::ZeroFill => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;
    use alloc::sync::Arc;

    fn file() -> FileHandle {
        Arc::new(MemFile::new(vec![7; 2 * PAGE_FRAME_SIZE]))
    }

    #[test]
    fn reserve_and_lookup() {
        let mut spt = SupplementalPageTable::new();
        spt.reserve_zero(0x1000, true).unwrap();
        spt.reserve_file_backed(0x2000, file(), 0, 100, PAGE_FRAME_SIZE - 100, false)
            .unwrap();

        assert!(spt.has(0x1000));
        assert!(spt.has(0x1fff));
        assert!(!spt.has(0x3000));
        assert_eq!(spt.lookup(0x1abc).unwrap().status(), PageStatus::ZeroFill);

        let code = spt.lookup(0x2000).unwrap();
        assert_eq!(code.status(), PageStatus::FileBacked);
        assert!(!code.writable());
        assert_eq!(code.frame(), None);
        assert_eq!(spt.len(), 2);
    }

    #[test]
    fn duplicate_reservation_is_rejected() {
        let mut spt = SupplementalPageTable::new();
        spt.reserve_zero(0x4000, true).unwrap();
        assert_eq!(
            spt.reserve_zero(0x4000, false),
            Err(VmError::DuplicateMapping { addr: 0x4000 })
        );
        assert_eq!(
            spt.reserve_file_backed(0x4000, file(), 0, PAGE_FRAME_SIZE, 0, true),
            Err(VmError::DuplicateMapping { addr: 0x4000 })
        );
        assert!(spt.lookup(0x4000).unwrap().writable());
    }

    #[test]
    fn misaligned_reservation_is_rejected() {
        let mut spt = SupplementalPageTable::new();
        assert_eq!(
            spt.reserve_zero(0x4010, true),
            Err(VmError::Misaligned { addr: 0x4010 })
        );
        assert!(spt.is_empty());
    }

    #[test]
    fn backing_must_cover_one_page() {
        let mut spt = SupplementalPageTable::new();
        assert_eq!(
            spt.reserve_file_backed(0x1000, file(), 0, 100, 100, false),
            Err(VmError::InvalidBacking)
        );
        assert_eq!(
            spt.reserve_file_backed(0x1000, file(), 0, usize::MAX, 1, false),
            Err(VmError::InvalidBacking)
        );
    }

    #[test]
    fn load_zeroes_the_tail() {
        let data: Vec<u8> = (0..=255).cycle().take(PAGE_FRAME_SIZE).collect();
        let file: FileHandle = Arc::new(MemFile::new(data.clone()));
        let backing = FileBacking::new(file, 16, 1000, PAGE_FRAME_SIZE - 1000).unwrap();
        let mut page = [0xAA; PAGE_FRAME_SIZE];
        backing.load(&mut page).unwrap();
        assert_eq!(&page[..1000], &data[16..1016]);
        assert!(page[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn load_past_end_of_file_is_short() {
        let offset = PAGE_FRAME_SIZE as u64 + 1;
        let backing = FileBacking::new(file(), offset, PAGE_FRAME_SIZE, 0).unwrap();
        let mut page = [0; PAGE_FRAME_SIZE];
        assert_eq!(
            backing.load(&mut page),
            Err(VmError::Io(crate::error::IoError::File(FsError::ShortRead)))
        );
    }
}
