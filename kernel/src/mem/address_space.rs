use super::mmap::MmapTable;
use super::spt::{PageStatus, SupplementalPageTable};
use crate::threading::process::Pid;
use core::sync::atomic::{AtomicUsize, Ordering};
use pagewise_shared::paging::PageManager;
use spin::Mutex;

/// A process's view of memory: its page descriptors, its hardware page table
/// and its file mappings.
///
/// Lock order within one address space is `mmaps`, then `spt`, then
/// `page_table`. The frame table lock may be taken while holding `spt`, never
/// the other way round.
pub struct AddressSpace {
    pid: Pid,
    pub(crate) mmaps: Mutex<MmapTable>,
    pub(crate) spt: Mutex<SupplementalPageTable>,
    pub(crate) page_table: Mutex<PageManager>,
    /// User stack pointer saved on entry to the kernel, consulted when the
    /// kernel faults on a user stack page during a system call.
    user_sp: AtomicUsize,
}

impl AddressSpace {
    pub fn new(pid: Pid, stack_top: usize) -> Self {
        Self {
            pid,
            mmaps: Mutex::new(MmapTable::default()),
            spt: Mutex::new(SupplementalPageTable::new()),
            page_table: Mutex::new(PageManager::new()),
            user_sp: AtomicUsize::new(stack_top),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn set_user_stack_pointer(&self, sp: usize) {
        self.user_sp.store(sp, Ordering::Relaxed);
    }

    pub fn user_stack_pointer(&self) -> usize {
        self.user_sp.load(Ordering::Relaxed)
    }

    /// Status of the page containing `vaddr`, if it has a descriptor.
    pub fn page_status(&self, vaddr: usize) -> Option<PageStatus> {
        self.spt.lock().lookup(vaddr).map(|descriptor| descriptor.status())
    }

    /// Whether the page containing `vaddr` has a hardware translation.
    pub fn is_mapped(&self, vaddr: usize) -> bool {
        self.page_table.lock().is_mapped(pagewise_shared::mem::page_round_down(vaddr))
    }

    /// Whether the hardware translation for `vaddr` allows writes.
    pub fn is_writable(&self, vaddr: usize) -> bool {
        self.page_table
            .lock()
            .entry(pagewise_shared::mem::page_round_down(vaddr))
            .is_some_and(|entry| entry.read_write())
    }

    /// Number of page descriptors.
    pub fn page_count(&self) -> usize {
        self.spt.lock().len()
    }

    pub fn mapped_pages(&self) -> usize {
        self.page_table.lock().mapped_pages()
    }
}
