use crate::block::block_core::Block;
use crate::error::{Result, VmError};
use crate::fs::FileHandle;
use crate::mem::address_space::AddressSpace;
use crate::mem::frame_table::FrameTable;
use crate::mem::spt::Teardown;
use crate::mem::PhysicalMemory;
use crate::swapping::SwapSpace;
use crate::threading::process::{Pid, ProcessTable};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use once_cell::race::OnceBox;
use pagewise_shared::mem::{is_page_aligned, MAX_STACK_SIZE, OFFSET, PAGE_FRAME_SIZE, WORD_SIZE};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames available to user pages.
    pub user_frames: usize,
    /// Initial top of every user stack.
    pub stack_top: usize,
    pub max_stack_size: usize,
    /// How far below the stack pointer a fault may still grow the stack.
    pub push_slack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: 1024,
            stack_top: OFFSET,
            max_stack_size: MAX_STACK_SIZE,
            push_slack: WORD_SIZE,
        }
    }
}

#[derive(Debug, Default)]
pub struct VmStats {
    pub(crate) page_faults: AtomicUsize,
    pub(crate) stack_growths: AtomicUsize,
    pub(crate) file_loads: AtomicUsize,
    pub(crate) zero_fills: AtomicUsize,
    pub(crate) swap_ins: AtomicUsize,
    pub(crate) swap_outs: AtomicUsize,
    pub(crate) evictions: AtomicUsize,
    pub(crate) terminations: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    pub page_faults: usize,
    pub stack_growths: usize,
    pub file_loads: usize,
    pub zero_fills: usize,
    pub swap_ins: usize,
    pub swap_outs: usize,
    pub evictions: usize,
    pub terminations: usize,
}

pub(crate) fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl VmStats {
    pub fn snapshot(&self) -> VmStatsSnapshot {
        let read = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        VmStatsSnapshot {
            page_faults: read(&self.page_faults),
            stack_growths: read(&self.stack_growths),
            file_loads: read(&self.file_loads),
            zero_fills: read(&self.zero_fills),
            swap_ins: read(&self.swap_ins),
            swap_outs: read(&self.swap_outs),
            evictions: read(&self.evictions),
            terminations: read(&self.terminations),
        }
    }
}

/// The demand pager: physical frames, swap, and every process's address
/// space.
pub struct VirtualMemory {
    pub(crate) config: VmConfig,
    pub(crate) memory: PhysicalMemory,
    pub(crate) frames: Mutex<FrameTable>,
    pub(crate) swap: SwapSpace,
    pub(crate) processes: Mutex<ProcessTable>,
    pub(crate) stats: VmStats,
}

impl VirtualMemory {
    pub fn new(config: VmConfig, swap_device: Block) -> Self {
        log::info!(
            "vm: {} user frames, stack top {:#X}",
            config.user_frames,
            config.stack_top
        );

        Self {
            config,
            memory: PhysicalMemory::new(config.user_frames),
            frames: Mutex::new(FrameTable::new(config.user_frames)),
            swap: SwapSpace::new(swap_device),
            processes: Mutex::new(ProcessTable::default()),
            stats: VmStats::default(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn stats(&self) -> VmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Create an empty address space for a new process.
    pub fn create_address_space(&self) -> Pid {
        let mut processes = self.processes.lock();
        let pid = processes.allocate_pid();
        processes.add(Arc::new(AddressSpace::new(pid, self.config.stack_top)));
        log::debug!("vm: created address space for pid {pid}");
        pid
    }

    pub fn address_space(&self, pid: Pid) -> Result<Arc<AddressSpace>> {
        self.processes
            .lock()
            .get(pid)
            .ok_or(VmError::UnknownProcess(pid))
    }

    /// Tear down `pid`'s address space, releasing its frames and swap slots.
    /// Nothing is written back.
    pub fn destroy_address_space(&self, pid: Pid) -> Result<Teardown> {
        let space = self
            .processes
            .lock()
            .remove(pid)
            .ok_or(VmError::UnknownProcess(pid))?;

        space.mmaps.lock().clear();
        let teardown = space
            .spt
            .lock()
            .clear(&space.page_table, &self.frames, &self.swap)?;
        log::debug!("vm: destroyed address space of pid {pid}: {teardown:?}");
        Ok(teardown)
    }

    pub fn reserve_zero(&self, pid: Pid, vaddr: usize, writable: bool) -> Result<()> {
        self.address_space(pid)?.spt.lock().reserve_zero(vaddr, writable)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reserve_file_backed(
        &self,
        pid: Pid,
        vaddr: usize,
        file: FileHandle,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        self.address_space(pid)?
            .spt
            .lock()
            .reserve_file_backed(vaddr, file, offset, read_bytes, zero_bytes, writable)
    }

    /// Reserve the pages of a loadable segment: `read_bytes` from `file` at
    /// `offset`, then `zero_bytes` of zeroes, starting at `vaddr`.
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        pid: Pid,
        file: FileHandle,
        offset: u64,
        vaddr: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        if !is_page_aligned(vaddr) {
            return Err(VmError::Misaligned { addr: vaddr });
        }
        if (read_bytes + zero_bytes) % PAGE_FRAME_SIZE != 0
            || offset % PAGE_FRAME_SIZE as u64 != 0
        {
            return Err(VmError::InvalidBacking);
        }

        let space = self.address_space(pid)?;
        let mut spt = space.spt.lock();
        let (mut read_left, mut zero_left) = (read_bytes, zero_bytes);
        let (mut page, mut offset) = (vaddr, offset);
        while read_left > 0 || zero_left > 0 {
            let page_read = read_left.min(PAGE_FRAME_SIZE);
            let page_zero = PAGE_FRAME_SIZE - page_read;
            if page_read == 0 {
                spt.reserve_zero(page, writable)?;
            } else {
                let file = file.clone();
                spt.reserve_file_backed(page, file, offset, page_read, page_zero, writable)?;
            }

            read_left -= page_read;
            zero_left -= page_zero;
            page += PAGE_FRAME_SIZE;
            offset += page_read as u64;
        }
        Ok(())
    }

    /// Reserve the first stack page, just below the top of the stack.
    pub fn setup_stack(&self, pid: Pid) -> Result<()> {
        let space = self.address_space(pid)?;
        let top = self.config.stack_top;
        space.spt.lock().reserve_zero(top - PAGE_FRAME_SIZE, true)?;
        space.set_user_stack_pointer(top);
        Ok(())
    }
}

static VM: OnceBox<VirtualMemory> = OnceBox::new();

/// Install the system-wide pager.
pub fn init(config: VmConfig, swap_device: Block) -> &'static VirtualMemory {
    if VM.set(Box::new(VirtualMemory::new(config, swap_device))).is_err() {
        panic!("Virtual memory initialized twice.");
    }
    vm()
}

pub fn vm() -> &'static VirtualMemory {
    VM.get().expect("Virtual memory not initialized.")
}
