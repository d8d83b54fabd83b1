//! Turning page faults into resident pages.

use super::address_space::AddressSpace;
use super::spt::{PageState, SupplementalPageTable};
use super::Frame;
use crate::error::{Result, VmError};
use crate::system::{bump, VirtualMemory};
use crate::threading::process::Pid;
use pagewise_shared::mem::{is_user_address, page_round_down};

/// Exit status of a process killed by a page fault.
pub const FAULT_EXIT_STATUS: i32 = -1;

/// A decoded page fault trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: usize,
    pub is_write: bool,
    /// The fault happened in user mode.
    pub is_user: bool,
    /// The page was present, so this is a protection fault.
    pub present: bool,
    /// The user stack pointer at the time of the fault.
    pub stack_pointer: usize,
}

impl PageFault {
    /// Decode the error code pushed by the processor for a page fault.
    pub fn from_error_code(error_code: u32, addr: usize, stack_pointer: usize) -> Self {
        Self {
            addr,
            present: error_code & 0b001 != 0,
            is_write: error_code & 0b010 != 0,
            is_user: error_code & 0b100 != 0,
            stack_pointer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Return to the faulting instruction.
    Resolved,
    /// The process has been torn down and must exit with `status`.
    Terminate { status: i32 },
}

impl VirtualMemory {
    /// Handle a page fault taken by `pid`.
    pub fn resolve_fault(&self, pid: Pid, fault: PageFault) -> FaultOutcome {
        match self.fault_in(pid, &fault) {
            Ok(_) => FaultOutcome::Resolved,
            Err(err) => {
                log::warn!("Page fault at {:#X} killed pid {pid}: {err}", fault.addr);
                bump(&self.stats.terminations);
                if let Err(err) = self.destroy_address_space(pid) {
                    log::warn!("Could not tear down pid {pid}: {err}");
                }
                FaultOutcome::Terminate {
                    status: FAULT_EXIT_STATUS,
                }
            }
        }
    }

    /// Make the page at `fault.addr` resident in `pid`'s address space.
    pub fn fault_in(&self, pid: Pid, fault: &PageFault) -> Result<Frame> {
        bump(&self.stats.page_faults);
        let space = self.address_space(pid)?;
        let mut spt = space.spt.lock();
        self.fault_in_locked(&space, &mut spt, fault)
    }

    pub(crate) fn fault_in_locked(
        &self,
        space: &AddressSpace,
        spt: &mut SupplementalPageTable,
        fault: &PageFault,
    ) -> Result<Frame> {
        if !is_user_address(fault.addr) {
            return Err(VmError::InvalidReference { addr: fault.addr });
        }

        let page = page_round_down(fault.addr);
        let Some(descriptor) = spt.lookup(page) else {
            if fault.present || !self.is_stack_access(fault) {
                return Err(VmError::InvalidReference { addr: fault.addr });
            }
            spt.reserve_zero(page, true)?;
            bump(&self.stats.stack_growths);
            log::debug!("Growing stack of pid {} to {page:#X}", space.pid());
            return self.materialize(space, spt, page);
        };

        if fault.is_write && !descriptor.writable() {
            return Err(VmError::RightsViolation { addr: fault.addr });
        }

        match descriptor.state() {
            PageState::Resident { frame, .. } => Ok(*frame),
            _ => self.materialize(space, spt, page),
        }
    }

    /// Whether a fault with no page descriptor is the stack growing down.
    pub fn is_stack_access(&self, fault: &PageFault) -> bool {
        let top = self.config.stack_top;
        let bottom = top.saturating_sub(self.config.max_stack_size);
        let sp = fault.stack_pointer;
        fault.is_user
            && fault.addr < top
            && fault.addr >= bottom
            && fault.addr >= sp.saturating_sub(self.config.push_slack)
    }

    fn materialize(
        &self,
        space: &AddressSpace,
        spt: &mut SupplementalPageTable,
        page: usize,
    ) -> Result<Frame> {
        let (state, writable) = match spt.lookup(page) {
            Some(descriptor) => (descriptor.state().clone(), descriptor.writable()),
            None => return Err(VmError::NotMapped { addr: page }),
        };

        let zero_fill = matches!(state, PageState::ZeroFill);
        let frame = self.acquire_frame(spt, space.pid(), page, zero_fill)?;

        let loaded = {
            let mut bytes = self.memory.frame(frame);
            match &state {
                PageState::FileBacked(file) => file.load(&mut bytes),
                PageState::Swapped(slot) => self.swap.read_in(*slot, &mut bytes),
                PageState::ZeroFill => Ok(()),
                PageState::Resident { .. } => unreachable!("page {page:#X} is already resident"),
            }
        };
        if let Err(err) = loaded {
            log::warn!("Could not load page {page:#X} of pid {}: {err}", space.pid());
            self.release_frame(frame)?;
            return Err(err);
        }

        let file = match state {
            PageState::FileBacked(file) => {
                bump(&self.stats.file_loads);
                Some(file)
            }
            PageState::Swapped(slot) => {
                self.swap.free_slot(slot);
                bump(&self.stats.swap_ins);
                None
            }
            _ => {
                bump(&self.stats.zero_fills);
                None
            }
        };
        log::debug!("Loaded page {page:#X} of pid {} into {frame:?}", space.pid());

        space
            .page_table
            .lock()
            .map(frame.number(), page, writable, true);
        if let Some(descriptor) = spt.descriptor_mut(page) {
            descriptor.set_state(PageState::Resident { frame, file });
        }
        Ok(frame)
    }
}
