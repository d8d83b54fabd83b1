//! Kernel access to user buffers, and user accesses as the CPU performs them.

use super::address_space::AddressSpace;
use super::fault::{FaultOutcome, PageFault, FAULT_EXIT_STATUS};
use super::spt::PageState;
use super::Frame;
use crate::error::{Result, VmError};
use crate::system::VirtualMemory;
use crate::threading::process::Pid;
use alloc::sync::Arc;
use alloc::vec::Vec;
use pagewise_shared::mem::{is_user_address, page_offset, pages_spanned, PAGE_FRAME_SIZE};
use pagewise_shared::paging::AccessFault;

/// Pages of a user buffer held resident. Unpinned when dropped.
pub struct PinnedRange<'a> {
    vm: &'a VirtualMemory,
    space: Arc<AddressSpace>,
    addr: usize,
    len: usize,
}

impl PinnedRange<'_> {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PinnedRange<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.vm.unpin_pages(&self.space, self.addr, self.len) {
            log::warn!("unpin of {:#X}+{} failed: {err}", self.addr, self.len);
        }
    }
}

fn check_user_range(addr: usize, len: usize) -> Result<()> {
    let end = addr.checked_add(len).ok_or(VmError::InvalidReference { addr })?;
    // Trying to reach kernel memory.
    if len > 0 && !is_user_address(end - 1) {
        return Err(VmError::InvalidReference { addr: end - 1 });
    }
    Ok(())
}

impl VirtualMemory {
    /// Fault in every page of `[addr, addr + len)` and pin it.
    ///
    /// Faults are taken as the user would take them, so the range may grow
    /// the stack relative to the process's saved stack pointer.
    pub fn pin_range(&self, pid: Pid, addr: usize, len: usize) -> Result<PinnedRange<'_>> {
        check_user_range(addr, len)?;
        let space = self.address_space(pid)?;
        let mut pinned = PinnedRange {
            vm: self,
            space: space.clone(),
            addr,
            len: 0,
        };

        for page in pages_spanned(addr, len) {
            let fault = PageFault {
                addr: page.max(addr),
                is_write: false,
                is_user: true,
                present: false,
                stack_pointer: space.user_stack_pointer(),
            };
            let mut spt = space.spt.lock();
            let frame = self.fault_in_locked(&space, &mut spt, &fault)?;
            self.pin(frame);
            drop(spt);
            pinned.len = (page + PAGE_FRAME_SIZE).min(addr + len) - addr;
        }
        pinned.len = len;
        Ok(pinned)
    }

    /// Unpin every page of `[addr, addr + len)`.
    pub fn unpin_range(&self, pid: Pid, addr: usize, len: usize) -> Result<()> {
        let space = self.address_space(pid)?;
        self.unpin_pages(&space, addr, len)
    }

    fn unpin_pages(&self, space: &AddressSpace, addr: usize, len: usize) -> Result<()> {
        let spt = space.spt.lock();
        for page in pages_spanned(addr, len) {
            match spt.lookup(page).map(|descriptor| descriptor.state()) {
                Some(PageState::Resident { frame, .. }) => self.unpin(*frame),
                _ => return Err(VmError::NotMapped { addr: page }),
            }
        }
        Ok(())
    }

    /// Copy a user buffer into kernel memory.
    pub fn copy_from_user(&self, pid: Pid, addr: usize, len: usize) -> Result<Vec<u8>> {
        let pinned = self.pin_range(pid, addr, len)?;
        let mut bytes = Vec::with_capacity(len);
        self.for_each_chunk(&pinned, false, |frame, chunk| {
            bytes.extend_from_slice(&frame[chunk]);
        })?;
        Ok(bytes)
    }

    /// Copy `data` into user memory at `addr`. Fails on read-only pages.
    pub fn copy_to_user(&self, pid: Pid, addr: usize, data: &[u8]) -> Result<()> {
        let pinned = self.pin_range(pid, addr, data.len())?;
        let mut done = 0;
        self.for_each_chunk(&pinned, true, |frame, chunk| {
            let n = chunk.len();
            frame[chunk].copy_from_slice(&data[done..done + n]);
            done += n;
        })
    }

    /// Run `f` on each page-sized piece of a pinned range, going through the
    /// page table so accessed and dirty bits are kept.
    fn for_each_chunk(
        &self,
        pinned: &PinnedRange<'_>,
        write: bool,
        mut f: impl FnMut(&mut [u8], core::ops::Range<usize>),
    ) -> Result<()> {
        let mut cursor = pinned.addr;
        let end = pinned.addr + pinned.len;
        while cursor < end {
            let n = (PAGE_FRAME_SIZE - page_offset(cursor)).min(end - cursor);
            let mut page_table = pinned.space.page_table.lock();
            let frame = page_table
                .access(cursor, write, false)
                .map_err(|fault| match fault {
                    AccessFault::Protection => VmError::RightsViolation { addr: cursor },
                    AccessFault::NotPresent => VmError::InvalidReference { addr: cursor },
                })?;
            let offset = page_offset(cursor);
            f(&mut self.memory.frame(Frame::new(frame as usize))[..], offset..offset + n);
            drop(page_table);
            cursor += n;
        }
        Ok(())
    }

    /// Read user memory the way a user-mode instruction would, trapping into
    /// [`resolve_fault`](Self::resolve_fault) on every miss.
    pub fn user_read(
        &self,
        pid: Pid,
        addr: usize,
        buf: &mut [u8],
        stack_pointer: usize,
    ) -> FaultOutcome {
        let mut done = 0;
        self.user_access(pid, addr, buf.len(), false, stack_pointer, |frame, chunk| {
            let n = chunk.len();
            buf[done..done + n].copy_from_slice(&frame[chunk]);
            done += n;
        })
    }

    /// Write user memory the way a user-mode instruction would.
    pub fn user_write(
        &self,
        pid: Pid,
        addr: usize,
        data: &[u8],
        stack_pointer: usize,
    ) -> FaultOutcome {
        let mut done = 0;
        self.user_access(pid, addr, data.len(), true, stack_pointer, |frame, chunk| {
            let n = chunk.len();
            frame[chunk].copy_from_slice(&data[done..done + n]);
            done += n;
        })
    }

    fn user_access(
        &self,
        pid: Pid,
        addr: usize,
        len: usize,
        write: bool,
        stack_pointer: usize,
        mut f: impl FnMut(&mut [u8], core::ops::Range<usize>),
    ) -> FaultOutcome {
        let terminate = FaultOutcome::Terminate {
            status: FAULT_EXIT_STATUS,
        };
        let Some(end) = addr.checked_add(len) else {
            return terminate;
        };

        let mut cursor = addr;
        while cursor < end {
            let Ok(space) = self.address_space(pid) else {
                return terminate;
            };
            let n = (PAGE_FRAME_SIZE - page_offset(cursor)).min(end - cursor);
            let result = {
                let mut page_table = space.page_table.lock();
                page_table.access(cursor, write, true).map(|frame| {
                    let offset = page_offset(cursor);
                    f(&mut self.memory.frame(Frame::new(frame as usize))[..], offset..offset + n);
                })
            };

            match result {
                Ok(()) => cursor += n,
                Err(fault) => {
                    let fault = PageFault {
                        addr: cursor,
                        is_write: write,
                        is_user: true,
                        present: fault == AccessFault::Protection,
                        stack_pointer,
                    };
                    space.set_user_stack_pointer(stack_pointer);
                    if let FaultOutcome::Terminate { status } = self.resolve_fault(pid, fault) {
                        return FaultOutcome::Terminate { status };
                    }
                }
            }
        }
        FaultOutcome::Resolved
    }
}
