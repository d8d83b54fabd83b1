use super::address_space::AddressSpace;
use super::frame_table::{FrameTable, FrameTableEntry};
use super::page_replacement::Reference;
use super::spt::{PageState, SupplementalPageTable};
use super::{Frame, PhysicalMemory};
use crate::error::{Result, VmError};
use crate::swapping::{SwapSlot, SwapSpace};
use crate::system::{bump, VirtualMemory, VmStats};
use crate::threading::process::{Pid, ProcessTable};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// Frees frames on behalf of [`VirtualMemory::acquire_frame`].
pub(crate) struct Evictor<'a> {
    memory: &'a PhysicalMemory,
    swap: &'a SwapSpace,
    processes: &'a Mutex<ProcessTable>,
    stats: &'a VmStats,
}

impl VirtualMemory {
    pub(crate) fn evictor(&self) -> Evictor<'_> {
        Evictor {
            memory: &self.memory,
            swap: &self.swap,
            processes: &self.processes,
            stats: &self.stats,
        }
    }
}

impl Evictor<'_> {
    /// Evict one page so that `frames` has room for another.
    ///
    /// `requester` is the locked page table of `requester_pid`. Pages of other
    /// processes are only taken if their page table can be locked without
    /// waiting. Returns `false` if every candidate belongs to such a busy
    /// process; the caller should drop the frame table lock and try again.
    ///
    /// A victim that cannot go to swap because swap is full stays resident
    /// and the sweep moves on, so a clean page can still be reclaimed.
    pub fn evict_one(
        &self,
        frames: &mut FrameTable,
        requester_pid: Pid,
        requester: &mut SupplementalPageTable,
    ) -> Result<bool> {
        let mut busy = false;
        // Frames whose page needs a swap slot that could not be had.
        let mut unswappable: Vec<Frame> = Vec::new();
        let exhausted = |busy: bool, unswappable: &[Frame]| {
            if busy {
                Ok(false)
            } else if unswappable.is_empty() {
                Err(VmError::OutOfMemory)
            } else {
                Err(VmError::SwapFull)
            }
        };

        for _ in 0..=frames.len() {
            let victim = frames.select_victim(&mut |entry| {
                if unswappable.contains(&entry.frame) {
                    return Reference::Busy;
                }
                let reference = self.probe(entry, requester_pid);
                busy |= reference == Reference::Busy;
                reference
            });
            let Some(victim) = victim else {
                return exhausted(busy, &unswappable);
            };

            let evicted = if victim.owner == requester_pid {
                let space = self
                    .space(victim.owner)
                    .ok_or(VmError::UnknownProcess(victim.owner))?;
                self.evict(frames, &space, requester, victim)
            } else {
                // The owner may have started a fault since it was probed.
                let Some(space) = self.space(victim.owner) else {
                    busy = true;
                    continue;
                };
                let Some(mut spt) = space.spt.try_lock() else {
                    busy = true;
                    continue;
                };
                self.evict(frames, &space, &mut spt, victim)
            };

            match evicted {
                Ok(()) => return Ok(true),
                Err(VmError::SwapFull) => unswappable.push(victim.frame),
                Err(err) => return Err(err),
            }
        }
        exhausted(busy, &unswappable)
    }

    fn space(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.processes.lock().get(pid)
    }

    fn probe(&self, entry: &FrameTableEntry, requester_pid: Pid) -> Reference {
        let Some(space) = self.space(entry.owner) else {
            return Reference::Busy;
        };

        if space.page_table.lock().clear_accessed(entry.page) {
            Reference::Referenced
        } else if entry.owner != requester_pid && space.spt.is_locked() {
            Reference::Busy
        } else {
            Reference::Unreferenced
        }
    }

    fn evict(
        &self,
        frames: &mut FrameTable,
        space: &AddressSpace,
        spt: &mut SupplementalPageTable,
        victim: FrameTableEntry,
    ) -> Result<()> {
        let page = victim.page;
        let descriptor = spt
            .descriptor_mut(page)
            .unwrap_or_else(|| panic!("{victim:?} has no page descriptor"));
        let PageState::Resident { frame, file } = descriptor.state().clone() else {
            panic!("{victim:?} backs a page that is not resident");
        };
        assert_eq!(frame, victim.frame, "page {page:#X} is resident elsewhere");

        let mut page_table = space.page_table.lock();
        let mapping = page_table.unmap(page);
        let dirty = mapping.is_some_and(|entry| entry.dirty());

        let next = match file {
            Some(file) if !dirty => PageState::FileBacked(file),
            _ => match self.swap_out(frame) {
                Ok(slot) => PageState::Swapped(slot),
                Err(err) => {
                    if let Some(mapping) = mapping {
                        page_table.restore(page, mapping);
                    }
                    log::warn!(
                        "evict: could not swap out page {page:#X} of pid {}: {err}",
                        victim.owner
                    );
                    return Err(err);
                }
            },
        };
        drop(page_table);

        log::debug!(
            "evict: page {page:#X} of pid {} from {frame:?} to {:?}",
            victim.owner,
            next
        );
        descriptor.set_state(next);
        frames.release(frame)?;
        bump(&self.stats.evictions);
        Ok(())
    }

    fn swap_out(&self, frame: Frame) -> Result<SwapSlot> {
        let slot = self.swap.allocate_slot()?;
        let written = self.swap.write_out(slot, &self.memory.frame(frame));
        if let Err(err) = written {
            self.swap.free_slot(slot);
            return Err(err);
        }
        bump(&self.stats.swap_outs);
        Ok(slot)
    }
}
