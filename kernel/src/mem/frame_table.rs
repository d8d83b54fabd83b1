//! Which frames back which user pages.

use super::frame_allocator::{Allocation, FrameAllocator};
use super::page_replacement::{Clock, PageReplacementPolicy, Reference};
use super::spt::SupplementalPageTable;
use super::Frame;
use crate::error::{Result, VmError};
use crate::system::VirtualMemory;
use crate::threading::process::Pid;
use alloc::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTableEntry {
    pub frame: Frame,
    pub owner: Pid,
    pub page: usize,
    /// Outstanding pins. The frame may not be evicted or released while
    /// this is nonzero.
    pub pins: u32,
}

impl FrameTableEntry {
    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }
}

/// Every frame currently holding a user page, with the eviction policy that
/// sweeps over them. One lock guards the whole table, the clock hand
/// included.
pub struct FrameTable<R: PageReplacementPolicy = Clock> {
    allocator: FrameAllocator,
    entries: BTreeMap<Frame, FrameTableEntry>,
    policy: R,
}

impl<R: PageReplacementPolicy> FrameTable<R> {
    pub fn new(num_frames: usize) -> Self {
        Self {
            allocator: FrameAllocator::new(num_frames),
            entries: BTreeMap::new(),
            policy: R::default(),
        }
    }

    /// Allocate a free frame for `page` of `owner`, without evicting.
    pub fn insert(&mut self, owner: Pid, page: usize) -> Option<Allocation> {
        let allocation = self.allocator.alloc()?;
        let frame = allocation.frame;
        let previous = self.entries.insert(
            frame,
            FrameTableEntry {
                frame,
                owner,
                page,
                pins: 0,
            },
        );
        assert!(previous.is_none(), "{frame:?} handed out twice");
        Some(allocation)
    }

    /// Remove `frame` from the table and give it back to the allocator.
    pub fn release(&mut self, frame: Frame) -> Result<()> {
        let entry = self
            .entries
            .get(&frame)
            .unwrap_or_else(|| panic!("release of {frame:?}, which is not in the frame table"));
        if entry.is_pinned() {
            return Err(VmError::FramePinned);
        }

        self.entries.remove(&frame);
        self.allocator.dealloc(frame);
        Ok(())
    }

    pub fn pin(&mut self, frame: Frame) {
        self.entry_mut(frame).pins += 1;
    }

    /// Drop one pin. Panics if `frame` is not pinned.
    pub fn unpin(&mut self, frame: Frame) {
        let entry = self.entry_mut(frame);
        assert!(entry.pins > 0, "unpin of {frame:?}, which is not pinned");
        entry.pins -= 1;
    }

    /// Drop every pin on `frame`.
    pub fn unpin_all(&mut self, frame: Frame) {
        self.entry_mut(frame).pins = 0;
    }

    fn entry_mut(&mut self, frame: Frame) -> &mut FrameTableEntry {
        self.entries
            .get_mut(&frame)
            .unwrap_or_else(|| panic!("{frame:?} is not in the frame table"))
    }

    pub fn is_pinned(&self, frame: Frame) -> bool {
        self.entries.get(&frame).is_some_and(FrameTableEntry::is_pinned)
    }

    pub fn entry(&self, frame: Frame) -> Option<&FrameTableEntry> {
        self.entries.get(&frame)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.allocator.total_frames()
    }

    pub fn is_full(&self) -> bool {
        !self.allocator.has_room()
    }

    /// Ask the policy for a victim. `probe` reports (and clears) the accessed
    /// bit of a candidate.
    pub fn select_victim(
        &mut self,
        probe: &mut dyn FnMut(&FrameTableEntry) -> Reference,
    ) -> Option<FrameTableEntry> {
        let frame = self.policy.select_victim(&self.entries, probe)?;
        self.entries.get(&frame).copied()
    }
}

impl VirtualMemory {
    /// Get a frame to hold `page` of `owner`, evicting another page if memory
    /// is full. `requester` is `owner`'s supplemental page table, which the
    /// caller holds locked.
    ///
    /// The frame is zeroed if `zero_fill` is set. Otherwise its contents are
    /// whatever was there before, and the caller must overwrite all of it.
    pub(crate) fn acquire_frame(
        &self,
        requester: &mut SupplementalPageTable,
        owner: Pid,
        page: usize,
        zero_fill: bool,
    ) -> Result<Frame> {
        let allocation = loop {
            let mut frames = self.frames.lock();
            if let Some(allocation) = frames.insert(owner, page) {
                break allocation;
            }

            let evicted = self
                .evictor()
                .evict_one(&mut frames, owner, requester)
                .map_err(|err| match err {
                    VmError::SwapFull => VmError::OutOfMemory,
                    err => err,
                })?;
            if evicted {
                break frames.insert(owner, page).ok_or(VmError::OutOfMemory)?;
            }
            // Every candidate's owner is mid-fault and waiting on this lock.
            drop(frames);
            core::hint::spin_loop();
        };

        if zero_fill && !allocation.scrubbed {
            self.memory.frame(allocation.frame).fill(0);
        }
        Ok(allocation.frame)
    }

    pub(crate) fn release_frame(&self, frame: Frame) -> Result<()> {
        self.frames.lock().release(frame)
    }

    /// Protect `frame` from eviction until it is unpinned. Pins nest: the
    /// frame stays pinned until every pin has been dropped.
    pub fn pin(&self, frame: Frame) {
        self.frames.lock().pin(frame);
    }

    pub fn unpin(&self, frame: Frame) {
        self.frames.lock().unpin(frame);
    }

    pub fn is_pinned(&self, frame: Frame) -> bool {
        self.frames.lock().is_pinned(frame)
    }

    /// Number of frames holding user pages.
    pub fn frames_in_use(&self) -> usize {
        self.frames.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insert_until_full() {
        let mut table: FrameTable = FrameTable::new(2);
        let a = table.insert(1, 0x1000).unwrap();
        let b = table.insert(2, 0x1000).unwrap();
        assert_ne!(a.frame, b.frame);
        assert!(table.is_full());
        assert_eq!(table.insert(1, 0x2000), None);
        assert_eq!(table.len(), 2);

        let entry = table.entry(b.frame).unwrap();
        assert_eq!((entry.owner, entry.page, entry.pins), (2, 0x1000, 0));
    }

    #[test]
    fn pinned_frames_cannot_be_released() {
        let mut table: FrameTable = FrameTable::new(1);
        let frame = table.insert(1, 0).unwrap().frame;
        table.pin(frame);
        assert!(table.is_pinned(frame));
        assert_eq!(table.release(frame), Err(VmError::FramePinned));

        table.unpin(frame);
        assert!(!table.is_pinned(frame));
        table.release(frame).unwrap();
        assert!(table.is_empty());
        assert!(!table.is_full());
    }

    #[test]
    fn pins_nest() {
        let mut table: FrameTable = FrameTable::new(1);
        let frame = table.insert(1, 0).unwrap().frame;
        table.pin(frame);
        table.pin(frame);
        table.unpin(frame);
        assert!(table.is_pinned(frame));
        assert_eq!(table.release(frame), Err(VmError::FramePinned));

        table.unpin(frame);
        assert!(!table.is_pinned(frame));

        table.pin(frame);
        table.pin(frame);
        table.unpin_all(frame);
        assert_eq!(table.entry(frame).unwrap().pins, 0);
    }

    #[test]
    #[should_panic(expected = "not pinned")]
    fn unbalanced_unpin_panics() {
        let mut table: FrameTable = FrameTable::new(1);
        let frame = table.insert(1, 0).unwrap().frame;
        table.unpin(frame);
    }

    #[test]
    #[should_panic(expected = "not in the frame table")]
    fn releasing_unknown_frame_panics() {
        let mut table: FrameTable = FrameTable::new(1);
        let _ = table.release(Frame::new(0));
    }

    #[test]
    fn victim_is_never_pinned() {
        let mut table: FrameTable = FrameTable::new(3);
        let frames: alloc::vec::Vec<_> = (0..3)
            .map(|i| table.insert(1, i * 0x1000).unwrap().frame)
            .collect();
        table.pin(frames[0]);
        table.pin(frames[2]);
        let victim = table.select_victim(&mut |_| Reference::Unreferenced).unwrap();
        assert_eq!(victim.frame, frames[1]);

        table.pin(frames[1]);
        assert_eq!(table.select_victim(&mut |_| Reference::Unreferenced), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert,
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Insert), any::<usize>().prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn never_exceeds_physical_frames(
            capacity in 1usize..16,
            ops in proptest::collection::vec(op(), 0..128),
        ) {
            let mut table: FrameTable = FrameTable::new(capacity);
            let mut live = alloc::vec::Vec::new();
            for op in ops {
                match op {
                    Op::Insert => {
                        if let Some(allocation) = table.insert(1, 0) {
                            prop_assert!(!live.contains(&allocation.frame));
                            live.push(allocation.frame);
                        } else {
                            prop_assert_eq!(live.len(), capacity);
                        }
                    }
                    Op::Release(i) if !live.is_empty() => {
                        let frame = live.swap_remove(i % live.len());
                        table.release(frame).unwrap();
                    }
                    Op::Release(_) => {}
                }
                prop_assert!(table.len() <= table.capacity());
                prop_assert_eq!(table.len(), live.len());
            }
        }
    }
}
