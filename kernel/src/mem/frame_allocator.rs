//! The raw page allocator: which frames of [`PhysicalMemory`](super::PhysicalMemory)
//! are in use, with no notion of who uses them.

pub mod placement_algorithms;

use super::Frame;
use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use placement_algorithms::{NextFit, PlacementAlgorithm};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    // The frame is known to hold only zeroes.
    #[bit(1, rw)]
    scrubbed: bool,
}

/// A frame handed out by [`FrameAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub frame: Frame,
    /// Whether the frame is already all zeroes.
    pub scrubbed: bool,
}

pub struct FrameAllocator<P: PlacementAlgorithm = NextFit> {
    core_map: Box<[CoreMapEntry]>,
    placement: P,
    frames_allocated: usize,
}

impl<P: PlacementAlgorithm> FrameAllocator<P> {
    /// An allocator over `num_frames` frames, all free. Frames start out
    /// zeroed, so they are marked scrubbed.
    pub fn new(num_frames: usize) -> Self {
        Self {
            core_map: vec![CoreMapEntry::DEFAULT.with_scrubbed(true); num_frames]
                .into_boxed_slice(),
            placement: P::default(),
            frames_allocated: 0,
        }
    }

    /// Allocate one frame, if any is free.
    pub fn alloc(&mut self) -> Option<Allocation> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }

        let index = self.placement.place(&self.core_map)?;
        let entry = self.core_map[index];
        assert!(!entry.allocated());
        // Whoever gets the frame is about to write to it.
        self.core_map[index] = entry.with_allocated(true).with_scrubbed(false);
        self.frames_allocated += 1;

        Some(Allocation {
            frame: Frame::new(index),
            scrubbed: entry.scrubbed(),
        })
    }

    /// Return `frame` to the pool. Its contents are left as they were.
    pub fn dealloc(&mut self, frame: Frame) {
        let entry = &mut self.core_map[frame.index()];
        assert!(entry.allocated(), "double free of {frame:?}");
        *entry = entry.with_allocated(false).with_scrubbed(false);
        self.frames_allocated -= 1;
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    pub fn total_frames(&self) -> usize {
        self.core_map.len()
    }

    pub fn has_room(&self) -> bool {
        self.frames_allocated < self.core_map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_until_full() {
        let mut allocator: FrameAllocator = FrameAllocator::new(3);
        let frames: alloc::vec::Vec<_> =
            (0..3).map(|_| allocator.alloc().unwrap().frame).collect();
        assert_eq!(frames, [Frame::new(0), Frame::new(1), Frame::new(2)]);
        assert!(!allocator.has_room());
        assert_eq!(allocator.alloc(), None);

        allocator.dealloc(Frame::new(1));
        assert_eq!(allocator.frames_allocated(), 2);
        assert_eq!(allocator.alloc().unwrap().frame, Frame::new(1));
    }

    #[test]
    fn tracks_scrubbed_frames() {
        let mut allocator: FrameAllocator = FrameAllocator::new(1);
        let first = allocator.alloc().unwrap();
        assert!(first.scrubbed);
        allocator.dealloc(first.frame);

        let second = allocator.alloc().unwrap();
        assert_eq!(second.frame, first.frame);
        assert!(!second.scrubbed);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut allocator: FrameAllocator = FrameAllocator::new(2);
        let frame = allocator.alloc().unwrap().frame;
        allocator.dealloc(frame);
        allocator.dealloc(frame);
    }
}
