//! Physical frames and the demand pager built on top of them.

pub mod address_space;
pub mod eviction;
pub mod fault;
pub mod frame_allocator;
pub mod frame_table;
pub mod mmap;
pub mod page_replacement;
pub mod spt;
pub mod user;

use alloc::{boxed::Box, vec::Vec};
use core::fmt;
use pagewise_shared::mem::PAGE_FRAME_SIZE;
use spin::{Mutex, MutexGuard};

/// The contents of one physical frame.
pub type FrameBytes = [u8; PAGE_FRAME_SIZE];

/// A physical frame, named by its index into [`PhysicalMemory`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// The frame number as stored in a page table entry.
    pub fn number(self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

/// The pool of page frames user pages live in.
///
/// Each frame has its own lock so that copying into one frame never waits on
/// I/O against another.
pub struct PhysicalMemory {
    frames: Box<[Mutex<FrameBytes>]>,
}

impl PhysicalMemory {
    pub fn new(num_frames: usize) -> Self {
        let frames: Vec<_> = (0..num_frames)
            .map(|_| Mutex::new([0; PAGE_FRAME_SIZE]))
            .collect();
        Self {
            frames: frames.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Lock the contents of `frame`.
    pub fn frame(&self, frame: Frame) -> MutexGuard<'_, FrameBytes> {
        self.frames[frame.index()].lock()
    }
}
