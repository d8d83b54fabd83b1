//! Errors reported by the virtual memory subsystem.

use crate::block::block_error::BlockError;
use crate::fs::FsError;
use crate::mem::mmap::MapId;
use crate::threading::process::Pid;
use core::error::Error;
use core::fmt::{self, Display, Formatter};

/// An I/O failure while moving a page between memory and its backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The swap device refused a sector transfer.
    Swap(BlockError),
    /// The file backing a page could not be read.
    File(FsError),
}

impl Display for IoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Swap(err) => write!(f, "swap device: {err}"),
            IoError::File(err) => write!(f, "backing file: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No frame could be produced, even after trying to evict one.
    OutOfMemory,
    /// Every swap slot is occupied, so a dirty victim has nowhere to go.
    SwapFull,
    /// The address has no page descriptor and is not a legal stack access.
    InvalidReference { addr: usize },
    /// The access is not permitted on the page (e.g. a write to a read-only page).
    RightsViolation { addr: usize },
    /// A page descriptor already exists at the address.
    DuplicateMapping { addr: usize },
    /// No page descriptor exists at the address.
    NotMapped { addr: usize },
    /// The address must be page aligned.
    Misaligned { addr: usize },
    /// File-backed page parameters do not describe exactly one page.
    InvalidBacking,
    /// The frame is pinned and cannot be released.
    FramePinned,
    /// No address space is registered for the process.
    UnknownProcess(Pid),
    /// The process has no file mapping with this id.
    BadMapId(MapId),
    Io(IoError),
}

impl VmError {
    /// Whether the error came from the block device or the filesystem.
    pub fn is_io(&self) -> bool {
        matches!(self, VmError::Io(_))
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory: no frame could be evicted"),
            VmError::SwapFull => write!(f, "swap device is full"),
            VmError::InvalidReference { addr } => write!(f, "invalid reference to {addr:#X}"),
            VmError::RightsViolation { addr } => write!(f, "access to {addr:#X} not permitted"),
            VmError::DuplicateMapping { addr } => write!(f, "{addr:#X} is already mapped"),
            VmError::NotMapped { addr } => write!(f, "{addr:#X} is not mapped"),
            VmError::Misaligned { addr } => write!(f, "{addr:#X} is not page aligned"),
            VmError::InvalidBacking => write!(f, "file backing does not cover exactly one page"),
            VmError::FramePinned => write!(f, "frame is pinned"),
            VmError::UnknownProcess(pid) => write!(f, "no address space for pid {pid}"),
            VmError::BadMapId(id) => write!(f, "no mapping with id {id}"),
            VmError::Io(err) => write!(f, "I/O failure: {err}"),
        }
    }
}

impl Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::Io(IoError::Swap(err))
    }
}

impl From<FsError> for VmError {
    fn from(err: FsError) -> Self {
        VmError::Io(IoError::File(err))
    }
}

pub type Result<T, E = VmError> = core::result::Result<T, E>;
