//! Memory-mapped files.
//!
//! A mapping reserves one writable file-backed page per page of the file.
//! Pages are private to the process: once dirtied they go to swap, and
//! nothing is ever written back to the file.

use crate::error::{Result, VmError};
use crate::fs::FileHandle;
use crate::system::VirtualMemory;
use crate::threading::process::Pid;
use alloc::collections::BTreeMap;
use core::fmt;
use pagewise_shared::mem::{is_page_aligned, is_user_address, pages_spanned, PAGE_FRAME_SIZE};

pub type MapId = u32;

#[derive(Clone)]
pub struct Mapping {
    pub addr: usize,
    pub len: usize,
    pub file: FileHandle,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("addr", &format_args!("{:#X}", self.addr))
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// The file mappings of one address space.
#[derive(Debug, Default)]
pub struct MmapTable {
    next_id: MapId,
    mappings: BTreeMap<MapId, Mapping>,
}

impl MmapTable {
    pub fn insert(&mut self, mapping: Mapping) -> MapId {
        let id = self.next_id;
        self.next_id += 1;
        self.mappings.insert(id, mapping);
        id
    }

    pub fn remove(&mut self, id: MapId) -> Option<Mapping> {
        self.mappings.remove(&id)
    }

    pub fn get(&self, id: MapId) -> Option<&Mapping> {
        self.mappings.get(&id)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn clear(&mut self) {
        self.mappings.clear();
    }
}

impl VirtualMemory {
    /// Map all of `file` at `addr` in `pid`'s address space.
    pub fn mmap(&self, pid: Pid, file: FileHandle, addr: usize) -> Result<MapId> {
        if addr == 0 {
            return Err(VmError::InvalidReference { addr });
        }
        if !is_page_aligned(addr) {
            return Err(VmError::Misaligned { addr });
        }
        let len = usize::try_from(file.len()).map_err(|_| VmError::InvalidBacking)?;
        if len == 0 {
            return Err(VmError::InvalidBacking);
        }
        let last = addr
            .checked_add(len - 1)
            .ok_or(VmError::InvalidReference { addr })?;
        if !is_user_address(last) {
            return Err(VmError::InvalidReference { addr: last });
        }

        let space = self.address_space(pid)?;
        let mut mmaps = space.mmaps.lock();
        let mut spt = space.spt.lock();
        if let Some(page) = pages_spanned(addr, len).find(|&page| spt.has(page)) {
            return Err(VmError::DuplicateMapping { addr: page });
        }

        for page in pages_spanned(addr, len) {
            let offset = page - addr;
            let read_bytes = (len - offset).min(PAGE_FRAME_SIZE);
            spt.reserve_file_backed(
                page,
                file.clone(),
                offset as u64,
                read_bytes,
                PAGE_FRAME_SIZE - read_bytes,
                true,
            )?;
        }

        let id = mmaps.insert(Mapping { addr, len, file });
        log::debug!("mmap: pid {pid} mapped {len} bytes at {addr:#X} as {id}");
        Ok(id)
    }

    /// Remove mapping `id` and every page it covers.
    pub fn munmap(&self, pid: Pid, id: MapId) -> Result<()> {
        let space = self.address_space(pid)?;
        let mut mmaps = space.mmaps.lock();
        let mapping = mmaps.get(id).ok_or(VmError::BadMapId(id))?;
        let mut spt = space.spt.lock();
        for page in pages_spanned(mapping.addr, mapping.len) {
            if spt.has(page) {
                spt.remove(page, &space.page_table, &self.frames, &self.swap)?;
            }
        }
        drop(spt);

        mmaps.remove(id);
        log::debug!("munmap: pid {pid} unmapped {id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;
    use alloc::sync::Arc;

    #[test]
    fn ids_are_not_reused() {
        let file: FileHandle = Arc::new(MemFile::new(vec![1; 10]));
        let mut table = MmapTable::default();
        let a = table.insert(Mapping {
            addr: 0x1000,
            len: 10,
            file: file.clone(),
        });
        assert!(table.remove(a).is_some());
        let b = table.insert(Mapping {
            addr: 0x1000,
            len: 10,
            file,
        });
        assert_ne!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(b).unwrap().addr, 0x1000);
    }
}
