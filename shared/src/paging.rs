// https://wiki.osdev.org/Paging
//
// A software model of the two-level 32-bit x86 page table. The kernel installs
// and removes translations through `PageManager`, and `PageManager::access`
// plays the part of the MMU: it walks the table, enforces the present, user
// and read/write bits, and sets the accessed and dirty bits the way the
// hardware does.

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support. It would be nice if
// you could tell clippy that you were only dealing with 32-bit usizes...
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{page_round_down, PAGE_FRAME_SIZE};
use alloc::{boxed::Box, collections::BTreeMap};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    fmt,
    mem::size_of,
    ops::{Deref, DerefMut},
};

const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    pub present: bool,
    #[bit(1, rw)]
    pub read_write: bool,
    #[bit(2, rw)]
    pub user_supervisor: bool,
    #[bit(3, rw)]
    pub write_through: bool,
    #[bit(4, rw)]
    pub cache_disable: bool,
    #[bit(5, rw)]
    pub accessed: bool,
    #[bit(6, rw)]
    pub dirty: bool,
    #[bit(7, rw)]
    pub page_attribute_table: bool,
    #[bit(8, rw)]
    pub global: bool,
    #[bits(12..=31, rw)]
    pub page_frame_address: u20,
}

impl PageTableEntry {
    /// The frame number this entry translates to.
    pub fn frame(&self) -> u32 {
        self.page_frame_address().value()
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    pub page_directory_index: u10,
    #[bits(12..=21, r)]
    pub page_table_index: u10,
    #[bits(0..=11, r)]
    pub offset: u12,
}

impl VirtualAddress {
    fn indices(virt_addr: usize) -> (usize, usize) {
        debug_assert!(virt_addr <= u32::MAX as usize);
        let va = Self::new_with_raw_value(virt_addr as u32);
        (
            usize::from(va.page_directory_index().value()),
            usize::from(va.page_table_index().value()),
        )
    }
}

/// Why the MMU refused an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// No present translation for the page.
    NotPresent,
    /// The page is present but the access is not permitted (write to a
    /// read-only page, or a user access to a supervisor page).
    Protection,
}

/// One address space's hardware page table.
///
/// Only page tables that hold at least one translation are allocated; the
/// directory level is the map key.
#[derive(Default)]
pub struct PageManager {
    tables: BTreeMap<usize, Box<PageTable>>,
    mapped: usize,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, virt_addr: usize) -> Option<&PageTableEntry> {
        let (dir, idx) = VirtualAddress::indices(virt_addr);
        self.tables.get(&dir).map(|table| &table[idx])
    }

    fn slot_mut(&mut self, virt_addr: usize) -> &mut PageTableEntry {
        let (dir, idx) = VirtualAddress::indices(virt_addr);
        &mut self.tables.entry(dir).or_default()[idx]
    }

    /// Install a translation from the page containing `virt_addr` to `frame`.
    ///
    /// Panics if the page is already mapped.
    pub fn map(&mut self, frame: u32, virt_addr: usize, writable: bool, user: bool) {
        let entry = self.slot_mut(virt_addr);
        assert!(!entry.present(), "{virt_addr:#X} is already mapped");
        *entry = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(user)
            .with_page_frame_address(u20::new(frame));
        self.mapped += 1;
    }

    /// Remove the translation for `virt_addr`, returning the entry as it was
    /// so the caller can inspect its accessed and dirty bits.
    pub fn unmap(&mut self, virt_addr: usize) -> Option<PageTableEntry> {
        let (dir, idx) = VirtualAddress::indices(virt_addr);
        let table = self.tables.get_mut(&dir)?;
        let old = table[idx];
        if !old.present() {
            return None;
        }
        table[idx] = PageTableEntry::DEFAULT;
        self.mapped -= 1;
        if table.iter().all(|entry| !entry.present()) {
            self.tables.remove(&dir);
        }
        Some(old)
    }

    /// Put back an entry previously returned by [`PageManager::unmap`].
    pub fn restore(&mut self, virt_addr: usize, entry: PageTableEntry) {
        assert!(entry.present());
        let slot = self.slot_mut(virt_addr);
        assert!(!slot.present(), "{virt_addr:#X} was remapped");
        *slot = entry;
        self.mapped += 1;
    }

    /// The present entry for `virt_addr`, if any.
    pub fn entry(&self, virt_addr: usize) -> Option<PageTableEntry> {
        self.slot(virt_addr).copied().filter(|entry| entry.present())
    }

    pub fn is_mapped(&self, virt_addr: usize) -> bool {
        self.entry(virt_addr).is_some()
    }

    /// Clear the accessed bit of `virt_addr`, returning its previous value.
    pub fn clear_accessed(&mut self, virt_addr: usize) -> bool {
        if !self.is_mapped(virt_addr) {
            return false;
        }
        let entry = self.slot_mut(virt_addr);
        let was = entry.accessed();
        *entry = entry.with_accessed(false);
        was
    }

    pub fn is_range_mapped(&self, start: usize, len: usize) -> bool {
        crate::mem::pages_spanned(start, len).all(|page| self.is_mapped(page))
    }

    /// Number of pages with a present translation.
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }

    /// Translate an access to `virt_addr` the way the MMU would, setting the
    /// accessed bit (and the dirty bit on writes). Returns the frame number.
    pub fn access(
        &mut self,
        virt_addr: usize,
        write: bool,
        user: bool,
    ) -> Result<u32, AccessFault> {
        let page = page_round_down(virt_addr);
        let Some(entry) = self.entry(page) else {
            return Err(AccessFault::NotPresent);
        };
        if (user && !entry.user_supervisor()) || (write && !entry.read_write()) {
            return Err(AccessFault::Protection);
        }
        let updated = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        *self.slot_mut(page) = updated;
        Ok(updated.frame())
    }
}

impl fmt::Debug for PageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageManager")
            .field("tables", &self.tables.len())
            .field("mapped", &self.mapped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_translate() {
        let mut pm = PageManager::new();
        pm.map(7, 0x0804_8000, false, true);
        assert!(pm.is_mapped(0x0804_8000));
        assert!(!pm.is_mapped(0x0804_9000));
        assert_eq!(pm.access(0x0804_8123, false, true), Ok(7));
        assert_eq!(pm.mapped_pages(), 1);
    }

    #[test]
    fn access_sets_accessed_and_dirty() {
        let mut pm = PageManager::new();
        pm.map(3, 0x1000, true, true);
        let entry = pm.entry(0x1000).unwrap();
        assert!(!entry.accessed() && !entry.dirty());

        pm.access(0x1004, false, true).unwrap();
        let entry = pm.entry(0x1000).unwrap();
        assert!(entry.accessed() && !entry.dirty());

        pm.access(0x1004, true, true).unwrap();
        assert!(pm.entry(0x1000).unwrap().dirty());

        assert!(pm.clear_accessed(0x1000));
        assert!(!pm.clear_accessed(0x1000));
        // Clearing the accessed bit leaves the dirty bit alone.
        assert!(pm.entry(0x1000).unwrap().dirty());
    }

    #[test]
    fn protection_faults() {
        let mut pm = PageManager::new();
        pm.map(1, 0x2000, false, true);
        pm.map(2, 0x3000, true, false);
        assert_eq!(pm.access(0x2000, true, true), Err(AccessFault::Protection));
        assert_eq!(pm.access(0x3000, false, true), Err(AccessFault::Protection));
        assert_eq!(pm.access(0x3000, true, false), Ok(2));
        assert_eq!(pm.access(0x4000, false, true), Err(AccessFault::NotPresent));
    }

    #[test]
    fn unmap_and_restore() {
        let mut pm = PageManager::new();
        pm.map(9, 0x40_0000, true, true);
        pm.access(0x40_0000, true, true).unwrap();
        let old = pm.unmap(0x40_0000).unwrap();
        assert!(old.dirty());
        assert_eq!(old.frame(), 9);
        assert_eq!(pm.mapped_pages(), 0);
        assert!(pm.unmap(0x40_0000).is_none());

        pm.restore(0x40_0000, old);
        assert!(pm.entry(0x40_0000).unwrap().dirty());
        assert!(pm.is_range_mapped(0x40_0000, PAGE_FRAME_SIZE));
    }
}
