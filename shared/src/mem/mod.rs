use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address. User stacks
// start just below it and grow down.
pub const OFFSET: usize = 0x80000000;

// Absolute limit on how far a user stack may grow below OFFSET.
pub const MAX_STACK_SIZE: usize = 8 * MB;

// We only support 32-bit x86, so PUSH writes 4 bytes below the stack pointer.
pub const WORD_SIZE: usize = 4;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / crate::sizes::SECTOR_SIZE as usize;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_address(addr: usize) -> bool {
    addr < OFFSET
}

/// Page-aligned addresses of every page touched by `len` bytes starting at `addr`.
///
/// Empty if `len` is zero.
pub fn pages_spanned(addr: usize, len: usize) -> impl Iterator<Item = usize> {
    let first = page_round_down(addr);
    let end = if len == 0 {
        first
    } else {
        page_round_down(addr.saturating_add(len - 1)) + PAGE_FRAME_SIZE
    };
    (first..end).step_by(PAGE_FRAME_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_down(0x2000), 0x2000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3001));
        assert!(is_user_address(OFFSET - 1));
        assert!(!is_user_address(OFFSET));
    }

    #[test]
    fn spanned_pages() {
        let pages: alloc::vec::Vec<_> = pages_spanned(0x1ffc, 8).collect();
        assert_eq!(pages, [0x1000, 0x2000]);
        assert_eq!(pages_spanned(0x1000, PAGE_FRAME_SIZE).count(), 1);
        assert_eq!(pages_spanned(0x1000, 0).count(), 0);
    }
}
