//! x86_64 4-level paging with 4 KiB pages.

mod paging;

pub use paging::{PageEntry, PageFlags, PageTable};

use x86_64::{VirtAddr, instructions::tlb};

pub const MAX_PHYSICAL_BITS: usize = 52;

pub const PAGE_SIZE: usize = 4096;

pub const PAGE_SHIFT: usize = 12;

pub const PAGE_TABLE_LEVELS: usize = 4;

pub const ENTRY_COUNT: usize = 512;

/// Lowest user-space address. The first 4 MiB stay unmapped.
pub const USER_SPACE_START: usize = 0x40_0000;

/// One past the highest user-space address (top of the canonical lower half).
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// Returns the 9-bit page table index for `address` at `level` (0 = PT, 3 = PML4).
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for x86_64");
    (address >> (PAGE_SHIFT + level * 9)) & (ENTRY_COUNT - 1)
}

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Sign-extends bit 47 into bits 48-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Invalidates the TLB entry for the page containing `addr` on this CPU.
#[inline]
pub fn flush_page(addr: usize) {
    tlb::flush(VirtAddr::new_truncate(addr as u64));
}

/// Invalidates all non-global TLB entries on this CPU.
#[inline]
pub fn flush_all() {
    tlb::flush_all();
}
