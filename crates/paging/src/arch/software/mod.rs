//! Software emulation of the paging hardware.
//!
//! A scale model of x86_64 that runs on any host:
//! - 16-bit virtual and physical addresses
//! - 3 levels of page tables with 4-bit indexes (16 entries per table)
//! - 16-byte pages
//!
//! Physical memory is a flat host buffer ([`EmulatedMemory`]) and page tables live
//! inside it, so walking a table is a real physical-to-virtual translation.
//! TLB shootdowns are no-ops here; [`crate::Tlb`] records them instead.

mod paging;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

pub use paging::{PageEntry, PageFlags, PageTable};

/// Page size in bytes.
pub const PAGE_SIZE: usize = 16;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 4;

/// Number of page table levels (2, 1, 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Entries per page table.
pub const ENTRY_COUNT: usize = 16;

/// Lowest user-space address (the first 64 pages stay unmapped to catch null derefs).
pub const USER_SPACE_START: usize = 0x0400;

/// One past the highest user-space address (top of the canonical lower half).
pub const USER_SPACE_END: usize = 0x8000;

/// Returns the page table index for `address` at `level`.
///
/// - Level 0: bits 4-7
/// - Level 1: bits 8-11
/// - Level 2: bits 12-15
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for software emulation");
    (address >> (PAGE_SHIFT + level * 4)) & (ENTRY_COUNT - 1)
}

/// Physical addresses must fit in 16 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF
}

/// Virtual addresses must be bit-15 sign extended.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Sign-extends bit 15 into bits 16-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & 0x8000) != 0 {
        addr | !0xFFFF
    } else {
        addr & 0xFFFF
    }
}

/// Invalidates the translation for one page. Nothing is cached in emulation.
#[inline]
pub fn flush_page(_addr: usize) {}

/// Invalidates every translation. Nothing is cached in emulation.
#[inline]
pub fn flush_all() {}

/// Flat emulated physical memory with a bump allocator.
///
/// Physical address `n` is byte `n` of the buffer. Memory handed out is never
/// reclaimed here; recycling is layered on top (see [`crate::EmulatedFrames`]).
pub struct EmulatedMemory {
    memory: Vec<u8>,
    next_alloc: AtomicUsize,
}

impl EmulatedMemory {
    /// Creates `size` bytes of zeroed emulated memory.
    pub fn new(size: usize) -> Self {
        assert!(
            validate_physical(size.saturating_sub(1)),
            "emulated memory larger than the physical address space"
        );
        Self {
            memory: alloc::vec![0u8; size],
            next_alloc: AtomicUsize::new(0),
        }
    }

    /// Carves `size` bytes aligned to `align` out of the buffer.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned + size;
            if end > self.memory.len() {
                return None;
            }

            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Host pointer for a physical address.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.memory.len(), "physical address out of bounds");
        // SAFETY: `phys` is in bounds of the buffer, checked above.
        unsafe { self.memory.as_ptr().add(phys) as *mut u8 }
    }

    /// Physical address for a host pointer into the buffer.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let base = self.memory.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= base && addr < base + self.memory.len(),
            "pointer not within emulated memory"
        );
        addr - base
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.next_alloc.load(Ordering::Relaxed)
    }
}
