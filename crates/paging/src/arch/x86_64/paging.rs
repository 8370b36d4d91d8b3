use x86_64::{
    PhysAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{PageTableFlags, PhysFrame},
};

use crate::{PhysicalAddress, address::AddressTranslator};

use super::ENTRY_COUNT;

/// Permission and status bits of a page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(PageTableFlags::from_bits_truncate(raw as u64))
    }

    pub const fn to_raw(self) -> usize {
        self.0.bits() as usize
    }

    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    pub fn set_present(&mut self, present: bool) {
        self.0.set(PageTableFlags::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    pub fn is_no_execute(self) -> bool {
        self.0.contains(PageTableFlags::NO_EXECUTE)
    }

    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.0.set(PageTableFlags::NO_EXECUTE, no_execute);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const ADDRESS_MASK: usize = 0x000F_FFFF_FFFF_F000;
    const FLAGS_MASK: usize = !Self::ADDRESS_MASK;

    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );
        Self((address.as_usize() & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK);
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// One level of the 4-level hierarchy, laid out exactly as the MMU expects.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry(0); ENTRY_COUNT],
        }
    }

    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }

    /// Loads this table into CR3.
    ///
    /// # Safety
    ///
    /// The table must map the currently executing kernel code and stack.
    pub unsafe fn activate(&self) {
        let phys = AddressTranslator::current().ptr_to_phys(self as *const PageTable);
        let frame = PhysFrame::containing_address(PhysAddr::new(phys as u64));
        // SAFETY: The caller guarantees the kernel stays mapped under this table.
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
