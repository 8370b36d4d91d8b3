//! Page table entries and flags for the software scale model.
//!
//! Entry layout (16 bits used):
//!
//! ```text
//! 15            4 3   2   1   0
//! +--------------+---+---+---+---+
//! | frame address| NX| U | W | P |
//! +--------------+---+---+---+---+
//! ```

use core::fmt;

use crate::PhysicalAddress;

use super::ENTRY_COUNT;

/// Permission and status bits of a page table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(usize);

impl PageFlags {
    const PRESENT: usize = 1 << 0;
    const WRITABLE: usize = 1 << 1;
    const USER: usize = 1 << 2;
    const NO_EXECUTE: usize = 1 << 3;

    const ALL: usize = Self::PRESENT | Self::WRITABLE | Self::USER | Self::NO_EXECUTE;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw & Self::ALL)
    }

    pub const fn to_raw(self) -> usize {
        self.0
    }

    #[inline]
    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    pub fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    pub fn is_no_execute(self) -> bool {
        self.0 & Self::NO_EXECUTE != 0
    }

    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.set(Self::NO_EXECUTE, no_execute);
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageFlags({}{}{}{})",
            if self.is_present() { 'P' } else { '-' },
            if self.is_writable() { 'W' } else { '-' },
            if self.is_user() { 'U' } else { '-' },
            if self.is_no_execute() { "NX" } else { "" },
        )
    }
}

/// A single page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const ADDRESS_MASK: usize = 0xFFF0;
    const FLAGS_MASK: usize = 0xF;

    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & Self::FLAGS_MASK == 0,
            "physical address must be page-aligned"
        );
        Self((address.as_usize() & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    /// Frame address, if the entry is present.
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

/// One level of the page table hierarchy.
///
/// Tables are placed in emulated physical memory so entries can refer to them by
/// physical address.
#[repr(C, align(16))]
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

    /// True if no entry in this table is present.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }

    /// Loads this table as the active root. There is no MMU to program in emulation.
    ///
    /// # Safety
    ///
    /// Always safe in emulation; unsafe to match the hardware signature.
    pub unsafe fn activate(&self) {}
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keeps_address_and_flags_apart() {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_user(true);

        let mut entry = PageEntry::new(PhysicalAddress::new(0x1230), flags);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x1230)));
        assert!(entry.flags().is_user());
        assert!(!entry.flags().is_writable());

        flags.set_writable(true);
        entry.set_flags(flags);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x1230)));
        assert!(entry.flags().is_writable());
    }

    #[test]
    fn non_present_entry_has_no_address() {
        let entry = PageEntry::new(PhysicalAddress::new(0x40), PageFlags::empty());
        assert_eq!(entry.address(), None);
    }

    #[test]
    fn flags_debug_format() {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_no_execute(true);
        assert_eq!(format!("{:?}", flags), "PageFlags(P--NX)");
    }

    #[test]
    fn fresh_table_is_empty() {
        let mut table = PageTable::new();
        assert!(table.is_empty());

        let mut flags = PageFlags::empty();
        flags.set_present(true);
        *table.entry_mut(3) = PageEntry::new(PhysicalAddress::new(0x10), flags);
        assert!(!table.is_empty());
    }
}
