//! Architecture-independent page table walking.
//!
//! [`PageDirectory`] owns a root table and every intermediate table hanging off it.
//! Intermediate tables are created on demand by [`PageDirectory::map`] and released
//! when the directory is dropped.

use core::ops::Range;

use alloc::boxed::Box;

use crate::{
    PageNumber, PhysicalAddress, VirtualAddress,
    address::AddressTranslator,
    arch::{self, PageEntry, PageFlags, PageTable},
};

/// Errors produced while editing page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No memory left for an intermediate page table.
    OutOfMemory,
}

#[cfg(any(test, feature = "software-emulation"))]
fn alloc_page_table() -> Result<*mut PageTable, MapError> {
    let translator = AddressTranslator::current();
    let phys = translator
        .allocate(size_of::<PageTable>(), align_of::<PageTable>())
        .ok_or(MapError::OutOfMemory)?;
    let ptr: *mut PageTable = translator.phys_to_ptr(phys);
    // SAFETY: Freshly carved out of emulated memory, suitably sized and aligned.
    unsafe { ptr.write(PageTable::new()) };
    Ok(ptr)
}

// Emulated memory is a bump allocator; tables are reclaimed with the whole buffer.
#[cfg(any(test, feature = "software-emulation"))]
unsafe fn free_page_table(_table: *mut PageTable) {}

#[cfg(not(any(test, feature = "software-emulation")))]
fn alloc_page_table() -> Result<*mut PageTable, MapError> {
    Box::try_new(PageTable::new())
        .map(Box::into_raw)
        .map_err(|_| MapError::OutOfMemory)
}

#[cfg(not(any(test, feature = "software-emulation")))]
unsafe fn free_page_table(table: *mut PageTable) {
    // SAFETY: Every intermediate table came from `alloc_page_table`.
    drop(unsafe { Box::from_raw(table) });
}

/// Follows a present non-leaf entry to the table it points at.
fn next_table(entry: PageEntry) -> Option<*mut PageTable> {
    let phys = entry.address()?;
    Some(AddressTranslator::current().phys_to_ptr(phys.as_usize()))
}

/// Page tables for one address space.
pub struct PageDirectory {
    root: Box<PageTable>,
}

// SAFETY: The directory exclusively owns every table reachable from `root`.
unsafe impl Send for PageDirectory {}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            root: Box::new(PageTable::new()),
        }
    }

    /// Root table of the hierarchy.
    pub fn root(&self) -> &PageTable {
        &self.root
    }

    /// Maps the page at `virt` to the frame at `phys`. The present bit is always set.
    ///
    /// An existing mapping for `virt` is replaced.
    ///
    /// # Panics
    ///
    /// Panics if either address is not page-aligned.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        assert!(virt.is_page_aligned(), "virtual address must be page-aligned");
        assert!(phys.is_page_aligned(), "physical address must be page-aligned");

        let entry = self.walk_or_create(virt)?;
        let mut flags = flags;
        flags.set_present(true);
        *entry = PageEntry::new(phys, flags);
        Ok(())
    }

    /// Removes the mapping for `virt`, returning the frame it pointed at.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        assert!(virt.is_page_aligned(), "virtual address must be page-aligned");

        let entry = self.walk_mut(virt)?;
        let phys = entry.address()?;
        entry.clear();
        Some(phys)
    }

    /// Removes every mapping in `pages`. Returns how many were present.
    pub fn unmap_range(&mut self, pages: Range<PageNumber>) -> usize {
        let mut removed = 0;
        for page in pages {
            if self.unmap(page.start()).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Resolves `virt` to the physical byte it maps to and the leaf entry's flags.
    pub fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        let entry = self.walk(virt)?;
        let frame = entry.address()?;
        Some((frame + virt.page_offset(), entry.flags()))
    }

    fn walk(&self, virt: VirtualAddress) -> Option<PageEntry> {
        let mut table: &PageTable = &self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let next = next_table(table.entry(virt.page_index(level)))?;
            // SAFETY: Non-leaf entries only ever point at tables owned by this directory.
            table = unsafe { &*next };
        }
        Some(table.entry(virt.page_index(0)))
    }

    fn walk_mut(&mut self, virt: VirtualAddress) -> Option<&mut PageEntry> {
        let mut table: &mut PageTable = &mut self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let next = next_table(table.entry(virt.page_index(level)))?;
            // SAFETY: As in `walk`.
            table = unsafe { &mut *next };
        }
        Some(table.entry_mut(virt.page_index(0)))
    }

    fn walk_or_create(&mut self, virt: VirtualAddress) -> Result<&mut PageEntry, MapError> {
        let mut table: &mut PageTable = &mut self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = table.entry_mut(virt.page_index(level));
            let next = match next_table(*entry) {
                Some(next) => next,
                None => {
                    let fresh = alloc_page_table()?;
                    let phys = AddressTranslator::current().ptr_to_phys(fresh);

                    // Permissions are enforced at the leaf; intermediates allow everything.
                    let mut flags = PageFlags::empty();
                    flags.set_present(true);
                    flags.set_writable(true);
                    flags.set_user(true);
                    *entry = PageEntry::new(PhysicalAddress::new(phys), flags);
                    fresh
                }
            };
            // SAFETY: Either just allocated above or created by an earlier call.
            table = unsafe { &mut *next };
        }
        Ok(table.entry_mut(virt.page_index(0)))
    }

    unsafe fn free_subtables(table: &mut PageTable, level: usize) {
        if level == 0 {
            return;
        }
        for index in 0..arch::ENTRY_COUNT {
            if let Some(next) = next_table(table.entry(index)) {
                // SAFETY: Owned by this directory and visited exactly once.
                unsafe {
                    Self::free_subtables(&mut *next, level - 1);
                    free_page_table(next);
                }
                table.entry_mut(index).clear();
            }
        }
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        // SAFETY: Nothing else references the directory's tables once it is dropped.
        unsafe { Self::free_subtables(&mut self.root, arch::PAGE_TABLE_LEVELS - 1) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        let _ = std::panic::catch_unwind(|| {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        });
    }

    fn user_rw() -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_user(true);
        flags.set_writable(true);
        flags
    }

    #[test]
    fn map_then_translate() {
        setup();
        let mut dir = PageDirectory::new();

        dir.map(VirtualAddress::new(0x0400), PhysicalAddress::new(0x0200), user_rw())
            .unwrap();

        let (phys, flags) = dir.translate(VirtualAddress::new(0x0407)).unwrap();
        assert_eq!(phys, PhysicalAddress::new(0x0207));
        assert!(flags.is_present());
        assert!(flags.is_writable());
        assert!(flags.is_user());
    }

    #[test]
    fn unmapped_address_does_not_translate() {
        setup();
        let dir = PageDirectory::new();
        assert_eq!(dir.translate(VirtualAddress::new(0x0400)), None);
    }

    #[test]
    fn unmap_returns_frame() {
        setup();
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(0x0100);
        let phys = PhysicalAddress::new(0x0200);

        dir.map(virt, phys, PageFlags::empty()).unwrap();
        assert_eq!(dir.unmap(virt), Some(phys));
        assert_eq!(dir.unmap(virt), None);
        assert_eq!(dir.translate(virt), None);
    }

    #[test]
    fn remap_replaces_flags() {
        setup();
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(0x0500);

        dir.map(virt, PhysicalAddress::new(0x0300), PageFlags::empty()).unwrap();
        dir.map(virt, PhysicalAddress::new(0x0310), user_rw()).unwrap();

        let (phys, flags) = dir.translate(virt).unwrap();
        assert_eq!(phys, PhysicalAddress::new(0x0310));
        assert!(flags.is_writable());
    }

    #[test]
    fn unmap_range_counts_present_pages() {
        setup();
        let mut dir = PageDirectory::new();
        for i in [0x40, 0x41, 0x43] {
            let virt = PageNumber::new(i).start();
            dir.map(virt, PhysicalAddress::new(0x0200 + i * arch::PAGE_SIZE), user_rw())
                .unwrap();
        }

        assert_eq!(dir.unmap_range(PageNumber::new(0x40)..PageNumber::new(0x44)), 3);
        assert_eq!(dir.translate(PageNumber::new(0x41).start()), None);
    }

    #[test]
    fn out_of_memory_for_tables() {
        let handle = std::thread::spawn(|| {
            // Room for a single intermediate table only.
            AddressTranslator::set_current(AddressTranslator::emulated(size_of::<PageTable>()));
            let mut dir = PageDirectory::new();
            dir.map(VirtualAddress::new(0x0400), PhysicalAddress::new(0), PageFlags::empty())
        });
        assert_eq!(handle.join().unwrap(), Err(MapError::OutOfMemory));
    }
}
