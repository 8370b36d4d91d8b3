//! Address spaces: page tables plus the TLB that caches them.

use core::ops::Range;

use crate::{
    PageNumber, PhysicalAddress, VirtualAddress,
    arch::PageFlags,
    page_directory::{MapError, PageDirectory},
    tlb::Tlb,
};

/// The hardware view of one virtual address space.
///
/// Every mutation that can leave a stale translation behind invalidates it before
/// returning, so callers never see an old mapping through the TLB.
pub struct AddressSpace {
    directory: PageDirectory,
    tlb: Tlb,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            directory: PageDirectory::new(),
            tlb: Tlb::new(),
        }
    }

    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Installs `virt -> phys` and drops any stale translation for `virt`.
    pub fn install_mapping(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        log::trace!("pt: map {} -> {} {:?}", virt, phys, flags);
        self.directory.map(virt, phys, flags)?;
        self.tlb.invalidate(virt);
        Ok(())
    }

    /// Removes every mapping in `pages` and invalidates the range.
    pub fn unmap_range(&mut self, pages: Range<PageNumber>) {
        let removed = self.directory.unmap_range(pages.clone());
        log::trace!("pt: unmapped {} pages in [{}, {})", removed, pages.start, pages.end);
        self.tlb.invalidate_range(pages);
    }

    /// Looks up the physical byte behind `virt` and the flags it is mapped with.
    pub fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        self.directory.translate(virt)
    }

    pub fn virtual_to_physical(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate(virt).map(|(phys, _)| phys)
    }

    /// Makes this address space the active one on the current CPU.
    ///
    /// # Safety
    ///
    /// The tables must keep the running kernel mapped.
    pub unsafe fn activate(&self) {
        // SAFETY: Forwarded from the caller.
        unsafe { self.directory.root().activate() };
        self.tlb.invalidate_all();
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressTranslator, TlbFlush};

    fn setup() {
        let _ = std::panic::catch_unwind(|| {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        });
    }

    #[test]
    fn install_invalidates_page() {
        setup();
        let mut space = AddressSpace::new();
        let virt = VirtualAddress::new(0x0410);

        space
            .install_mapping(virt, PhysicalAddress::new(0x0800), PageFlags::empty())
            .unwrap();

        assert_eq!(
            space.virtual_to_physical(virt + 3),
            Some(PhysicalAddress::new(0x0803))
        );
        assert_eq!(space.tlb().take_history(), vec![TlbFlush::Page(virt)]);
    }

    #[test]
    fn unmap_range_invalidates_range() {
        setup();
        let mut space = AddressSpace::new();
        for page in 0x40..0x43 {
            let virt = PageNumber::new(page).start();
            space
                .install_mapping(virt, PhysicalAddress::new(0x0800), PageFlags::empty())
                .unwrap();
        }
        space.tlb().take_history();

        let pages = PageNumber::new(0x40)..PageNumber::new(0x43);
        space.unmap_range(pages.clone());

        assert_eq!(space.translate(PageNumber::new(0x41).start()), None);
        assert_eq!(space.tlb().take_history(), vec![TlbFlush::Range(pages)]);
    }

    #[test]
    fn activate_flushes_everything() {
        setup();
        let space = AddressSpace::new();
        // SAFETY: No MMU under emulation.
        unsafe { space.activate() };
        assert_eq!(space.tlb().take_history(), vec![TlbFlush::All]);
    }
}
