//! Per-process address-space maps.

use alloc::{sync::Arc, vec::Vec};
use core::{cmp, fmt, ops::Range};

use paging::{AddressSpace, PAGE_SIZE, PageNumber, VirtualAddress};

use crate::{
    VmError,
    config::{USER_MEM_HIGH, USER_MEM_LOW, USER_PAGES, in_user_range},
    mmobj::{MemObject, ObjectSource},
    pframe::{PageCache, PageRef},
    vmarea::{MapFlags, Protection, VmArea},
};

/// Which end of the user window a free range is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDirection {
    /// Highest sufficient gap, aligned to its top.
    HighToLow,
    /// Lowest sufficient gap, aligned to its bottom.
    LowToHigh,
}

/// The areas of one process, kept sorted by start page and never overlapping,
/// together with the page tables that cache their translations.
pub struct VmMap {
    areas: Vec<VmArea>,
    cache: Arc<PageCache>,
    space: AddressSpace,
}

impl VmMap {
    /// An empty map with fresh page tables.
    pub fn new(cache: Arc<PageCache>) -> Self {
        Self {
            areas: Vec::new(),
            cache,
            space: AddressSpace::new(),
        }
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    /// Areas in ascending address order.
    pub fn areas(&self) -> impl Iterator<Item = &VmArea> {
        self.areas.iter()
    }

    /// Releases every area and its object reference. The map is left empty.
    pub fn destroy(&mut self) {
        if self.areas.is_empty() {
            return;
        }
        log::debug!("vmmap: destroying {} areas", self.areas.len());
        self.areas.clear();
    }

    /// Inserts `area` in address order and returns it.
    ///
    /// # Panics
    ///
    /// Panics if the area is empty, leaves the user window or overlaps an existing
    /// area.
    pub fn insert(&mut self, area: VmArea) -> &mut VmArea {
        assert!(area.start() < area.end(), "inserting empty {:?}", area);
        assert!(
            in_user_range(area.start(), area.npages()),
            "inserting {:?} outside user memory",
            area
        );

        let index = self.areas.partition_point(|a| a.start() < area.start());
        if let Some(previous) = index.checked_sub(1).map(|i| &self.areas[i]) {
            assert!(previous.end() <= area.start(), "{:?} overlaps {:?}", area, previous);
        }
        if let Some(next) = self.areas.get(index) {
            assert!(area.end() <= next.start(), "{:?} overlaps {:?}", area, next);
        }

        self.areas.insert(index, area);
        &mut self.areas[index]
    }

    /// Finds `npages` free pages, first fit in the given direction.
    ///
    /// Gaps against the bottom and top of the user window count.
    pub fn find_range(&self, npages: usize, dir: MapDirection) -> Option<PageNumber> {
        if npages == 0 || npages > USER_PAGES {
            return None;
        }

        match dir {
            MapDirection::HighToLow => {
                let mut ceiling = USER_MEM_HIGH;
                for area in self.areas.iter().rev() {
                    if ceiling - area.end() >= npages {
                        return Some(ceiling - npages);
                    }
                    ceiling = area.start();
                }
                (ceiling - USER_MEM_LOW >= npages).then(|| ceiling - npages)
            }
            MapDirection::LowToHigh => {
                let mut floor = USER_MEM_LOW;
                for area in &self.areas {
                    if area.start() - floor >= npages {
                        return Some(floor);
                    }
                    floor = area.end();
                }
                (USER_MEM_HIGH - floor >= npages).then_some(floor)
            }
        }
    }

    /// The area containing `page`.
    pub fn lookup(&self, page: PageNumber) -> Option<&VmArea> {
        self.areas.iter().find(|area| area.contains(page))
    }

    /// The area containing `page`, for binding objects on a cloned map.
    pub fn area_mut(&mut self, page: PageNumber) -> Option<&mut VmArea> {
        self.areas.iter_mut().find(|area| area.contains(page))
    }

    /// A map with the same layout and no objects bound.
    ///
    /// The caller binds objects to the new areas, as fork does.
    pub fn clone_map(&self) -> VmMap {
        let mut map = VmMap::new(self.cache.clone());
        map.areas = self
            .areas
            .iter()
            .map(|area| {
                VmArea::new(area.start(), area.npages(), area.prot(), area.flags(), area.offset())
            })
            .collect();
        map
    }

    /// Maps `npages` pages of `source`, or of a fresh anonymous object.
    ///
    /// With `lopage` the area is placed there and anything already mapped in the
    /// range is removed; otherwise a free range is found in direction `dir`.
    /// `offset` is a byte offset into the object and must be page-aligned. A private
    /// mapping gets a shadow object of its own in front of the source.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &mut self,
        source: Option<&dyn ObjectSource>,
        lopage: Option<PageNumber>,
        npages: usize,
        prot: Protection,
        flags: MapFlags,
        offset: usize,
        dir: MapDirection,
    ) -> Result<&VmArea, VmError> {
        if npages == 0 || !flags.has_valid_sharing() || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if let Some(lopage) = lopage {
            if !in_user_range(lopage, npages) {
                return Err(VmError::InvalidArgument);
            }
        }

        let start = match lopage {
            Some(lopage) => lopage,
            None => self.find_range(npages, dir).ok_or(VmError::NoFreeRange)?,
        };

        // Obtain the object before touching existing areas so a failure leaves the
        // map unchanged.
        let mut object = match source {
            Some(source) => source.memory_object(&self.cache)?,
            None => MemObject::anonymous(self.cache.clone()),
        };
        if lopage.is_some() {
            self.remove(start, npages);
        }
        if flags.contains(MapFlags::PRIVATE) {
            object = MemObject::shadow(object);
        }

        log::debug!(
            "vmmap: map [{}, {}) {} {:?} -> {} +{:#x}",
            start,
            start + npages,
            prot,
            flags,
            object.id(),
            offset
        );

        let mut area = VmArea::new(start, npages, prot, flags, offset / PAGE_SIZE);
        area.set_object(object);
        Ok(self.insert(area))
    }

    /// Unmaps `[lopage, lopage + npages)`.
    ///
    /// Areas inside the range are dropped, areas straddling one edge are trimmed and
    /// an area straddling both edges is split in two. The page tables for the range
    /// are cleared and the TLB invalidated. Splitting a private area rebinds both
    /// halves to new objects, so its whole old range is cleared as well.
    pub fn remove(&mut self, lopage: PageNumber, npages: usize) {
        let range = lopage..lopage + npages;
        let mut stale = range.clone();
        log::debug!("vmmap: remove [{}, {})", range.start, range.end);

        let mut i = 0;
        while i < self.areas.len() {
            let area = &mut self.areas[i];
            if area.start() >= range.end {
                break;
            }
            if !area.overlaps(&range) {
                i += 1;
                continue;
            }

            if area.start() < range.start && area.end() > range.end {
                if area.is_private() && area.object().is_some() {
                    stale = area.start()..area.end();
                }
                let tail = split(area, &range);
                self.areas.insert(i + 1, tail);
                i += 2;
            } else if area.start() < range.start {
                area.set_end(range.start);
                i += 1;
            } else if area.end() > range.end {
                area.trim_front(range.end - area.start());
                i += 1;
            } else {
                drop(self.areas.remove(i));
            }
        }

        self.space.unmap_range(stale);
    }

    /// True if nothing is mapped in `[start, start + npages)`.
    pub fn is_range_empty(&self, start: PageNumber, npages: usize) -> Result<bool, VmError> {
        if npages == 0 || !in_user_range(start, npages) {
            return Err(VmError::InvalidArgument);
        }
        let range = start..start + npages;
        Ok(!self.areas.iter().any(|area| area.overlaps(&range)))
    }

    /// Copies `buf.len()` bytes of the process's memory at `vaddr` into `buf`.
    pub fn read(&self, vaddr: VirtualAddress, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        for (page, offset, len) in chunks(vaddr, buf.len()) {
            let frame = self.resolve(page)?;
            frame.read(offset, &mut buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Copies `data` into the process's memory at `vaddr`, dirtying every page
    /// touched.
    pub fn write(&mut self, vaddr: VirtualAddress, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        for (page, offset, len) in chunks(vaddr, data.len()) {
            let frame = self.resolve(page)?;
            frame.pin();
            frame.write(offset, &data[done..done + len]);
            frame.set_dirty();
            frame.unpin();
            done += len;
        }
        Ok(())
    }

    /// Resolves the frame behind `page` for writing.
    fn resolve(&self, page: PageNumber) -> Result<PageRef, VmError> {
        let area = self.lookup(page).ok_or(VmError::BadAddress)?;
        let object = area.object().ok_or(VmError::BadAddress)?;
        object.lookup_page(area.object_page(page), true)
    }
}

/// Splits `area` around `hole`, trimming it to the part below and returning the
/// part above.
fn split(area: &mut VmArea, hole: &Range<PageNumber>) -> VmArea {
    let mut tail = VmArea::new(
        hole.end,
        area.end() - hole.end,
        area.prot(),
        area.flags(),
        area.offset() + (hole.end - area.start()),
    );
    area.set_end(hole.start);

    if let Some(object) = area.object().cloned() {
        object.add_ref();
        if area.is_private() {
            // Both halves get a private layer of their own over the old object,
            // each holding one of its two references.
            let head = MemObject::shadow(object.clone());
            area.swap_object(head);
            tail.set_object(MemObject::shadow(object));
        } else {
            tail.set_object(object);
        }
    }
    tail
}

/// Splits `[vaddr, vaddr + len)` into per-page `(page, offset, len)` pieces.
fn chunks(vaddr: VirtualAddress, len: usize) -> impl Iterator<Item = (PageNumber, usize, usize)> {
    let start = vaddr.as_usize();
    let end = start + len;
    let mut addr = start;
    core::iter::from_fn(move || {
        if addr >= end {
            return None;
        }
        let offset = addr % PAGE_SIZE;
        let len = cmp::min(PAGE_SIZE - offset, end - addr);
        let piece = (PageNumber::containing(addr), offset, len);
        addr += len;
        Some(piece)
    })
}

impl Drop for VmMap {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Display for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>21} {:>5} {:>7} {:>8} {:>10} {:>15}",
            "VADDR RANGE", "PROT", "FLAGS", "MMOBJ", "OFFSET", "VFN RANGE"
        )?;
        for area in &self.areas {
            let sharing = if area.is_private() { "PRIVATE" } else { "SHARED" };
            let object = match area.object() {
                Some(object) => alloc::format!("{}", object.id()),
                None => alloc::string::String::from("-"),
            };
            writeln!(
                f,
                "{:#010x}-{:#010x} {:>5} {:>7} {:>8} {:#10x} {:#07x}-{:#07x}",
                area.start().address(),
                area.end().address(),
                area.prot(),
                sharing,
                object,
                area.offset(),
                area.start().as_usize(),
                area.end().as_usize()
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMap").field("areas", &self.areas).finish()
    }
}
