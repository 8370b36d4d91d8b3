//! Virtual memory areas: one contiguous mapped range of a process.

use core::{
    fmt,
    ops::{BitOr, Range},
    sync::atomic::{AtomicUsize, Ordering},
};

use paging::PageNumber;

use crate::mmobj::ObjectRef;

/// Identifies an area in its object's linkage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(usize);

static NEXT_AREA_ID: AtomicUsize = AtomicUsize::new(1);

impl AreaId {
    pub(crate) fn next() -> Self {
        Self(NEXT_AREA_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "area{}", self.0)
    }
}

/// Access permitted to an area's pages.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection(u8);

impl Protection {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXEC: Self = Self(1 << 2);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Self, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXEC, 'x')
        )
    }
}

impl fmt::Debug for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protection({})", self)
    }
}

/// How an area shares its object, and how it was placed.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MapFlags(u8);

impl MapFlags {
    pub const SHARED: Self = Self(1 << 0);
    pub const PRIVATE: Self = Self(1 << 1);
    pub const FIXED: Self = Self(1 << 4);
    pub const ANON: Self = Self(1 << 5);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when exactly one of [`MapFlags::SHARED`] and [`MapFlags::PRIVATE`] is set.
    pub const fn has_valid_sharing(self) -> bool {
        self.contains(Self::SHARED) != self.contains(Self::PRIVATE)
    }
}

impl BitOr for MapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MapFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for (flag, name) in [
            (Self::SHARED, "SHARED"),
            (Self::PRIVATE, "PRIVATE"),
            (Self::FIXED, "FIXED"),
            (Self::ANON, "ANON"),
        ] {
            if self.contains(flag) {
                list.entry(&format_args!("{}", name));
            }
        }
        list.finish()
    }
}

/// A mapped page range `[start, end)` bound to a memory object.
///
/// A bound area owns one reference on its object and is recorded in the linkage list
/// of its chain's bottom object. Both are released when the area is dropped.
pub struct VmArea {
    id: AreaId,
    start: PageNumber,
    end: PageNumber,
    /// Offset into the object, in pages.
    offset: usize,
    prot: Protection,
    flags: MapFlags,
    object: Option<ObjectRef>,
}

impl VmArea {
    /// An unbound area covering `npages` pages from `start`.
    pub fn new(
        start: PageNumber,
        npages: usize,
        prot: Protection,
        flags: MapFlags,
        offset: usize,
    ) -> Self {
        Self {
            id: AreaId::next(),
            start,
            end: start + npages,
            offset,
            prot,
            flags,
            object: None,
        }
    }

    pub fn id(&self) -> AreaId {
        self.id
    }

    pub fn start(&self) -> PageNumber {
        self.start
    }

    /// One past the last page.
    pub fn end(&self) -> PageNumber {
        self.end
    }

    pub fn pages(&self) -> Range<PageNumber> {
        self.start..self.end
    }

    pub fn npages(&self) -> usize {
        self.end - self.start
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn prot(&self) -> Protection {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn is_private(&self) -> bool {
        self.flags.contains(MapFlags::PRIVATE)
    }

    pub fn object(&self) -> Option<&ObjectRef> {
        self.object.as_ref()
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        page >= self.start && page < self.end
    }

    pub fn overlaps(&self, pages: &Range<PageNumber>) -> bool {
        self.start < pages.end && pages.start < self.end
    }

    /// Page number within the object that backs `page`.
    pub fn object_page(&self, page: PageNumber) -> usize {
        debug_assert!(self.contains(page), "{} not in {}", page, self.id);
        self.offset + (page - self.start)
    }

    /// Binds `object` to the area, taking over the caller's reference on it.
    ///
    /// Any previously bound object is unlinked and released.
    pub fn set_object(&mut self, object: ObjectRef) {
        object.bottom_object().link_area(self.id);
        if let Some(previous) = self.object.replace(object) {
            Self::release(self.id, previous);
        }
    }

    /// Swaps the bound object without touching references or linkage. The caller
    /// guarantees the new object has the same bottom.
    pub(crate) fn swap_object(&mut self, object: ObjectRef) -> Option<ObjectRef> {
        self.object.replace(object)
    }

    pub(crate) fn set_end(&mut self, end: PageNumber) {
        debug_assert!(end > self.start && end < self.end);
        self.end = end;
    }

    /// Drops the first `npages` pages, keeping the rest mapped at the same object
    /// offsets.
    pub(crate) fn trim_front(&mut self, npages: usize) {
        debug_assert!(npages < self.npages());
        self.start = self.start + npages;
        self.offset += npages;
    }

    fn release(id: AreaId, object: ObjectRef) {
        object.bottom_object().unlink_area(id);
        object.unref();
    }
}

impl Drop for VmArea {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            Self::release(self.id, object);
        }
    }
}

impl fmt::Debug for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmArea")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("offset", &self.offset)
            .field("prot", &self.prot)
            .field("flags", &self.flags)
            .field("object", &self.object.as_ref().map(|o| o.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemObject, config::USER_MEM_LOW, testing};

    #[test]
    fn protection_bits() {
        let rw = Protection::READ | Protection::WRITE;
        assert!(rw.contains(Protection::READ));
        assert!(!rw.contains(Protection::EXEC));
        assert!(rw.contains(Protection::NONE));
        assert_eq!(format!("{}", rw), "rw-");
        assert_eq!(Protection::from_bits(0xFF).bits(), 0b111);
    }

    #[test]
    fn sharing_is_exclusive() {
        assert!(MapFlags::SHARED.has_valid_sharing());
        assert!((MapFlags::PRIVATE | MapFlags::FIXED).has_valid_sharing());
        assert!(!(MapFlags::SHARED | MapFlags::PRIVATE).has_valid_sharing());
        assert!(!MapFlags::ANON.has_valid_sharing());
        assert_eq!(format!("{:?}", MapFlags::SHARED | MapFlags::ANON), "{SHARED, ANON}");
    }

    #[test]
    fn geometry() {
        let mut area = VmArea::new(USER_MEM_LOW + 4, 6, Protection::READ, MapFlags::SHARED, 2);
        assert_eq!(area.npages(), 6);
        assert!(area.contains(USER_MEM_LOW + 4));
        assert!(!area.contains(USER_MEM_LOW + 10));
        assert!(area.overlaps(&((USER_MEM_LOW + 9)..(USER_MEM_LOW + 12))));
        assert!(!area.overlaps(&((USER_MEM_LOW + 10)..(USER_MEM_LOW + 12))));
        assert_eq!(area.object_page(USER_MEM_LOW + 5), 3);

        area.trim_front(2);
        assert_eq!(area.start(), USER_MEM_LOW + 6);
        assert_eq!(area.object_page(USER_MEM_LOW + 6), 4);

        area.set_end(USER_MEM_LOW + 8);
        assert_eq!(area.npages(), 2);
    }

    #[test]
    fn binding_links_and_drop_releases() {
        let (cache, _) = testing::cache();
        let anon = MemObject::anonymous(cache);
        anon.add_ref();

        let mut area = VmArea::new(USER_MEM_LOW, 1, Protection::READ, MapFlags::PRIVATE, 0);
        area.set_object(MemObject::shadow(anon.clone()));
        assert_eq!(anon.linked_areas(), vec![area.id()]);
        assert_eq!(anon.refcount(), 2);

        drop(area);
        assert!(anon.linked_areas().is_empty());
        assert_eq!(anon.refcount(), 1);
    }

    #[test]
    fn rebinding_releases_previous() {
        let (cache, _) = testing::cache();
        let first = MemObject::anonymous(cache.clone());
        first.add_ref();
        let second = MemObject::anonymous(cache);

        let mut area = VmArea::new(USER_MEM_LOW, 1, Protection::READ, MapFlags::SHARED, 0);
        area.set_object(first.clone());
        area.set_object(second.clone());

        assert_eq!(first.refcount(), 1);
        assert!(first.linked_areas().is_empty());
        assert_eq!(second.linked_areas(), vec![area.id()]);
    }
}
