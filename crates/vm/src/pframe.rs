//! Physical page frames and the page cache that hands them out.
//!
//! Every resident page belongs to exactly one memory object and is keyed by that
//! object's id and the page's number within the object. The frame's memory goes back
//! to the [`FrameAllocator`] when the last reference to the page is dropped.

use alloc::sync::Arc;
use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use paging::{FrameAllocator, PAGE_SIZE, PhysicalAddress};
use sched::{KThread, WaitQueue};

use crate::{
    VmError,
    mmobj::{MemObject, ObjectId},
};

/// Shared handle to a resident page.
pub type PageRef = Arc<PageFrame>;

/// Shared frame allocator.
pub type Frames = Arc<dyn FrameAllocator + Send + Sync>;

const DIRTY: u32 = 1 << 0;
const BUSY: u32 = 1 << 1;

/// One page of physical memory cached on behalf of a memory object.
pub struct PageFrame {
    object: ObjectId,
    pagenum: usize,
    address: PhysicalAddress,
    flags: AtomicU32,
    pins: AtomicUsize,
    /// Threads waiting for the fill to finish.
    fillers: WaitQueue,
    frames: Frames,
}

impl PageFrame {
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Page number within the owning object.
    pub fn pagenum(&self) -> usize {
        self.pagenum
    }

    /// Physical address of the frame.
    pub fn address(&self) -> PhysicalAddress {
        self.address
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.load(Ordering::Acquire) & DIRTY != 0
    }

    pub fn set_dirty(&self) {
        self.flags.fetch_or(DIRTY, Ordering::AcqRel);
    }

    pub fn clear_dirty(&self) {
        self.flags.fetch_and(!DIRTY, Ordering::AcqRel);
    }

    /// A busy page is still being filled and its contents are not yet valid.
    pub fn is_busy(&self) -> bool {
        self.flags.load(Ordering::Acquire) & BUSY != 0
    }

    /// Publishes the page and wakes everyone waiting on the fill.
    fn finish_fill(&self) {
        self.flags.fetch_and(!BUSY, Ordering::AcqRel);
        let woken = self.fillers.broadcast_on();
        if woken > 0 {
            log::trace!("pframe: {}:{} filled, woke {}", self.object, self.pagenum, woken);
        }
    }

    /// Sleeps until the fill in progress has finished.
    pub fn wait_while_busy(&self) {
        if !self.is_busy() {
            return;
        }
        // No notion of the current thread down here; sleep under a fresh identity.
        let waiter = KThread::new();
        self.fillers.sleep_while(&waiter, || self.is_busy());
    }

    /// Threads asleep waiting for this page to be filled.
    pub fn fill_waiters(&self) -> usize {
        self.fillers.len()
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// # Panics
    ///
    /// Panics if the page is not pinned.
    pub fn unpin(&self) {
        let unpinned = self
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pins| pins.checked_sub(1));
        assert!(unpinned.is_ok(), "unpinning page {} that is not pinned", self.pagenum);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    fn as_ptr(&self) -> *mut u8 {
        self.address.as_mut_ptr()
    }

    /// Copies `buf.len()` bytes starting at `offset` out of the page.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "read past end of page");
        // SAFETY: The frame is PAGE_SIZE bytes of memory owned by this page.
        unsafe {
            core::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
        };
    }

    /// Copies `data` into the page starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE, "write past end of page");
        // SAFETY: As in `read`.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len())
        };
    }

    /// Replaces the whole page with the contents of `other`.
    pub fn copy_from(&self, other: &PageFrame) {
        if core::ptr::eq(self, other) {
            return;
        }
        // SAFETY: Distinct frames never overlap.
        unsafe { core::ptr::copy_nonoverlapping(other.as_ptr(), self.as_ptr(), PAGE_SIZE) };
    }

    pub fn zero(&self) {
        // SAFETY: As in `read`.
        unsafe { core::ptr::write_bytes(self.as_ptr(), 0, PAGE_SIZE) };
    }
}

impl Drop for PageFrame {
    fn drop(&mut self) {
        debug_assert!(!self.is_pinned(), "dropping pinned page {}", self.pagenum);
        self.frames.free_frame(self.address);
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("object", &self.object)
            .field("pagenum", &self.pagenum)
            .field("address", &self.address)
            .field("dirty", &self.is_dirty())
            .field("busy", &self.is_busy())
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .finish()
    }
}

/// Allocates frames for memory objects and tracks which pages are resident.
///
/// Residency itself is recorded in each object; the cache supplies the
/// allocate-or-fetch protocol and owns the frame source.
pub struct PageCache {
    frames: Frames,
}

impl PageCache {
    pub fn new(frames: Frames) -> Self {
        Self { frames }
    }

    /// Looks `pagenum` up through `object`'s own lookup rules.
    pub fn lookup(
        &self,
        object: &MemObject,
        pagenum: usize,
        for_write: bool,
    ) -> Result<PageRef, VmError> {
        object.lookup_page(pagenum, for_write)
    }

    /// Returns `object`'s page `pagenum`, allocating and filling it if necessary.
    ///
    /// A newly allocated page is made resident while busy, filled through
    /// [`MemObject::fill_page`] with no locks held, then published. If the fill fails
    /// the half-built page is removed again and the error returned.
    pub fn get(&self, object: &MemObject, pagenum: usize) -> Result<PageRef, VmError> {
        loop {
            if let Some(page) = self.get_resident(object, pagenum) {
                return Ok(page);
            }

            let address = self.frames.allocate_frame().ok_or_else(|| {
                log::error!("pframe: out of frames filling {}:{}", object.id(), pagenum);
                VmError::OutOfMemory
            })?;
            let page = Arc::new(PageFrame {
                object: object.id(),
                pagenum,
                address,
                flags: AtomicU32::new(BUSY),
                pins: AtomicUsize::new(0),
                fillers: WaitQueue::new(),
                frames: self.frames.clone(),
            });

            // Lost a race with another filler; use theirs.
            if !object.insert_resident(page.clone()) {
                continue;
            }

            log::trace!("pframe: filling {}:{} at {}", object.id(), pagenum, address);
            if let Err(err) = object.fill_page(&page) {
                object.remove_resident(pagenum);
                page.finish_fill();
                return Err(err);
            }
            page.finish_fill();
            return Ok(page);
        }
    }

    /// Returns `object`'s page `pagenum` if it is resident, without filling anything.
    ///
    /// Waits out a fill in progress; a page whose fill failed is reported absent.
    pub fn get_resident(&self, object: &MemObject, pagenum: usize) -> Option<PageRef> {
        let page = object.resident(pagenum)?;
        if page.is_busy() {
            page.wait_while_busy();
            return object.resident(pagenum).filter(|p| Arc::ptr_eq(p, &page));
        }
        Some(page)
    }

    /// Releases a page that has already been removed from its object.
    ///
    /// The frame itself returns to the allocator once the last handle is gone.
    pub fn free(&self, page: PageRef) {
        assert!(!page.is_pinned(), "freeing pinned page {}", page.pagenum());
        assert!(!page.is_busy(), "freeing busy page {}", page.pagenum());
        log::trace!("pframe: free {}:{}", page.object(), page.pagenum());
        drop(page);
    }
}
