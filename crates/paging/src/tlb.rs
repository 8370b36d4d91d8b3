//! TLB shootdown for a single CPU.

use core::ops::Range;

use crate::{PageNumber, VirtualAddress, arch};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::vec::Vec;

/// Ranges longer than this flush the whole TLB instead of page by page.
const RANGE_FLUSH_LIMIT: usize = 32;

/// One recorded invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlbFlush {
    Page(VirtualAddress),
    Range(Range<PageNumber>),
    All,
}

/// Invalidates stale translations after page tables change.
///
/// Under software emulation there is no TLB; every request is recorded so callers
/// can check which translations would have been dropped.
#[derive(Default)]
pub struct Tlb {
    #[cfg(any(test, feature = "software-emulation"))]
    history: spin::Mutex<Vec<TlbFlush>>,
}

impl Tlb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the translation for the page containing `addr`.
    pub fn invalidate(&self, addr: VirtualAddress) {
        log::trace!("tlb: invalidate {}", addr);
        arch::flush_page(addr.as_usize());
        self.record(TlbFlush::Page(addr.align_down(arch::PAGE_SIZE)));
    }

    /// Drops the translations for every page in `pages`.
    pub fn invalidate_range(&self, pages: Range<PageNumber>) {
        if pages.is_empty() {
            return;
        }
        log::trace!("tlb: invalidate pages [{}, {})", pages.start, pages.end);

        if pages.end - pages.start > RANGE_FLUSH_LIMIT {
            arch::flush_all();
        } else {
            for page in pages.clone() {
                arch::flush_page(page.address());
            }
        }
        self.record(TlbFlush::Range(pages));
    }

    /// Drops every non-global translation.
    pub fn invalidate_all(&self) {
        log::trace!("tlb: invalidate all");
        arch::flush_all();
        self.record(TlbFlush::All);
    }

    /// Takes the invalidations recorded since the last call.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn take_history(&self) -> Vec<TlbFlush> {
        core::mem::take(&mut *self.history.lock())
    }

    #[inline]
    fn record(&self, _flush: TlbFlush) {
        #[cfg(any(test, feature = "software-emulation"))]
        self.history.lock().push(_flush);
    }
}
