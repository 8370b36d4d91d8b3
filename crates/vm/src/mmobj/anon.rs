//! Anonymous objects: memory that starts out zeroed and has nowhere to be written
//! back to.

use crate::pframe::PageFrame;

pub(super) fn fill_page(page: &PageFrame) {
    page.pin();
    page.zero();
    page.unpin();
}

pub(super) fn clean_page(page: &PageFrame) {
    page.clear_dirty();
}
