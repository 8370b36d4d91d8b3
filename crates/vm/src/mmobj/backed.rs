//! Objects whose pages live in an external store, such as a file.

use paging::PAGE_SIZE;

use crate::{VmError, pframe::PageFrame};

/// Page-granular storage behind a backed object.
///
/// `buf` is always exactly one page long.
pub trait BackingStore: Send + Sync {
    fn read_page(&self, pagenum: usize, buf: &mut [u8]) -> Result<(), VmError>;
    fn write_page(&self, pagenum: usize, buf: &[u8]) -> Result<(), VmError>;
}

pub(super) fn fill_page(store: &dyn BackingStore, page: &PageFrame) -> Result<(), VmError> {
    let mut buf = [0u8; PAGE_SIZE];
    store.read_page(page.pagenum(), &mut buf)?;
    page.pin();
    page.write(0, &buf);
    page.unpin();
    Ok(())
}

pub(super) fn clean_page(store: &dyn BackingStore, page: &PageFrame) -> Result<(), VmError> {
    let mut buf = [0u8; PAGE_SIZE];
    page.pin();
    page.read(0, &mut buf);
    page.unpin();
    store.write_page(page.pagenum(), &buf)?;
    page.clear_dirty();
    Ok(())
}
