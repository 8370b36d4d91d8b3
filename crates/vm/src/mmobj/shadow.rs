//! Shadow objects: private copy-on-write layers.
//!
//! A shadow object holds only the pages written through it. Reads fall through to
//! the first object down the chain that has the page resident, and finally to the
//! bottom object. All chain walks are loops so arbitrarily long chains cannot
//! exhaust the kernel stack.

use crate::{
    VmError,
    mmobj::{MemObject, ObjectKind, ObjectRef, ShadowLink},
    pframe::{PageFrame, PageRef},
};

/// Walks down from `start` through shadow objects only, returning the first
/// resident copy of `pagenum`.
fn first_resident(start: Option<ObjectRef>, pagenum: usize) -> Option<PageRef> {
    let mut current = start;
    while let Some(object) = current {
        if object.kind() != ObjectKind::Shadow {
            break;
        }
        if let Some(page) = object.cache().get_resident(&object, pagenum) {
            #[cfg(feature = "detailed-logging")]
            log::trace!("shadow: page {} found in {}", pagenum, object.id());
            return Some(page);
        }
        #[cfg(feature = "detailed-logging")]
        log::trace!("shadow: page {} not in {}", pagenum, object.id());
        current = object.shadowed();
    }
    None
}

pub(super) fn lookup_page(
    object: &MemObject,
    link: &ShadowLink,
    pagenum: usize,
    for_write: bool,
) -> Result<PageRef, VmError> {
    let cache = object.cache();

    if let Some(page) = cache.get_resident(object, pagenum) {
        return Ok(page);
    }

    if for_write {
        // Copy up into this object; `fill_page` pulls the current contents.
        let page = cache.get(object, pagenum)?;
        object.mark_dirty(&page);
        return Ok(page);
    }
    if let Some(page) = first_resident(link.shadowed(), pagenum) {
        return Ok(page);
    }
    log::trace!("shadow: page {} from bottom {}", pagenum, link.bottom.id());
    link.bottom.lookup_page(pagenum, false)
}

pub(super) fn fill_page(link: &ShadowLink, page: &PageFrame) -> Result<(), VmError> {
    let source = match first_resident(link.shadowed(), page.pagenum()) {
        Some(source) => source,
        None => link.bottom.lookup_page(page.pagenum(), false)?,
    };

    page.pin();
    page.copy_from(&source);
    page.unpin();
    Ok(())
}

/// Re-resolves the page for writing in `object` and makes it hold `page`'s contents.
pub(super) fn clean_page(object: &MemObject, page: &PageFrame) -> Result<(), VmError> {
    let target = object.lookup_page(page.pagenum(), true)?;
    target.copy_from(page);
    target.clear_dirty();
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::testing;

    fn read_byte(page: &PageFrame, offset: usize) -> u8 {
        let mut buf = [0u8; 1];
        page.read(offset, &mut buf);
        buf[0]
    }

    #[test]
    fn read_falls_through_to_bottom() {
        let (cache, _) = testing::cache();
        let anon = MemObject::anonymous(cache);
        anon.lookup_page(2, false).unwrap().write(0, &[42]);

        let shadow = MemObject::shadow(anon.clone());
        let page = shadow.lookup_page(2, false).unwrap();

        assert_eq!(page.object(), anon.id());
        assert_eq!(read_byte(&page, 0), 42);
        assert_eq!(shadow.resident_count(), 0);
    }

    #[test]
    fn read_of_untouched_page_fills_bottom() {
        let (cache, _) = testing::cache();
        let anon = MemObject::anonymous(cache);
        let shadow = MemObject::shadow(anon.clone());

        let page = shadow.lookup_page(5, false).unwrap();
        assert_eq!(page.object(), anon.id());
        assert_eq!(anon.resident_count(), 1);
    }

    #[test]
    fn write_copies_up_and_leaves_original_alone() {
        let (cache, _) = testing::cache();
        let anon = MemObject::anonymous(cache);
        anon.lookup_page(0, false).unwrap().write(0, &[7]);

        let shadow = MemObject::shadow(anon.clone());
        let copy = shadow.lookup_page(0, true).unwrap();
        assert_eq!(copy.object(), shadow.id());
        assert!(copy.is_dirty());
        assert_eq!(read_byte(&copy, 0), 7);

        copy.write(0, &[8]);
        assert_eq!(read_byte(&anon.lookup_page(0, false).unwrap(), 0), 7);
        assert_eq!(read_byte(&shadow.lookup_page(0, false).unwrap(), 0), 8);
    }

    #[test]
    fn write_lookup_of_resident_copy_leaves_dirty_bit() {
        let (cache, frames) = testing::cache();
        let anon = MemObject::anonymous(cache);
        let shadow = MemObject::shadow(anon.clone());

        let copy = shadow.lookup_page(0, true).unwrap();
        copy.clear_dirty();
        let outstanding = frames.outstanding();

        let again = shadow.lookup_page(0, true).unwrap();
        assert!(Arc::ptr_eq(&copy, &again));
        assert!(!again.is_dirty());
        assert_eq!(frames.outstanding(), outstanding);
    }

    #[test]
    fn nearest_copy_wins() {
        let (cache, _) = testing::cache();
        let anon = MemObject::anonymous(cache);
        anon.lookup_page(0, false).unwrap().write(0, &[1]);

        let middle = MemObject::shadow(anon.clone());
        middle.lookup_page(0, true).unwrap().write(0, &[2]);

        let top = MemObject::shadow(middle.clone());
        let seen = top.lookup_page(0, false).unwrap();
        assert_eq!(seen.object(), middle.id());

        let copy = top.lookup_page(0, true).unwrap();
        assert_eq!(read_byte(&copy, 0), 2);
    }

    #[test]
    fn sibling_shadows_are_isolated() {
        let (cache, _) = testing::cache();
        let anon = MemObject::anonymous(cache);
        anon.add_ref();
        let left = MemObject::shadow(anon.clone());
        let right = MemObject::shadow(anon.clone());

        left.lookup_page(0, true).unwrap().write(0, &[3]);
        right.lookup_page(0, true).unwrap().write(0, &[4]);

        assert_eq!(read_byte(&left.lookup_page(0, false).unwrap(), 0), 3);
        assert_eq!(read_byte(&right.lookup_page(0, false).unwrap(), 0), 4);
        assert_eq!(read_byte(&anon.lookup_page(0, false).unwrap(), 0), 0);
    }

    #[test]
    fn clean_keeps_contents_and_clears_dirty() {
        let (cache, _) = testing::cache();
        let anon = MemObject::anonymous(cache);
        let shadow = MemObject::shadow(anon.clone());

        let page = shadow.lookup_page(0, true).unwrap();
        page.write(0, &[5]);
        shadow.mark_clean(&page).unwrap();

        let again = shadow.lookup_page(0, false).unwrap();
        assert!(Arc::ptr_eq(&page, &again));
        assert!(!again.is_dirty());
        assert_eq!(read_byte(&again, 0), 5);
    }

    #[test]
    fn destroying_shadow_releases_shadowed() {
        let (cache, frames) = testing::cache();
        let anon = MemObject::anonymous(cache);
        anon.add_ref();
        let shadow = MemObject::shadow(anon.clone());
        shadow.lookup_page(0, true).unwrap();
        assert_eq!(anon.refcount(), 3);

        shadow.unref();
        assert!(shadow.is_dead());
        assert!(shadow.shadowed().is_none());
        assert_eq!(anon.refcount(), 2);
        assert!(!anon.is_dead());
        assert_eq!(frames.outstanding(), 1);
    }
}
