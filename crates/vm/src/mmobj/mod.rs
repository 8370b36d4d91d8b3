//! Memory objects: reference-counted providers of pages.
//!
//! An object's reference count has one unit per region (or shadow object) that uses
//! it plus one unit per page it has resident. When a release would leave only the
//! resident pages holding it up, nothing can reach the object any more: its pages are
//! cleaned and freed and, for a shadow object, the object below is released in turn.

mod anon;
mod backed;
mod shadow;

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    VmError,
    pframe::{PageCache, PageFrame, PageRef},
    vmarea::AreaId,
};

pub use backed::BackingStore;

/// Shared handle to a memory object.
///
/// The `Arc` keeps the memory alive; the object's own reference count decides when
/// it is torn down.
pub type ObjectRef = Arc<MemObject>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

static NEXT_OBJECT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Zero-filled memory.
    Anonymous,
    /// Copy-on-write layer over another object.
    Shadow,
    /// Pages read from and written back to a [`BackingStore`].
    Backed,
}

enum Variant {
    Anonymous,
    Shadow(ShadowLink),
    Backed(Box<dyn BackingStore>),
}

pub(crate) struct ShadowLink {
    /// Next object down the chain. Owns one reference; taken on destruction.
    shadowed: spin::Mutex<Option<ObjectRef>>,
    /// The non-shadow object at the base of the chain.
    bottom: ObjectRef,
}

impl ShadowLink {
    fn shadowed(&self) -> Option<ObjectRef> {
        self.shadowed.lock().clone()
    }
}

struct ObjectState {
    refcount: usize,
    resident: BTreeMap<usize, PageRef>,
    /// Regions whose chains end in this object.
    areas: Vec<AreaId>,
    dead: bool,
}

/// Anything that can supply the memory object behind a mapping.
pub trait ObjectSource {
    /// Returns the object to map, carrying one new reference for the caller.
    fn memory_object(&self, cache: &Arc<PageCache>) -> Result<ObjectRef, VmError>;

    /// Whether a shared writable mapping of this source is permitted.
    fn allows_shared_write(&self) -> bool {
        true
    }
}

/// Mapping an existing object shares it.
impl ObjectSource for ObjectRef {
    fn memory_object(&self, _cache: &Arc<PageCache>) -> Result<ObjectRef, VmError> {
        self.add_ref();
        Ok(self.clone())
    }
}

pub struct MemObject {
    id: ObjectId,
    variant: Variant,
    cache: Arc<PageCache>,
    state: spin::Mutex<ObjectState>,
}

impl MemObject {
    fn create(cache: Arc<PageCache>, variant: Variant) -> ObjectRef {
        let object = Arc::new(Self {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            variant,
            cache,
            state: spin::Mutex::new(ObjectState {
                refcount: 1,
                resident: BTreeMap::new(),
                areas: Vec::new(),
                dead: false,
            }),
        });
        log::debug!("mmobj: created {} ({:?})", object.id, object.kind());
        object
    }

    /// A zero-fill object with one reference.
    pub fn anonymous(cache: Arc<PageCache>) -> ObjectRef {
        Self::create(cache, Variant::Anonymous)
    }

    /// A copy-on-write layer over `shadowed` with one reference.
    ///
    /// The caller's reference on `shadowed` passes to the new object.
    pub fn shadow(shadowed: ObjectRef) -> ObjectRef {
        let bottom = shadowed.bottom_object();
        Self::create(
            shadowed.cache.clone(),
            Variant::Shadow(ShadowLink {
                shadowed: spin::Mutex::new(Some(shadowed)),
                bottom,
            }),
        )
    }

    /// An object whose pages come from `store`, with one reference.
    pub fn backed(cache: Arc<PageCache>, store: Box<dyn BackingStore>) -> ObjectRef {
        Self::create(cache, Variant::Backed(store))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        match self.variant {
            Variant::Anonymous => ObjectKind::Anonymous,
            Variant::Shadow(_) => ObjectKind::Shadow,
            Variant::Backed(_) => ObjectKind::Backed,
        }
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    /// True once the object has been torn down.
    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    /// The object this one shadows, if it is a live shadow object.
    pub fn shadowed(&self) -> Option<ObjectRef> {
        match &self.variant {
            Variant::Shadow(link) => link.shadowed(),
            _ => None,
        }
    }

    /// The non-shadow object at the base of this object's chain.
    pub fn bottom_object(self: &Arc<Self>) -> ObjectRef {
        match &self.variant {
            Variant::Shadow(link) => link.bottom.clone(),
            _ => self.clone(),
        }
    }

    pub fn add_ref(&self) {
        let mut state = self.state.lock();
        assert!(!state.dead, "{} referenced after destruction", self.id);
        state.refcount += 1;
    }

    /// Drops one reference, tearing down every object in the chain that becomes
    /// unreachable. Collapses are processed in a loop, never recursively.
    pub fn unref(&self) {
        let mut next = self.release();
        while let Some(object) = next {
            next = object.release();
        }
    }

    /// Drops one reference. Returns the shadowed object if this one was destroyed,
    /// so the caller can release that too.
    fn release(&self) -> Option<ObjectRef> {
        {
            let mut state = self.state.lock();
            assert!(!state.dead, "{} released after destruction", self.id);
            assert!(
                state.refcount > state.resident.len(),
                "{} refcount {} below resident floor {}",
                self.id,
                state.refcount,
                state.resident.len()
            );
            if state.refcount > state.resident.len() + 1 {
                state.refcount -= 1;
                return None;
            }
            state.dead = true;
            state.refcount -= 1;
        }

        log::debug!("mmobj: destroying {} ({:?})", self.id, self.kind());
        self.release_pages();

        match &self.variant {
            Variant::Shadow(link) => link.shadowed.lock().take(),
            _ => None,
        }
    }

    /// Cleans and frees every resident page.
    fn release_pages(&self) {
        let pagenums: Vec<usize> = self.state.lock().resident.keys().copied().collect();
        for pagenum in pagenums {
            let Some(page) = self.cache.get_resident(self, pagenum) else {
                continue;
            };
            debug_assert!(!page.is_pinned(), "{} page {} pinned at teardown", self.id, pagenum);
            if page.is_dirty() {
                if let Err(err) = self.mark_clean(&page) {
                    log::error!("mmobj: {} lost page {}: {}", self.id, pagenum, err);
                }
            }
            drop(page);
            if let Some(removed) = self.remove_resident(pagenum) {
                self.cache.free(removed);
            }
        }
    }

    /// Finds page `pagenum`, filling it if needed.
    ///
    /// `for_write` only matters for shadow objects, where it forces a private copy.
    pub fn lookup_page(&self, pagenum: usize, for_write: bool) -> Result<PageRef, VmError> {
        match &self.variant {
            Variant::Anonymous | Variant::Backed(_) => self.cache.get(self, pagenum),
            Variant::Shadow(link) => shadow::lookup_page(self, link, pagenum, for_write),
        }
    }

    /// Fills a freshly allocated page with this object's contents.
    ///
    /// # Panics
    ///
    /// Panics if the page is not busy or is pinned.
    pub fn fill_page(&self, page: &PageFrame) -> Result<(), VmError> {
        assert!(page.is_busy(), "filling page {} that is not busy", page.pagenum());
        assert!(!page.is_pinned(), "filling pinned page {}", page.pagenum());
        match &self.variant {
            Variant::Anonymous => {
                anon::fill_page(page);
                Ok(())
            }
            Variant::Shadow(link) => shadow::fill_page(link, page),
            Variant::Backed(store) => backed::fill_page(store.as_ref(), page),
        }
    }

    pub fn mark_dirty(&self, page: &PageFrame) {
        page.set_dirty();
    }

    /// Writes a dirty page back to wherever its contents belong and clears its
    /// dirty bit.
    pub fn mark_clean(&self, page: &PageFrame) -> Result<(), VmError> {
        match &self.variant {
            Variant::Anonymous => {
                anon::clean_page(page);
                Ok(())
            }
            Variant::Shadow(_) => shadow::clean_page(self, page),
            Variant::Backed(store) => backed::clean_page(store.as_ref(), page),
        }
    }

    /// Records that `area`'s chain ends in this object.
    pub fn link_area(&self, area: AreaId) {
        let mut state = self.state.lock();
        debug_assert!(!state.areas.contains(&area), "{} linked twice to {}", area, self.id);
        state.areas.push(area);
    }

    pub fn unlink_area(&self, area: AreaId) {
        self.state.lock().areas.retain(|linked| *linked != area);
    }

    /// Regions whose chains end in this object.
    pub fn linked_areas(&self) -> Vec<AreaId> {
        self.state.lock().areas.clone()
    }

    pub(crate) fn resident(&self, pagenum: usize) -> Option<PageRef> {
        self.state.lock().resident.get(&pagenum).cloned()
    }

    /// Makes `page` resident. Returns false if another page got there first.
    pub(crate) fn insert_resident(&self, page: PageRef) -> bool {
        let mut state = self.state.lock();
        assert!(!state.dead, "{} gained a page after destruction", self.id);
        if state.resident.contains_key(&page.pagenum()) {
            return false;
        }
        state.resident.insert(page.pagenum(), page);
        state.refcount += 1;
        true
    }

    pub(crate) fn remove_resident(&self, pagenum: usize) -> Option<PageRef> {
        let mut state = self.state.lock();
        let page = state.resident.remove(&pagenum)?;
        state.refcount -= 1;
        Some(page)
    }
}

impl fmt::Debug for MemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemObject")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("refcount", &state.refcount)
            .field("resident", &state.resident.len())
            .field("dead", &state.dead)
            .finish()
    }
}
