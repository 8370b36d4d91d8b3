//! Physical frame allocation interface.

use crate::PhysicalAddress;

#[cfg(any(test, feature = "software-emulation"))]
use crate::{AddressTranslator, arch::PAGE_SIZE};
#[cfg(any(test, feature = "software-emulation"))]
use alloc::vec::Vec;

/// Source of page-sized, page-aligned physical frames.
///
/// Frames come back uninitialized; callers zero or fill them.
pub trait FrameAllocator {
    /// Returns a free frame, or `None` when physical memory is exhausted.
    fn allocate_frame(&self) -> Option<PhysicalAddress>;

    /// Returns `frame` to the pool.
    fn free_frame(&self, frame: PhysicalAddress);
}

/// Frame allocator over emulated physical memory.
///
/// Fresh frames are carved from the thread's emulated memory; freed frames are
/// recycled first. An optional limit caps the number of frames outstanding.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedFrames {
    state: spin::Mutex<EmulatedFramesState>,
}

#[cfg(any(test, feature = "software-emulation"))]
struct EmulatedFramesState {
    free: Vec<PhysicalAddress>,
    outstanding: usize,
    limit: Option<usize>,
}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedFrames {
    pub fn new() -> Self {
        Self {
            state: spin::Mutex::new(EmulatedFramesState {
                free: Vec::new(),
                outstanding: 0,
                limit: None,
            }),
        }
    }

    /// Allocator that refuses to hand out more than `limit` frames at once.
    pub fn with_limit(limit: usize) -> Self {
        let frames = Self::new();
        frames.state.lock().limit = Some(limit);
        frames
    }

    /// Frames currently allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Default for EmulatedFrames {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl FrameAllocator for EmulatedFrames {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        let mut state = self.state.lock();
        if state.limit.is_some_and(|limit| state.outstanding >= limit) {
            log::debug!("emulated frames: limit of {} reached", state.outstanding);
            return None;
        }

        let frame = match state.free.pop() {
            Some(frame) => frame,
            None => PhysicalAddress::new(AddressTranslator::current().allocate(PAGE_SIZE, PAGE_SIZE)?),
        };
        state.outstanding += 1;
        Some(frame)
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        let mut state = self.state.lock();
        debug_assert!(!state.free.contains(&frame), "double free of frame {}", frame);
        state.outstanding -= 1;
        state.free.push(frame);
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

    #[test]
    fn frames_are_page_aligned_and_distinct() {
        setup();
        let frames = EmulatedFrames::new();
        let a = frames.allocate_frame().unwrap();
        let b = frames.allocate_frame().unwrap();
        assert!(a.is_page_aligned());
        assert!(b.is_page_aligned());
        assert_ne!(a, b);
        assert_eq!(frames.outstanding(), 2);
    }

    #[test]
    fn freed_frames_are_reused() {
        setup();
        let frames = EmulatedFrames::new();
        let a = frames.allocate_frame().unwrap();
        frames.free_frame(a);
        assert_eq!(frames.outstanding(), 0);
        assert_eq!(frames.allocate_frame(), Some(a));
    }

    #[test]
    fn limit_is_enforced() {
        setup();
        let frames = EmulatedFrames::with_limit(1);
        let a = frames.allocate_frame().unwrap();
        assert_eq!(frames.allocate_frame(), None);
        frames.free_frame(a);
        assert!(frames.allocate_frame().is_some());
    }
}
