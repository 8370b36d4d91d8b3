//! Compile-time layout of user address spaces.

use paging::{PAGE_SIZE, PageNumber, USER_SPACE_END, USER_SPACE_START};

use crate::vmmap::MapDirection;

/// First page available to user mappings.
pub const USER_MEM_LOW: PageNumber = PageNumber::containing(USER_SPACE_START);

/// One past the last page available to user mappings.
pub const USER_MEM_HIGH: PageNumber = PageNumber::containing(USER_SPACE_END);

/// Size of the user window in bytes.
pub const USER_MEM_SIZE: usize = USER_SPACE_END - USER_SPACE_START;

/// Pages in the user window.
pub const USER_PAGES: usize = USER_MEM_SIZE / PAGE_SIZE;

/// Placement used by `mmap` when no address is fixed.
pub const MMAP_DIRECTION: MapDirection = MapDirection::HighToLow;

/// True if `[start, start + npages)` lies inside the user window.
#[inline]
pub fn in_user_range(start: PageNumber, npages: usize) -> bool {
    start >= USER_MEM_LOW
        && npages <= USER_PAGES
        && start.as_usize() + npages <= USER_MEM_HIGH.as_usize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_page_aligned() {
        assert_eq!(USER_MEM_LOW.address(), USER_SPACE_START);
        assert_eq!(USER_MEM_HIGH.address(), USER_SPACE_END);
        assert_eq!(USER_MEM_HIGH - USER_MEM_LOW, USER_PAGES);
    }

    #[test]
    fn range_checks() {
        assert!(in_user_range(USER_MEM_LOW, USER_PAGES));
        assert!(!in_user_range(USER_MEM_LOW - 1, 1));
        assert!(!in_user_range(USER_MEM_HIGH - 1, 2));
        assert!(in_user_range(USER_MEM_HIGH - 1, 1));
    }
}
