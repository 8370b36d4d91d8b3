//! Virtual page numbers.

use core::{
    fmt,
    iter::Step,
    ops::{Add, Sub},
};

use crate::{address::VirtualAddress, arch};

/// A virtual page number: a virtual address divided by [`arch::PAGE_SIZE`].
///
/// Page ranges are half-open `[start, end)` and iterate with `start..end`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNumber(usize);

impl PageNumber {
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Raw address of the first byte of the page.
    ///
    /// Unlike [`PageNumber::start`] this never panics, so it is usable for the
    /// exclusive end of a range that touches the top of the user window.
    #[inline]
    pub const fn address(self) -> usize {
        self.0 * arch::PAGE_SIZE
    }

    /// Virtual address of the first byte of the page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.address())
    }

    /// Page containing the raw address `addr`.
    #[inline]
    pub const fn containing(addr: usize) -> Self {
        Self(addr / arch::PAGE_SIZE)
    }
}

/// Number of pages needed to hold `len` bytes.
#[inline]
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(arch::PAGE_SIZE)
}

impl fmt::Debug for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageNumber({:#x})", self.0)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::containing(addr.as_usize())
    }
}

impl Add<usize> for PageNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for PageNumber {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<PageNumber> for PageNumber {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: PageNumber) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Step for PageNumber {
    fn steps_between(start: &Self, end: &Self) -> (usize, Option<usize>) {
        if start <= end {
            let diff = end.0 - start.0;
            (diff, Some(diff))
        } else {
            (0, None)
        }
    }

    fn forward_checked(start: Self, count: usize) -> Option<Self> {
        start.0.checked_add(count).map(Self)
    }

    fn backward_checked(start: Self, count: usize) -> Option<Self> {
        start.0.checked_sub(count).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_of_page() {
        assert_eq!(PageNumber::new(1).start().as_usize(), arch::PAGE_SIZE);
    }

    #[test]
    fn containing_rounds_down() {
        let addr = VirtualAddress::new(arch::PAGE_SIZE * 3 + 10);
        assert_eq!(PageNumber::from(addr), PageNumber::new(3));
    }

    #[test]
    fn end_of_user_window_has_raw_address() {
        let top = PageNumber::containing(arch::USER_SPACE_END);
        assert_eq!(top.address(), arch::USER_SPACE_END);
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(arch::PAGE_SIZE), 1);
        assert_eq!(pages_for(arch::PAGE_SIZE + 1), 2);
    }

    #[test]
    fn arithmetic_and_ordering() {
        let page = PageNumber::new(10);
        assert_eq!(page + 5, PageNumber::new(15));
        assert_eq!(page - 3, PageNumber::new(7));
        assert_eq!(page - PageNumber::new(3), 7);
        assert!(PageNumber::new(5) < page);
    }

    #[test]
    fn ranges_iterate() {
        let pages: Vec<_> = (PageNumber::new(2)..PageNumber::new(5)).collect();
        assert_eq!(
            pages,
            vec![PageNumber::new(2), PageNumber::new(3), PageNumber::new(4)]
        );
    }
}
