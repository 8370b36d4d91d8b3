#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(allocator_api)]
#![feature(step_trait)]

//! # Paging
//!
//! Hardware-facing half of the virtual memory system:
//!
//! - Physical and virtual address newtypes and page numbers.
//! - Page table walking, mapping and unmapping ([`PageDirectory`]).
//! - TLB invalidation ([`Tlb`]) and the [`AddressSpace`] that ties the two together.
//! - The [`FrameAllocator`] interface for physical frames.
//!
//! Building with the `software-emulation` feature swaps the x86_64 backend for a
//! scale model with 16-byte pages backed by host memory, so everything above can
//! run in ordinary unit tests.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod frames;
mod numbers;
mod page_directory;
mod tlb;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use frames::FrameAllocator;
pub use numbers::{PageNumber, pages_for};
pub use page_directory::{MapError, PageDirectory};
pub use tlb::{Tlb, TlbFlush};

pub use arch::{PAGE_SIZE, PageFlags, USER_SPACE_END, USER_SPACE_START};

#[cfg(any(test, feature = "software-emulation"))]
pub use frames::EmulatedFrames;
