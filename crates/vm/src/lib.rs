#![cfg_attr(not(test), no_std)]

//! # Virtual memory
//!
//! The machine-independent half of the virtual memory system:
//!
//! - [`VmMap`]: a process's ordered set of [`VmArea`]s, each bound to a memory object.
//! - [`MemObject`]: reference-counted page providers. Anonymous objects zero-fill,
//!   shadow objects implement copy-on-write over another object, backed objects read
//!   through a [`BackingStore`].
//! - [`PageCache`]: physical pages keyed by (object, page number).
//! - [`handle_pagefault`]: resolves a user fault and installs the translation.
//! - [`do_mmap`] / [`do_munmap`]: validated entry points for mapping requests.
//!
//! Page tables and TLB maintenance live in the `paging` crate; waiting on a page
//! that is being filled sleeps on a `sched` wait queue.

extern crate alloc;

pub mod config;
mod error;
mod fault;
mod mmap;
mod mmobj;
mod pframe;
mod vmarea;
mod vmmap;

pub use error::VmError;
pub use fault::{EFAULT, FaultCause, FaultOutcome, FaultingProcess, handle_pagefault};
pub use mmap::{do_mmap, do_munmap};
pub use mmobj::{BackingStore, MemObject, ObjectId, ObjectKind, ObjectRef, ObjectSource};
pub use pframe::{PageCache, PageFrame, PageRef};
pub use vmarea::{AreaId, MapFlags, Protection, VmArea};
pub use vmmap::{MapDirection, VmMap};
