#![cfg_attr(not(test), no_std)]

//! # Scheduler primitives
//!
//! The blocking side of the kernel scheduler:
//!
//! - [`KThread`]: a schedulable thread with a run state and a cancellation flag.
//! - [`WaitQueue`]: FIFO sleep queues with wake-one, wake-all and cancellable sleeps.
//! - [`KMutex`]: a sleeping lock that hands ownership straight to the next waiter.
//!
//! Sleeping threads relax in [`KThread::suspend`] until another thread makes them
//! runnable again. All of this is thread-context only; none of it may be used from
//! an interrupt handler.

extern crate alloc;

mod mutex;
mod queue;
mod thread;

pub use mutex::KMutex;
pub use queue::WaitQueue;
pub use thread::{KThread, ThreadId, ThreadRef, ThreadState};

/// The sleeping thread was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl core::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("interrupted by cancellation")
    }
}
