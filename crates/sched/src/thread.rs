//! Kernel threads as seen by the blocking primitives.

use alloc::sync::Arc;
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use crate::queue::WaitQueue;

/// Shared handle to a thread.
pub type ThreadRef = Arc<KThread>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kt{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Runnable or running.
    Running = 0,
    /// Asleep on a wait queue; only a wakeup ends the sleep.
    Sleeping = 1,
    /// Asleep on a wait queue; a wakeup or a cancellation ends the sleep.
    SleepingCancellable = 2,
}

impl ThreadState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Sleeping,
            _ => Self::SleepingCancellable,
        }
    }
}

pub struct KThread {
    id: ThreadId,
    state: AtomicU8,
    cancelled: AtomicBool,
    /// Queue the thread is sleeping on, if any.
    wchan: spin::Mutex<Option<WaitQueue>>,
}

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

impl KThread {
    pub fn new() -> ThreadRef {
        Arc::new(Self {
            id: ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(ThreadState::Running as u8),
            cancelled: AtomicBool::new(false),
            wchan: spin::Mutex::new(None),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn wchan(&self) -> spin::MutexGuard<'_, Option<WaitQueue>> {
        self.wchan.lock()
    }

    /// Blocks the calling thread until it is made runnable again.
    ///
    /// This is the context-switch point: on the host the OS thread yields, in the
    /// kernel the CPU relaxes until the wakeup lands.
    pub fn suspend(&self) {
        while self.state() != ThreadState::Running {
            #[cfg(test)]
            std::thread::yield_now();
            #[cfg(not(test))]
            core::hint::spin_loop();
        }
        self.wchan.lock().take();
    }

    /// Marks the thread cancelled. A thread in a cancellable sleep is pulled off its
    /// queue and made runnable; any other sleep runs to completion.
    pub fn cancel(&self) {
        let wchan = self.wchan.lock();
        self.cancelled.store(true, Ordering::Release);
        log::debug!("sched: cancelling {}", self.id);

        if self.state() == ThreadState::SleepingCancellable {
            if let Some(queue) = wchan.as_ref() {
                if queue.remove(self) {
                    self.set_state(ThreadState::Running);
                }
            }
        }
    }
}

impl fmt::Debug for KThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KThread")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_threads_are_running_and_distinct() {
        let a = KThread::new();
        let b = KThread::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ThreadState::Running);
        assert!(!a.is_cancelled());
    }

    #[test]
    fn cancel_running_thread_only_sets_flag() {
        let t = KThread::new();
        t.cancel();
        assert!(t.is_cancelled());
        assert_eq!(t.state(), ThreadState::Running);
    }

    #[test]
    fn suspend_returns_immediately_when_running() {
        let t = KThread::new();
        t.suspend();
        assert_eq!(t.state(), ThreadState::Running);
    }
}
