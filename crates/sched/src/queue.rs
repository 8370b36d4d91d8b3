//! FIFO wait queues.

use alloc::{collections::VecDeque, sync::Arc};

use crate::{
    Cancelled,
    thread::{KThread, ThreadRef, ThreadState},
};

/// A queue of sleeping threads, woken in arrival order.
///
/// Cloning yields another handle to the same queue; a sleeping thread keeps one so
/// that cancellation can find it.
#[derive(Clone, Default)]
pub struct WaitQueue {
    threads: Arc<spin::Mutex<VecDeque<ThreadRef>>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Puts `thread` to sleep on this queue without yet suspending it.
    ///
    /// Fails if a cancellable sleep is requested by a thread that is already
    /// cancelled. Separating this from [`KThread::suspend`] lets callers drop their
    /// own locks between the two steps.
    pub fn enqueue(&self, thread: &ThreadRef, cancellable: bool) -> Result<(), Cancelled> {
        let mut wchan = thread.wchan();
        if cancellable && thread.is_cancelled() {
            return Err(Cancelled);
        }
        debug_assert!(wchan.is_none(), "{} already sleeping", thread.id());

        let mut threads = self.threads.lock();
        thread.set_state(if cancellable {
            ThreadState::SleepingCancellable
        } else {
            ThreadState::Sleeping
        });
        threads.push_back(thread.clone());
        *wchan = Some(self.clone());
        Ok(())
    }

    /// Sleeps until woken by [`WaitQueue::wakeup_on`] or [`WaitQueue::broadcast_on`].
    pub fn sleep_on(&self, thread: &ThreadRef) {
        // A non-cancellable enqueue cannot fail.
        let _ = self.enqueue(thread, false);
        thread.suspend();
    }

    /// Sleeps until woken or cancelled.
    ///
    /// Returns [`Cancelled`] straight away if `thread` is already cancelled, and after
    /// waking if it was cancelled meanwhile.
    pub fn cancellable_sleep_on(&self, thread: &ThreadRef) -> Result<(), Cancelled> {
        self.enqueue(thread, true)?;
        thread.suspend();
        if thread.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for as long as `condition` holds.
    ///
    /// The condition is checked with the queue locked, so a waker that clears it and
    /// then calls [`WaitQueue::broadcast_on`] cannot slip in between the check and the
    /// sleep. Spurious wakeups just re-check.
    pub fn sleep_while(&self, thread: &ThreadRef, mut condition: impl FnMut() -> bool) {
        loop {
            {
                let mut wchan = thread.wchan();
                let mut threads = self.threads.lock();
                if !condition() {
                    return;
                }
                debug_assert!(wchan.is_none(), "{} already sleeping", thread.id());
                thread.set_state(ThreadState::Sleeping);
                threads.push_back(thread.clone());
                *wchan = Some(self.clone());
            }
            thread.suspend();
        }
    }

    /// Makes the thread at the head of the queue runnable and returns it.
    pub fn wakeup_on(&self) -> Option<ThreadRef> {
        let mut threads = self.threads.lock();
        let thread = threads.pop_front()?;
        debug_assert!(
            thread.state() != ThreadState::Running,
            "{} on a wait queue while running",
            thread.id()
        );
        thread.set_state(ThreadState::Running);
        log::trace!("sched: woke {}", thread.id());
        Some(thread)
    }

    /// Makes every queued thread runnable. Returns how many were woken.
    pub fn broadcast_on(&self) -> usize {
        let mut threads = self.threads.lock();
        let woken = threads.len();
        for thread in threads.drain(..) {
            thread.set_state(ThreadState::Running);
        }
        log::trace!("sched: broadcast woke {} threads", woken);
        woken
    }

    /// Unlinks `thread` if it is still queued here.
    pub(crate) fn remove(&self, thread: &KThread) -> bool {
        let mut threads = self.threads.lock();
        match threads
            .iter()
            .position(|queued| core::ptr::eq(Arc::as_ptr(queued), thread))
        {
            Some(index) => {
                threads.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, thread, time::Duration};

    fn wait_for_len(queue: &WaitQueue, len: usize) {
        while queue.len() != len {
            thread::yield_now();
        }
    }

    #[test]
    fn wakeup_on_empty_queue() {
        let queue = WaitQueue::new();
        assert!(queue.wakeup_on().is_none());
        assert_eq!(queue.broadcast_on(), 0);
    }

    #[test]
    fn wakeups_are_fifo() {
        let queue = WaitQueue::new();
        let a = KThread::new();
        let b = KThread::new();
        queue.enqueue(&a, false).unwrap();
        queue.enqueue(&b, true).unwrap();
        assert_eq!(a.state(), ThreadState::Sleeping);
        assert_eq!(b.state(), ThreadState::SleepingCancellable);

        let first = queue.wakeup_on().unwrap();
        assert_eq!(first.id(), a.id());
        assert_eq!(a.state(), ThreadState::Running);
        assert_eq!(queue.wakeup_on().unwrap().id(), b.id());
        assert!(queue.is_empty());
    }

    #[test]
    fn sleeper_blocks_until_woken() {
        let queue = WaitQueue::new();
        let (tx, rx) = mpsc::channel();

        let sleeper = {
            let queue = queue.clone();
            thread::spawn(move || {
                let me = KThread::new();
                queue.sleep_on(&me);
                tx.send(me.id()).unwrap();
            })
        };

        wait_for_len(&queue, 1);
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

        let woken = queue.wakeup_on().unwrap();
        assert_eq!(rx.recv().unwrap(), woken.id());
        sleeper.join().unwrap();
    }

    #[test]
    fn broadcast_wakes_everyone() {
        let queue = WaitQueue::new();
        let sleepers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.sleep_on(&KThread::new()))
            })
            .collect();

        wait_for_len(&queue, 3);
        assert_eq!(queue.broadcast_on(), 3);
        for sleeper in sleepers {
            sleeper.join().unwrap();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn sleep_while_skips_false_condition() {
        let queue = WaitQueue::new();
        let me = KThread::new();
        queue.sleep_while(&me, || false);
        assert!(queue.is_empty());
        assert_eq!(me.state(), ThreadState::Running);
    }

    #[test]
    fn sleep_while_rechecks_after_wakeup() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        let queue = WaitQueue::new();
        let remaining = Arc::new(AtomicUsize::new(2));

        let sleeper = {
            let (queue, remaining) = (queue.clone(), remaining.clone());
            thread::spawn(move || {
                queue.sleep_while(&KThread::new(), || remaining.load(Ordering::Acquire) > 0)
            })
        };

        // A wakeup with the condition still true puts the sleeper back to sleep.
        wait_for_len(&queue, 1);
        remaining.fetch_sub(1, Ordering::AcqRel);
        assert_eq!(queue.broadcast_on(), 1);
        wait_for_len(&queue, 1);

        remaining.fetch_sub(1, Ordering::AcqRel);
        assert_eq!(queue.broadcast_on(), 1);
        sleeper.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_interrupts_cancellable_sleep() {
        let queue = WaitQueue::new();
        let me = KThread::new();

        let sleeper = {
            let queue = queue.clone();
            let me = me.clone();
            thread::spawn(move || queue.cancellable_sleep_on(&me))
        };

        wait_for_len(&queue, 1);
        me.cancel();
        assert_eq!(sleeper.join().unwrap(), Err(Cancelled));
        assert!(queue.is_empty());
    }

    #[test]
    fn cancelled_thread_does_not_sleep() {
        let queue = WaitQueue::new();
        let me = KThread::new();
        me.cancel();

        assert_eq!(queue.cancellable_sleep_on(&me), Err(Cancelled));
        assert!(queue.is_empty());
        assert_eq!(me.state(), ThreadState::Running);
    }

    #[test]
    fn cancel_leaves_uncancellable_sleep_alone() {
        let queue = WaitQueue::new();
        let me = KThread::new();
        queue.enqueue(&me, false).unwrap();

        me.cancel();
        assert_eq!(me.state(), ThreadState::Sleeping);
        assert_eq!(queue.len(), 1);

        queue.wakeup_on();
        assert_eq!(me.state(), ThreadState::Running);
    }
}
