//! Kernel mutex.

use alloc::sync::Arc;

use crate::{Cancelled, queue::WaitQueue, thread::ThreadRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    /// The lock was free and is now held.
    Held,
    /// The caller is asleep on the wait queue and must suspend.
    Queued,
}

/// A sleeping mutual-exclusion lock.
///
/// Contended lockers sleep on a FIFO queue. Unlocking with waiters present hands the
/// lock directly to the head waiter, so the mutex is never observed free in between
/// and waiters acquire it in arrival order.
///
/// Never lock or unlock from interrupt context.
#[derive(Default)]
pub struct KMutex {
    holder: spin::Mutex<Option<ThreadRef>>,
    waitq: WaitQueue,
}

impl KMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<ThreadRef> {
        self.holder.lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }

    /// Threads sleeping on the lock.
    pub fn waiters(&self) -> usize {
        self.waitq.len()
    }

    /// Acquires the lock for `thread`, sleeping while another thread holds it.
    ///
    /// # Panics
    ///
    /// Panics if `thread` already holds the lock.
    pub fn lock(&self, thread: &ThreadRef) {
        if let Ok(Acquire::Queued) = self.acquire_or_enqueue(thread, false) {
            thread.suspend();
            debug_assert!(self.is_held_by(thread), "woke without the lock");
        }
    }

    /// Like [`KMutex::lock`] but the sleep can be cancelled.
    ///
    /// A thread cancelled while waiting does not end up holding the lock: if it was
    /// handed over in the meantime it is released again before returning.
    pub fn lock_cancellable(&self, thread: &ThreadRef) -> Result<(), Cancelled> {
        if self.acquire_or_enqueue(thread, true)? == Acquire::Held {
            return Ok(());
        }
        thread.suspend();
        self.finish_cancellable_wait(thread)
    }

    /// Releases the lock, handing it to the longest waiter if there is one.
    ///
    /// # Panics
    ///
    /// Panics if `thread` does not hold the lock.
    pub fn unlock(&self, thread: &ThreadRef) {
        let mut holder = self.holder.lock();
        assert!(
            holder.as_ref().is_some_and(|h| Arc::ptr_eq(h, thread)),
            "{} unlocking a mutex it does not hold",
            thread.id()
        );

        *holder = self.waitq.wakeup_on();
        match holder.as_ref() {
            Some(next) => log::trace!("kmutex: {} hands off to {}", thread.id(), next.id()),
            None => log::trace!("kmutex: released by {}", thread.id()),
        }
    }

    /// Takes the lock if it is free, otherwise queues `thread` without suspending it.
    fn acquire_or_enqueue(
        &self,
        thread: &ThreadRef,
        cancellable: bool,
    ) -> Result<Acquire, Cancelled> {
        let mut holder = self.holder.lock();
        match holder.as_ref() {
            None => {
                *holder = Some(thread.clone());
                Ok(Acquire::Held)
            }
            Some(current) => {
                assert!(
                    !Arc::ptr_eq(current, thread),
                    "{} locking a mutex it already holds",
                    thread.id()
                );
                log::trace!("kmutex: {} waits on {}", thread.id(), current.id());
                self.waitq.enqueue(thread, cancellable)?;
                Ok(Acquire::Queued)
            }
        }
    }

    /// Settles a cancellable wait once `thread` is runnable again. A cancelled thread
    /// gives back a lock that was handed to it while it slept.
    fn finish_cancellable_wait(&self, thread: &ThreadRef) -> Result<(), Cancelled> {
        if !thread.is_cancelled() {
            return Ok(());
        }
        if self.is_held_by(thread) {
            log::trace!("kmutex: cancelled {} returns the lock", thread.id());
            self.unlock(thread);
        }
        Err(Cancelled)
    }

    fn is_held_by(&self, thread: &ThreadRef) -> bool {
        self.holder
            .lock()
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(h, thread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KThread;
    use std::{
        sync::{Mutex, mpsc},
        thread,
    };

    fn wait_for_waiters(mutex: &KMutex, count: usize) {
        while mutex.waiters() != count {
            thread::yield_now();
        }
    }

    #[test]
    fn uncontended_lock_and_unlock() {
        let mutex = KMutex::new();
        let a = KThread::new();

        mutex.lock(&a);
        assert!(Arc::ptr_eq(&mutex.holder().unwrap(), &a));
        mutex.unlock(&a);
        assert!(!mutex.is_locked());
    }

    #[test]
    #[should_panic(expected = "locking a mutex it already holds")]
    fn relock_panics() {
        let mutex = KMutex::new();
        let a = KThread::new();
        mutex.lock(&a);
        mutex.lock(&a);
    }

    #[test]
    #[should_panic(expected = "unlocking a mutex it does not hold")]
    fn unlock_by_stranger_panics() {
        let mutex = KMutex::new();
        let a = KThread::new();
        let b = KThread::new();
        mutex.lock(&a);
        mutex.unlock(&b);
    }

    #[test]
    fn ownership_passes_to_waiters_in_arrival_order() {
        let mutex = Arc::new(KMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = KThread::new();
        let b = KThread::new();
        let c = KThread::new();

        mutex.lock(&a);

        let (b_locked_tx, b_locked_rx) = mpsc::channel();
        let (b_release_tx, b_release_rx) = mpsc::channel::<()>();
        let waiter_b = {
            let (mutex, order, b) = (mutex.clone(), order.clone(), b.clone());
            thread::spawn(move || {
                mutex.lock(&b);
                order.lock().unwrap().push('B');
                b_locked_tx.send(()).unwrap();
                b_release_rx.recv().unwrap();
                mutex.unlock(&b);
            })
        };
        wait_for_waiters(&mutex, 1);

        let waiter_c = {
            let (mutex, order, c) = (mutex.clone(), order.clone(), c.clone());
            thread::spawn(move || {
                mutex.lock(&c);
                order.lock().unwrap().push('C');
                mutex.unlock(&c);
            })
        };
        wait_for_waiters(&mutex, 2);

        mutex.unlock(&a);
        // Handed straight to B; the mutex never became free.
        assert!(Arc::ptr_eq(&mutex.holder().unwrap(), &b));
        assert_eq!(mutex.waiters(), 1);

        b_locked_rx.recv().unwrap();
        b_release_tx.send(()).unwrap();
        waiter_b.join().unwrap();
        waiter_c.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!['B', 'C']);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn cancelled_waiter_gives_up() {
        let mutex = Arc::new(KMutex::new());
        let a = KThread::new();
        let b = KThread::new();
        mutex.lock(&a);

        let waiter = {
            let (mutex, b) = (mutex.clone(), b.clone());
            thread::spawn(move || mutex.lock_cancellable(&b))
        };
        wait_for_waiters(&mutex, 1);

        b.cancel();
        assert_eq!(waiter.join().unwrap(), Err(Cancelled));
        assert_eq!(mutex.waiters(), 0);
        assert!(Arc::ptr_eq(&mutex.holder().unwrap(), &a));

        mutex.unlock(&a);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn cancelled_thread_fails_fast_on_contended_lock() {
        let mutex = KMutex::new();
        let a = KThread::new();
        let b = KThread::new();
        mutex.lock(&a);

        b.cancel();
        assert_eq!(mutex.lock_cancellable(&b), Err(Cancelled));
        assert_eq!(mutex.waiters(), 0);
    }

    #[test]
    fn handoff_to_cancelled_waiter_is_released() {
        let mutex = KMutex::new();
        let a = KThread::new();
        let b = KThread::new();
        mutex.lock(&a);

        // B queues, is handed the lock, then gets cancelled before it runs.
        assert_eq!(mutex.acquire_or_enqueue(&b, true), Ok(Acquire::Queued));
        mutex.unlock(&a);
        b.cancel();

        assert!(Arc::ptr_eq(&mutex.holder().unwrap(), &b));
        b.suspend();
        assert_eq!(mutex.finish_cancellable_wait(&b), Err(Cancelled));
        assert!(!mutex.is_locked());
    }

    #[test]
    fn cancelled_handoff_passes_lock_to_next_waiter() {
        let mutex = KMutex::new();
        let a = KThread::new();
        let b = KThread::new();
        let c = KThread::new();
        mutex.lock(&a);

        assert_eq!(mutex.acquire_or_enqueue(&b, true), Ok(Acquire::Queued));
        assert_eq!(mutex.acquire_or_enqueue(&c, false), Ok(Acquire::Queued));
        mutex.unlock(&a);
        b.cancel();

        b.suspend();
        assert_eq!(mutex.finish_cancellable_wait(&b), Err(Cancelled));
        assert!(Arc::ptr_eq(&mutex.holder().unwrap(), &c));
        assert_eq!(c.state(), crate::ThreadState::Running);
    }

    #[test]
    fn woken_waiter_keeps_lock() {
        let mutex = KMutex::new();
        let a = KThread::new();
        let b = KThread::new();
        mutex.lock(&a);

        assert_eq!(mutex.acquire_or_enqueue(&b, true), Ok(Acquire::Queued));
        mutex.unlock(&a);
        b.suspend();
        assert_eq!(mutex.finish_cancellable_wait(&b), Ok(()));
        assert!(Arc::ptr_eq(&mutex.holder().unwrap(), &b));
    }

    #[test]
    fn free_lock_is_taken_even_when_cancelled() {
        let mutex = KMutex::new();
        let a = KThread::new();
        a.cancel();
        assert_eq!(mutex.lock_cancellable(&a), Ok(()));
        assert!(mutex.is_locked());
    }
}
