//! Condition variable.
//!
//! `wait` is atomic-unlock-and-sleep: the caller's guard is released after
//! this thread is queued, and the reject flag guarantees a signal arriving
//! in the gap before the block is not lost.
//!
//! Ordering restriction: the external mutex is released before the condvar's
//! internal one, which is only sound because no external mutex in this
//! kernel ever routes back into the same condvar's internals. Keep it that
//! way.

use super::{KMutex, KMutexGuard, Waiter};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

pub struct Condvar {
    queue: KMutex<VecDeque<Arc<Waiter>>>,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            queue: KMutex::new(VecDeque::new()),
        }
    }

    /// Release `guard`, sleep until signalled, then re-acquire the mutex.
    pub fn wait<'a, T: ?Sized>(&self, guard: KMutexGuard<'a, T>) -> KMutexGuard<'a, T> {
        let waiter = Arc::new(Waiter::new(crate::scheduler::current_tid()));

        let mut queue = self.queue.lock();
        queue.push_back(waiter.clone());
        // Once the external mutex opens, a signaller can already see us in
        // the queue; the reject flag covers the window until we block.
        let mutex = guard.unlock();
        drop(queue);

        while waiter.reject.load(Ordering::SeqCst) == 0 {
            crate::scheduler::thr::kern_deschedule(&waiter.reject);
        }

        mutex.lock()
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        let mut queue = self.queue.lock();
        if let Some(waiter) = queue.pop_front() {
            waiter.reject.store(1, Ordering::SeqCst);
            let _ = crate::scheduler::thr::make_runnable(waiter.tid);
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let mut queue = self.queue.lock();
        while let Some(waiter) = queue.pop_front() {
            waiter.reject.store(1, Ordering::SeqCst);
            let _ = crate::scheduler::thr::make_runnable(waiter.tid);
        }
    }
}

impl Default for Condvar {
    fn default() -> Condvar {
        Condvar::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_with_no_waiters_is_a_no_op() {
        let cv = Condvar::new();
        cv.signal();
        cv.broadcast();
    }
}
