//! Counting semaphore.

use super::{KMutex, Waiter};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

struct SemState {
    count: i32,
    waiters: VecDeque<Arc<Waiter>>,
}

pub struct Semaphore {
    state: KMutex<SemState>,
}

impl Semaphore {
    pub fn new(count: i32) -> Semaphore {
        Semaphore {
            state: KMutex::new(SemState {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take a resource, blocking until one is signalled.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        state.count -= 1;
        if state.count < 0 {
            let waiter = Arc::new(Waiter::new(crate::scheduler::current_tid()));
            state.waiters.push_back(waiter.clone());
            drop(state);
            // Only a signal may wake us; anything else goes back to sleep.
            while waiter.reject.load(Ordering::SeqCst) == 0 {
                crate::scheduler::thr::kern_deschedule(&waiter.reject);
            }
        }
    }

    /// Release a resource, waking the longest-waiting thread if any.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        state.count += 1;
        if state.count <= 0 {
            if let Some(waiter) = state.waiters.pop_front() {
                waiter.reject.store(1, Ordering::SeqCst);
                let _ = crate::scheduler::thr::make_runnable(waiter.tid);
            }
        }
    }

    /// Current count; negative means that many threads are blocked. The
    /// keyboard uses this to decide whether a readline is pending.
    pub fn value(&self) -> i32 {
        self.state.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepaid_wait_does_not_block() {
        let sem = Semaphore::new(0);
        sem.signal();
        sem.signal();
        assert_eq!(sem.value(), 2);
        sem.wait();
        sem.wait();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn value_goes_negative_per_blocked_waiter() {
        let sem = Semaphore::new(3);
        sem.wait();
        assert_eq!(sem.value(), 2);
    }
}
